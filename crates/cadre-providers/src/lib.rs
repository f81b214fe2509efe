// Provider interface and capability-gated router.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use cadre_core::{CadreError, Result};
use cadre_types::{AgentRole, ProviderCapabilities, RoleRequirements, StreamChunk};

/// Callback receiving streamed provider output.
pub type ChunkSink<'a> = &'a (dyn Fn(StreamChunk) + Send + Sync);

/// An execution backend: a concrete LLM client or an external CLI agent.
///
/// Implementations are black boxes; the router only sees capabilities and
/// bounds concurrency by `max_concurrent_agents`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    /// Run one prompt for the given role and agent, returning the final
    /// text.
    async fn run(&self, role: AgentRole, agent_id: &str, prompt: &str) -> Result<String>;

    /// Streaming variant. Backends without native streaming inherit this
    /// default, which still delivers exactly one `Completed` chunk.
    async fn run_streaming(
        &self,
        role: AgentRole,
        agent_id: &str,
        prompt: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String> {
        let text = self.run(role, agent_id, prompt).await?;
        on_chunk(StreamChunk::Completed(text.clone()));
        Ok(text)
    }

    async fn is_healthy(&self, _agent_id: &str) -> bool {
        true
    }

    /// Ask the backend to stop the in-flight turn for an agent.
    async fn interrupt(&self, _agent_id: &str) -> Result<()> {
        Ok(())
    }

    /// Release any per-agent resources.
    async fn cleanup(&self, _agent_id: &str) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct Registered {
    provider: Arc<dyn Provider>,
    /// Gates in-flight calls to this backend, counted across roles.
    permits: Arc<Semaphore>,
}

/// Routes each role to the best-suited registered backend.
///
/// Selection: providers whose capabilities satisfy the role's requirements,
/// highest priority first, registration order breaking ties. Registration is
/// dynamic and safe under concurrent readers.
pub struct ProviderRouter {
    providers: RwLock<Vec<Registered>>,
    requirements: RwLock<HashMap<AgentRole, RoleRequirements>>,
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            requirements: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        let caps = provider.capabilities();
        let permits = Arc::new(Semaphore::new(caps.max_concurrent_agents.max(1)));
        tracing::debug!(
            "registered provider {} (priority {}, max {} concurrent)",
            caps.name,
            caps.priority,
            caps.max_concurrent_agents
        );
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Registered { provider, permits });
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let before = providers.len();
        providers.retain(|r| r.provider.capabilities().name != name);
        providers.len() != before
    }

    pub fn list_providers(&self) -> Vec<ProviderCapabilities> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.provider.capabilities())
            .collect()
    }

    /// Override the capability requirements of a role.
    pub fn set_requirements(&self, role: AgentRole, requirements: RoleRequirements) {
        self.requirements
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(role, requirements);
    }

    pub fn requirements_for(&self, role: AgentRole) -> RoleRequirements {
        self.requirements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&role)
            .copied()
            .unwrap_or_else(|| RoleRequirements::defaults_for(role))
    }

    /// Synthetic capability record for the whole pool: booleans OR,
    /// concurrency summed, priority maxed.
    pub fn capabilities(&self) -> ProviderCapabilities {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        let mut iter = providers.iter().map(|r| r.provider.capabilities());
        let Some(first) = iter.next() else {
            return ProviderCapabilities::new("router").with_max_concurrent(0);
        };
        let mut union = iter.fold(first, |acc, caps| acc.union(&caps));
        union.name = "router".to_string();
        union
    }

    /// Select the backend for a role without dispatching to it.
    pub fn select(&self, role: AgentRole) -> Result<Arc<dyn Provider>> {
        self.pick(role).map(|(provider, _)| provider)
    }

    fn pick(&self, role: AgentRole) -> Result<(Arc<dyn Provider>, Arc<Semaphore>)> {
        let requirements = self.requirements_for(role);
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());

        let mut best: Option<(&Registered, i32)> = None;
        for registered in providers.iter() {
            let caps = registered.provider.capabilities();
            if !requirements.satisfied_by(&caps) {
                continue;
            }
            // Strictly-greater keeps the earliest registration on ties.
            match best {
                Some((_, priority)) if caps.priority <= priority => {}
                _ => best = Some((registered, caps.priority)),
            }
        }

        match best {
            Some((registered, _)) => {
                Ok((registered.provider.clone(), registered.permits.clone()))
            }
            None => {
                tracing::warn!("no registered provider satisfies role {}", role);
                Err(CadreError::NoSuitableProvider(role.to_string()))
            }
        }
    }

    /// Select a backend for the role and run the prompt, holding one of the
    /// provider's permits for the duration of the call.
    pub async fn run(&self, role: AgentRole, agent_id: &str, prompt: &str) -> Result<String> {
        let (provider, permits) = self.pick(role)?;
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|_| CadreError::Provider("provider permit pool closed".to_string()))?;
        provider.run(role, agent_id, prompt).await
    }

    /// Streaming dispatch with the same selection and gating as `run`.
    pub async fn run_streaming(
        &self,
        role: AgentRole,
        agent_id: &str,
        prompt: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String> {
        let (provider, permits) = self.pick(role)?;
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|_| CadreError::Provider("provider permit pool closed".to_string()))?;
        provider.run_streaming(role, agent_id, prompt, on_chunk).await
    }

    /// Interrupt an agent's in-flight turn on the backend serving its role.
    pub async fn interrupt(&self, role: AgentRole, agent_id: &str) -> Result<()> {
        let (provider, _) = self.pick(role)?;
        provider.interrupt(agent_id).await
    }

    /// Shut down every registered backend.
    pub async fn shutdown_all(&self) -> Result<()> {
        let providers: Vec<Arc<dyn Provider>> = {
            self.providers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|r| r.provider.clone())
                .collect()
        };
        for provider in providers {
            if let Err(e) = provider.shutdown().await {
                tracing::warn!(
                    "provider {} failed to shut down: {}",
                    provider.capabilities().name,
                    e
                );
            }
        }
        Ok(())
    }
}
