// Subprocess-backed provider
//
// Bridges the session runtime into the provider interface: each agent gets
// a lazily-connected session over a pooled backend process speaking the
// framed JSON protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use cadre_core::{CadreError, Result};
use cadre_providers::{ChunkSink, Provider};
use cadre_types::{AgentRole, ProviderCapabilities, StopReason, StreamChunk};

use crate::manager::{session_key, SessionManager};
use crate::session::SessionState;

/// Provider implementation for an external CLI coding agent.
pub struct CliAgentProvider {
    caps: ProviderCapabilities,
    manager: Arc<SessionManager>,
}

impl CliAgentProvider {
    pub fn new(caps: ProviderCapabilities, manager: Arc<SessionManager>) -> Self {
        Self { caps, manager }
    }
}

#[async_trait]
impl Provider for CliAgentProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        self.caps.clone()
    }

    async fn run(&self, _role: AgentRole, agent_id: &str, prompt: &str) -> Result<String> {
        let session = self.manager.connect(&session_key(agent_id)).await?;
        let outcome = session.send_prompt(prompt).await?;
        match outcome.stop_reason {
            StopReason::Error => Err(CadreError::Provider(format!(
                "backend turn for agent {} ended with an error",
                agent_id
            ))),
            _ => Ok(outcome.text),
        }
    }

    async fn run_streaming(
        &self,
        _role: AgentRole,
        agent_id: &str,
        prompt: &str,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String> {
        let session = self.manager.connect(&session_key(agent_id)).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let callback = Arc::new(move |chunk: &str| {
            let _ = tx.send(chunk.to_string());
        });

        let turn = session.send_prompt_with(prompt, Some(callback));
        tokio::pin!(turn);

        loop {
            tokio::select! {
                outcome = &mut turn => {
                    // Flush chunks that raced with completion.
                    while let Ok(chunk) = rx.try_recv() {
                        on_chunk(StreamChunk::Delta(chunk));
                    }
                    let outcome = outcome?;
                    if outcome.stop_reason == StopReason::Error {
                        return Err(CadreError::Provider(format!(
                            "backend turn for agent {} ended with an error",
                            agent_id
                        )));
                    }
                    on_chunk(StreamChunk::Completed(outcome.text.clone()));
                    return Ok(outcome.text);
                }
                Some(chunk) = rx.recv() => {
                    on_chunk(StreamChunk::Delta(chunk));
                }
            }
        }
    }

    async fn is_healthy(&self, agent_id: &str) -> bool {
        match self.manager.get(&session_key(agent_id)).await {
            Some(session) => matches!(
                session.state().await,
                SessionState::Connected | SessionState::Working
            ),
            None => false,
        }
    }

    async fn interrupt(&self, agent_id: &str) -> Result<()> {
        if let Some(session) = self.manager.get(&session_key(agent_id)).await {
            session.cancel_prompt().await?;
        }
        Ok(())
    }

    async fn cleanup(&self, agent_id: &str) -> Result<()> {
        self.manager.disconnect(&session_key(agent_id)).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.manager.shutdown_all().await
    }
}
