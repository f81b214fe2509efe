// Session manager
//
// Owns the mapping from session key to live session, plus the process pool
// behind them. Sessions are created lazily on first use for an agent and
// torn down on explicit cleanup or workspace shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use cadre_core::Result;

use crate::process::ProcessPool;
use crate::session::{Session, SessionConfig};

/// Deterministic session key for an agent.
pub fn session_key(agent_id: &str) -> String {
    format!("agent-{}", agent_id)
}

pub struct SessionManager {
    pool: Arc<ProcessPool>,
    default_config: SessionConfig,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(default_config: SessionConfig) -> Arc<Self> {
        let pool = ProcessPool::new(default_config.grace_period);
        Arc::new(Self {
            pool,
            default_config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> Arc<ProcessPool> {
        self.pool.clone()
    }

    pub async fn get(&self, key: &str) -> Option<Session> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// The session for `key`, created (but not connected) if absent.
    pub async fn get_or_create(&self, key: &str) -> Session {
        self.get_or_create_with(key, self.default_config.clone())
            .await
    }

    pub async fn get_or_create_with(&self, key: &str, config: SessionConfig) -> Session {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key, self.pool.clone(), config))
            .clone()
    }

    /// The session for `key`, connected and ready for prompts.
    pub async fn connect(&self, key: &str) -> Result<Session> {
        let session = self.get_or_create(key).await;
        session.connect().await?;
        Ok(session)
    }

    pub async fn disconnect(&self, key: &str) -> Result<()> {
        let session = self.sessions.lock().await.remove(key);
        if let Some(session) = session {
            session.disconnect().await?;
        }
        Ok(())
    }

    /// Disconnect every session and stop every pooled backend.
    pub async fn shutdown_all(&self) -> Result<()> {
        let sessions: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.disconnect().await {
                tracing::warn!("session {} failed to disconnect: {}", session.key(), e);
            }
        }
        self.pool.shutdown_all().await;
        Ok(())
    }
}
