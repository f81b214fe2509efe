// Backend process pool
//
// One long-lived subprocess per pool key, reused across prompts while it
// stays healthy. Dead processes are reaped and respawned behind a circuit
// breaker so a crash-looping backend cannot spin hot.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex as StdMutex, OnceLock, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use cadre_core::{CadreError, Result};

const LINE_CHANNEL_CAPACITY: usize = 256;

/// How to launch a backend process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Backend identity: same identity means the process may be reused.
    pub fn identity(&self) -> String {
        let mut identity = self.program.clone();
        for arg in &self.args {
            identity.push(' ');
            identity.push_str(arg);
        }
        identity
    }
}

/// Circuit state for a pooled backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tracks consecutive spawn/stream failures per pool key and blocks respawn
/// attempts during the cooldown window.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    max_failures: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            max_failures,
            cooldown,
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.failure_count >= self.max_failures {
            tracing::warn!("circuit opened after {} failures", self.failure_count);
            self.state = CircuitState::Open;
        }
    }

    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(last) = self.last_failure {
                    if last.elapsed() >= self.cooldown {
                        tracing::info!("circuit entering half-open state");
                        self.state = CircuitState::HalfOpen;
                        return true;
                    }
                }
                false
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

struct PooledEntry {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    /// The reader task sends stdout lines through whatever sender is
    /// current; re-acquiring swaps in a fresh channel so the newest handle
    /// owns the stream.
    line_tx: Arc<Mutex<mpsc::Sender<String>>>,
    breaker: CircuitBreaker,
}

/// Writing half of a process attachment.
#[derive(Clone)]
pub struct ProcessSink {
    stdin: Arc<Mutex<ChildStdin>>,
}

impl ProcessSink {
    /// Write one wire line to the backend's stdin.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CadreError::Session(format!("stdin write failed: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| CadreError::Session(format!("stdin write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| CadreError::Session(format!("stdin flush failed: {}", e)))?;
        Ok(())
    }
}

/// Live attachment to a pooled process.
pub struct ProcessHandle {
    stdin: Arc<Mutex<ChildStdin>>,
    pub lines: mpsc::Receiver<String>,
}

impl ProcessHandle {
    /// Write one wire line to the backend's stdin.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        ProcessSink {
            stdin: self.stdin.clone(),
        }
        .send_line(line)
        .await
    }

    /// Split into the writing half and the stdout line stream.
    pub fn split(self) -> (ProcessSink, mpsc::Receiver<String>) {
        (ProcessSink { stdin: self.stdin }, self.lines)
    }
}

/// Pool of backend subprocesses keyed by caller-chosen identity.
pub struct ProcessPool {
    inner: Mutex<HashMap<String, PooledEntry>>,
    grace: Duration,
}

impl ProcessPool {
    pub fn new(grace: Duration) -> Arc<Self> {
        let pool = Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            grace,
        });
        register_pool(&pool);
        pool
    }

    /// Attach to the process for `key`, spawning or respawning as needed. A
    /// healthy live process is reused; a dead one is reaped first.
    pub async fn acquire(&self, key: &str, spec: &ProcessSpec) -> Result<ProcessHandle> {
        let mut inner = self.inner.lock().await;

        let reaping = if let Some(entry) = inner.get_mut(key) {
            match entry.child.try_wait() {
                Ok(None) => {
                    // Alive: hand the stream to this (newest) handle.
                    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
                    *entry.line_tx.lock().await = tx;
                    return Ok(ProcessHandle {
                        stdin: entry.stdin.clone(),
                        lines: rx,
                    });
                }
                Ok(Some(status)) => {
                    tracing::warn!("backend for {} exited with {}; respawning", key, status);
                    true
                }
                Err(e) => {
                    tracing::warn!("backend for {} is unreachable ({}); respawning", key, e);
                    true
                }
            }
        } else {
            false
        };

        let mut breaker = CircuitBreaker::default();
        if reaping {
            if let Some(mut dead) = inner.remove(key) {
                dead.breaker.record_failure();
                breaker = dead.breaker;
            }
        }

        if !breaker.can_execute() {
            return Err(CadreError::Session(format!(
                "backend for {} is cooling down after repeated failures",
                key
            )));
        }

        let entry = spawn_entry(key, spec, breaker)?;
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        *entry.line_tx.lock().await = tx;
        let handle = ProcessHandle {
            stdin: entry.stdin.clone(),
            lines: rx,
        };
        inner.insert(key.to_string(), entry);
        Ok(handle)
    }

    pub async fn record_success(&self, key: &str) {
        if let Some(entry) = self.inner.lock().await.get_mut(key) {
            entry.breaker.record_success();
        }
    }

    pub async fn record_failure(&self, key: &str) {
        if let Some(entry) = self.inner.lock().await.get_mut(key) {
            entry.breaker.record_failure();
        }
    }

    pub async fn is_alive(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(key) {
            Some(entry) => matches!(entry.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Wait out the grace period for a clean exit, then force-kill.
    pub async fn shutdown(&self, key: &str) -> Result<()> {
        let entry = self.inner.lock().await.remove(key);
        if let Some(entry) = entry {
            reap(entry.child, self.grace, key).await;
        }
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        let entries: Vec<(String, PooledEntry)> = self.inner.lock().await.drain().collect();
        for (key, entry) in entries {
            reap(entry.child, self.grace, &key).await;
        }
    }
}

fn spawn_entry(key: &str, spec: &ProcessSpec, breaker: CircuitBreaker) -> Result<PooledEntry> {
    tracing::info!("spawning backend for {}: {}", key, spec.identity());

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // No orphans on abnormal exit: the runtime reaps children when the
        // pool (or the process) goes away.
        .kill_on_drop(true);
    for (k, v) in &spec.envs {
        command.env(k, v);
    }

    let mut child = command
        .spawn()
        .map_err(|e| CadreError::Session(format!("failed to spawn {}: {}", spec.program, e)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| CadreError::Session("backend stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CadreError::Session("backend stdout unavailable".to_string()))?;
    let stderr = child.stderr.take();

    // Seed with a throwaway sender; acquire() installs the real one before
    // the entry becomes visible.
    let (seed_tx, _seed_rx) = mpsc::channel(1);
    let line_tx = Arc::new(Mutex::new(seed_tx));

    {
        let line_tx = line_tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let tx = line_tx.lock().await.clone();
                        // A dropped receiver just discards output until the
                        // next handle attaches.
                        let _ = tx.send(line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("stdout read error for {}: {}", key, e);
                        break;
                    }
                }
            }
            tracing::debug!("stdout drained for {}", key);
        });
    }

    if let Some(stderr) = stderr {
        let key = key.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("[{} stderr] {}", key, line);
            }
        });
    }

    Ok(PooledEntry {
        child,
        stdin: Arc::new(Mutex::new(stdin)),
        line_tx,
        breaker,
    })
}

async fn reap(mut child: Child, grace: Duration, key: &str) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!("backend for {} exited cleanly with {}", key, status);
        }
        Ok(Err(e)) => {
            tracing::warn!("waiting on backend for {} failed: {}", key, e);
        }
        Err(_) => {
            tracing::warn!("backend for {} ignored shutdown; killing", key);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

// One ambient registry of pools so process-wide teardown can reach every
// child. Tolerates reinitialisation: dead weak entries are purged on use.
static POOLS: OnceLock<StdMutex<Vec<Weak<ProcessPool>>>> = OnceLock::new();

fn register_pool(pool: &Arc<ProcessPool>) {
    let pools = POOLS.get_or_init(|| StdMutex::new(Vec::new()));
    let mut pools = pools.lock().unwrap_or_else(|e| e.into_inner());
    pools.retain(|weak| weak.strong_count() > 0);
    pools.push(Arc::downgrade(pool));
}

/// Kill every pooled backend process. Wired into host shutdown paths; safe
/// to call repeatedly.
pub async fn teardown_all_pools() {
    let pools: Vec<Arc<ProcessPool>> = {
        let Some(registry) = POOLS.get() else {
            return;
        };
        let registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.iter().filter_map(|weak| weak.upgrade()).collect()
    };
    for pool in pools {
        pool.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_max_failures_and_cools_down() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn spec_identity_covers_program_and_args() {
        let spec = ProcessSpec::new("agent").arg("--serve").arg("--fast");
        assert_eq!(spec.identity(), "agent --serve --fast");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pool_round_trips_lines_through_cat() {
        let pool = ProcessPool::new(Duration::from_secs(1));
        let spec = ProcessSpec::new("/bin/cat");

        let mut handle = pool.acquire("s1", &spec).await.unwrap();
        handle.send_line("hello wire").await.unwrap();
        let echoed = handle.lines.recv().await.unwrap();
        assert_eq!(echoed, "hello wire");

        assert!(pool.is_alive("s1").await);
        pool.shutdown("s1").await.unwrap();
        assert!(!pool.is_alive("s1").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_process_is_reaped_and_respawned() {
        let pool = ProcessPool::new(Duration::from_secs(1));

        // `true` exits immediately, so the first acquire yields a corpse.
        let spec = ProcessSpec::new("/bin/true");
        let _ = pool.acquire("s1", &spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Re-acquiring with a healthy spec reaps the corpse and respawns.
        let spec = ProcessSpec::new("/bin/cat");
        let mut handle = pool.acquire("s1", &spec).await.unwrap();
        handle.send_line("alive").await.unwrap();
        assert_eq!(handle.lines.recv().await.unwrap(), "alive");

        pool.shutdown_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reacquire_hands_stream_to_newest_handle() {
        let pool = ProcessPool::new(Duration::from_secs(1));
        let spec = ProcessSpec::new("/bin/cat");

        let first = pool.acquire("s1", &spec).await.unwrap();
        let mut second = pool.acquire("s1", &spec).await.unwrap();

        first.send_line("routed").await.unwrap();
        assert_eq!(second.lines.recv().await.unwrap(), "routed");

        pool.shutdown_all().await;
    }
}
