//! In-memory remote host for testing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::connection::{ConnectFailure, Connector, HostTarget};
use crate::error::{DispatchError, DispatchResult};
use crate::path::join_remote;
use crate::remote::{CommandOutput, RemoteSession, RemoteStat};

#[derive(Debug, Default)]
struct MockState {
    home: String,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, u64>,
    commands: Vec<String>,
    uploads: Vec<(String, String)>,
    closes: u32,
    stat_failure: Option<String>,
    submit_failure: Option<String>,
}

/// Point-in-time copy of the mock host's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockSnapshot {
    /// Existing remote directories.
    pub dirs: BTreeSet<String>,

    /// Remote files and their sizes.
    pub files: BTreeMap<String, u64>,

    /// Every command executed, in order.
    pub commands: Vec<String>,

    /// `(local, remote)` pairs for every upload, in order.
    pub uploads: Vec<(String, String)>,

    /// Number of times the session was closed.
    pub closes: u32,
}

/// A remote host simulated in memory.
///
/// Clones share state, so a test can keep a handle while the dispatcher owns
/// another and inspect the result afterwards, or run a second dispatch against
/// the same remote state.
#[derive(Debug, Clone)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
    job_counter: Arc<AtomicU64>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    /// Create a host with home directory `/home/mock`.
    pub fn new() -> Self {
        Self::with_home("/home/mock")
    }

    /// Create a host with the given home directory.
    pub fn with_home(home: &str) -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        let mut current = String::new();
        for part in home.split('/').filter(|p| !p.is_empty()) {
            current = format!("{current}/{part}");
            dirs.insert(current.clone());
        }

        Self {
            state: Arc::new(Mutex::new(MockState {
                home: home.to_string(),
                dirs,
                ..MockState::default()
            })),
            job_counter: Arc::new(AtomicU64::new(1000)),
        }
    }

    /// Create a directory and all its ancestors.
    pub fn with_dir(self, path: &str) -> Self {
        {
            let mut state = self.state();
            let mut current = String::new();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                current = format!("{current}/{part}");
                state.dirs.insert(current.clone());
            }
        }
        self
    }

    /// Make every stat fail with a non-"not found" error.
    pub fn fail_stat(self, message: &str) -> Self {
        self.state().stat_failure = Some(message.to_string());
        self
    }

    /// Make job submissions exit non-zero with `message` on stderr.
    pub fn fail_submit(self, message: &str) -> Self {
        self.state().submit_failure = Some(message.to_string());
        self
    }

    /// Copy out the current state.
    pub fn snapshot(&self) -> MockSnapshot {
        let state = self.state();
        MockSnapshot {
            dirs: state.dirs.clone(),
            files: state.files.clone(),
            commands: state.commands.clone(),
            uploads: state.uploads.clone(),
            closes: state.closes,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(state: &MockState, path: &str) -> String {
        if path.starts_with('/') {
            path.trim_end_matches('/').to_string()
        } else {
            join_remote(&state.home, path.trim_end_matches('/'))
        }
    }

    fn parent_exists(state: &MockState, path: &str) -> bool {
        match path.rsplit_once('/') {
            Some(("", _)) => true,
            Some((parent, _)) => state.dirs.contains(parent),
            None => false,
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command: &str) -> DispatchResult<CommandOutput> {
        let mut state = self.state();
        state.commands.push(command.to_string());

        if command.trim() == "echo $HOME" {
            return Ok(CommandOutput {
                stdout: format!("{}\n", state.home),
                ..CommandOutput::default()
            });
        }
        if command.starts_with("chmod ") {
            return Ok(CommandOutput::default());
        }
        if let Some(message) = &state.submit_failure {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: message.clone(),
                exit_status: 1,
            });
        }

        let job_id = self.job_counter.fetch_add(1, Ordering::SeqCst);
        Ok(CommandOutput {
            stdout: format!("Job <{job_id}> is submitted to default queue <normal>.\n"),
            ..CommandOutput::default()
        })
    }

    async fn stat(&self, path: &str) -> DispatchResult<RemoteStat> {
        let state = self.state();
        if let Some(message) = &state.stat_failure {
            return Err(DispatchError::Ssh(message.clone()));
        }

        let resolved = Self::resolve(&state, path);
        if state.dirs.contains(&resolved) {
            Ok(RemoteStat {
                is_dir: true,
                size: None,
            })
        } else if let Some(size) = state.files.get(&resolved) {
            Ok(RemoteStat {
                is_dir: false,
                size: Some(*size),
            })
        } else {
            Err(DispatchError::RemoteNotFound(path.to_string()))
        }
    }

    async fn mkdir(&self, path: &str) -> DispatchResult<()> {
        let mut state = self.state();
        let resolved = Self::resolve(&state, path);

        if state.dirs.contains(&resolved) || state.files.contains_key(&resolved) {
            return Err(DispatchError::Ssh(format!("{path}: file already exists")));
        }
        if !Self::parent_exists(&state, &resolved) {
            return Err(DispatchError::Ssh(format!("{path}: no such file")));
        }

        state.dirs.insert(resolved);
        Ok(())
    }

    async fn upload(&self, local: &Path, remote: &str) -> DispatchResult<u64> {
        let size = tokio::fs::metadata(local).await?.len();

        let mut state = self.state();
        let resolved = Self::resolve(&state, remote);
        if !Self::parent_exists(&state, &resolved) {
            return Err(DispatchError::Ssh(format!("{remote}: no such file")));
        }

        state.files.insert(resolved, size);
        state
            .uploads
            .push((local.to_string_lossy().into_owned(), remote.to_string()));
        Ok(size)
    }

    async fn close(&self) -> DispatchResult<()> {
        self.state().closes += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    None,
    Transient(u32),
    Auth,
    HostKey,
}

/// Connector that hands out a shared [`MockSession`] after scripted failures.
#[derive(Debug)]
pub struct MockConnector {
    session: MockSession,
    mode: FailureMode,
    attempts: AtomicU32,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Connector that succeeds on the first attempt.
    pub fn new() -> Self {
        Self::with_session(MockSession::new())
    }

    /// Connector that hands out clones of `session`.
    pub fn with_session(session: MockSession) -> Self {
        Self {
            session,
            mode: FailureMode::None,
            attempts: AtomicU32::new(0),
        }
    }

    /// Fail the first `count` attempts as unreachable.
    pub fn fail_transient(mut self, count: u32) -> Self {
        self.mode = FailureMode::Transient(count);
        self
    }

    /// Reject credentials on every attempt.
    pub fn fail_auth(mut self) -> Self {
        self.mode = FailureMode::Auth;
        self
    }

    /// Present a mismatching host key on every attempt.
    pub fn fail_host_key(mut self) -> Self {
        self.mode = FailureMode::HostKey;
        self
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The session handed out on success.
    pub fn session(&self) -> &MockSession {
        &self.session
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn open(&self, target: &HostTarget) -> Result<MockSession, ConnectFailure> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            FailureMode::Auth => Err(ConnectFailure::Auth(format!(
                "password rejected for {}",
                target.username
            ))),
            FailureMode::HostKey => Err(ConnectFailure::HostKey(format!(
                "{} presented an unexpected key",
                target.host
            ))),
            FailureMode::Transient(count) if attempt <= count => Err(ConnectFailure::Transient(
                format!("connection to {} refused", target.address()),
            )),
            _ => Ok(self.session.clone()),
        }
    }
}
