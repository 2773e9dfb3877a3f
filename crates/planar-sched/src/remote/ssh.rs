//! SSH session backed by libssh2.
//!
//! libssh2 is blocking, so every operation runs on tokio's blocking pool with
//! the session behind a mutex. The SFTP channel is opened on first use and
//! torn down exactly once by [`RemoteSession::close`].

use std::io::{self, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{Channel, CheckResult, ErrorCode, KnownHostFileKind, Session, Sftp};

use crate::connection::{ConnectFailure, Connector, HostTarget};
use crate::error::{DispatchError, DispatchResult};
use crate::remote::{CommandOutput, RemoteSession, RemoteStat};

/// TCP connect timeout for a single attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer size for file uploads.
const UPLOAD_BUFFER: usize = 1 << 20;

/// Pause between polls of a command that has produced no new output.
const EXEC_POLL: Duration = Duration::from_millis(10);

// libssh2 SFTP status codes.
const FX_NO_SUCH_FILE: i32 = 2;
const FX_NO_SUCH_PATH: i32 = 10;

/// Opens password-authenticated SSH sessions.
///
/// Host keys are checked against an OpenSSH `known_hosts` file. Unknown hosts
/// are trusted on first use and recorded; a changed key is rejected.
#[derive(Debug, Clone)]
pub struct SshConnector {
    known_hosts: Option<PathBuf>,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SshConnector {
    /// Use `~/.ssh/known_hosts`.
    pub fn new() -> Self {
        Self {
            known_hosts: dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")),
        }
    }

    /// Use a specific known-hosts file.
    pub fn with_known_hosts(path: impl Into<PathBuf>) -> Self {
        Self {
            known_hosts: Some(path.into()),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    async fn open(&self, target: &HostTarget) -> Result<SshSession, ConnectFailure> {
        let target = target.clone();
        let known_hosts = self.known_hosts.clone();
        tokio::task::spawn_blocking(move || open_blocking(&target, known_hosts.as_deref()))
            .await
            .map_err(|e| ConnectFailure::Transient(e.to_string()))?
    }
}

fn open_blocking(
    target: &HostTarget,
    known_hosts: Option<&Path>,
) -> Result<SshSession, ConnectFailure> {
    let transient = |e: &dyn std::fmt::Display| ConnectFailure::Transient(e.to_string());

    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| transient(&e))?
        .next()
        .ok_or_else(|| ConnectFailure::Transient(format!("no address for {}", target.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| transient(&e))?;

    let mut session = Session::new().map_err(|e| transient(&e))?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| transient(&e))?;

    if let Some(path) = known_hosts {
        verify_host_key(&session, target, path)?;
    }

    session
        .userauth_password(&target.username, &target.password)
        .map_err(|e| ConnectFailure::Auth(e.to_string()))?;
    if !session.authenticated() {
        return Err(ConnectFailure::Auth(format!(
            "server did not accept credentials for {}",
            target.username
        )));
    }

    Ok(SshSession {
        host: target.host.clone(),
        inner: Arc::new(Mutex::new(SshInner {
            session,
            sftp: None,
            closed: false,
        })),
    })
}

fn verify_host_key(
    session: &Session,
    target: &HostTarget,
    path: &Path,
) -> Result<(), ConnectFailure> {
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| ConnectFailure::Transient("server sent no host key".to_string()))?;

    let mut hosts = session
        .known_hosts()
        .map_err(|e| ConnectFailure::Transient(e.to_string()))?;
    if path.exists() {
        hosts
            .read_file(path, KnownHostFileKind::OpenSSH)
            .map_err(|e| ConnectFailure::Transient(e.to_string()))?;
    }

    match hosts.check_port(&target.host, target.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(ConnectFailure::HostKey(format!(
            "key for {} differs from {}",
            target.host,
            path.display()
        ))),
        CheckResult::Failure => Err(ConnectFailure::Transient(format!(
            "could not check host key for {}",
            target.host
        ))),
        CheckResult::NotFound => {
            tracing::warn!(
                "Unknown host key for {}, adding it to {}",
                target.host,
                path.display()
            );
            let entry = if target.port == 22 {
                target.host.clone()
            } else {
                format!("[{}]:{}", target.host, target.port)
            };
            hosts
                .add(&entry, key, "", key_type.into())
                .map_err(|e| ConnectFailure::Transient(e.to_string()))?;

            let written = path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .map_err(|e| e.to_string())
                .and_then(|()| {
                    hosts
                        .write_file(path, KnownHostFileKind::OpenSSH)
                        .map_err(|e| e.to_string())
                });
            if let Err(e) = written {
                tracing::warn!("Could not record host key in {}: {}", path.display(), e);
            }
            Ok(())
        }
    }
}

struct SshInner {
    session: Session,
    sftp: Option<Sftp>,
    closed: bool,
}

impl SshInner {
    fn sftp(&mut self) -> DispatchResult<&Sftp> {
        if self.closed {
            return Err(DispatchError::Ssh("session is closed".to_string()));
        }
        if self.sftp.is_none() {
            self.sftp = Some(self.session.sftp()?);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| DispatchError::Internal("SFTP channel unavailable".to_string()))
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput, String> {
        if self.closed {
            return Err("session is closed".to_string());
        }

        let mut channel = self.session.channel_session().map_err(|e| e.to_string())?;
        channel.exec(command).map_err(|e| e.to_string())?;

        // Both streams are read in turn; a command that fills its stderr
        // window stalls until stderr is read.
        self.session.set_blocking(false);
        let drained = drain_output(&mut channel, EXEC_POLL);
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(|e| e.to_string())?;

        channel.wait_close().map_err(|e| e.to_string())?;
        let exit_status = channel.exit_status().map_err(|e| e.to_string())?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status,
        })
    }
}

/// The two output streams of a running remote command.
trait ExecStreams {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// No more data will arrive on either stream.
    fn at_eof(&self) -> bool;
}

impl ExecStreams for Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr().read(buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }
}

/// Read stdout and stderr to the end, alternating between them.
///
/// Expects non-blocking streams: `WouldBlock` means no data yet.
fn drain_output<S: ExecStreams>(streams: &mut S, poll: Duration) -> io::Result<(String, String)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = vec![0u8; 32 * 1024];

    loop {
        let out = read_chunk(|b| streams.read_stdout(b), &mut buf, &mut stdout)?;
        let err = read_chunk(|b| streams.read_stderr(b), &mut buf, &mut stderr)?;
        if out || err {
            continue;
        }
        if streams.at_eof() {
            break;
        }
        std::thread::sleep(poll);
    }

    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

/// Append one read to `sink`; `Ok(false)` when nothing was read.
fn read_chunk(
    read: impl FnOnce(&mut [u8]) -> io::Result<usize>,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
) -> io::Result<bool> {
    match read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(n > 0)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// A live SSH session with a lazily opened SFTP channel.
pub struct SshSession {
    host: String,
    inner: Arc<Mutex<SshInner>>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Host this session is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    async fn blocking<T, F>(&self, f: F) -> DispatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SshInner) -> DispatchResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *guard)
        })
        .await?
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> DispatchResult<CommandOutput> {
        tracing::debug!("{}$ {}", self.host, command);
        let command = command.to_string();
        self.blocking(move |inner| {
            inner
                .exec(&command)
                .map_err(|message| DispatchError::RemoteCommand {
                    command: command.clone(),
                    message,
                })
        })
        .await
    }

    async fn stat(&self, path: &str) -> DispatchResult<RemoteStat> {
        let path = path.to_string();
        self.blocking(move |inner| match inner.sftp()?.stat(Path::new(&path)) {
            Ok(stat) => Ok(RemoteStat {
                is_dir: stat.is_dir(),
                size: stat.size,
            }),
            Err(e)
                if matches!(
                    e.code(),
                    ErrorCode::SFTP(FX_NO_SUCH_FILE) | ErrorCode::SFTP(FX_NO_SUCH_PATH)
                ) =>
            {
                Err(DispatchError::RemoteNotFound(path))
            }
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> DispatchResult<()> {
        tracing::debug!("{}: mkdir {}", self.host, path);
        let path = path.to_string();
        self.blocking(move |inner| Ok(inner.sftp()?.mkdir(Path::new(&path), 0o755)?))
            .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> DispatchResult<u64> {
        tracing::debug!("{}: put {} -> {}", self.host, local.display(), remote);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.blocking(move |inner| {
            let file = std::fs::File::open(&local)?;
            let mut reader = BufReader::with_capacity(UPLOAD_BUFFER, file);
            let mut remote_file = inner.sftp()?.create(Path::new(&remote))?;
            Ok(std::io::copy(&mut reader, &mut remote_file)?)
        })
        .await
    }

    async fn close(&self) -> DispatchResult<()> {
        let host = self.host.clone();
        self.blocking(move |inner| {
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            drop(inner.sftp.take());
            inner
                .session
                .disconnect(None, "dispatch complete", None)
                .map_err(DispatchError::from)?;
            tracing::info!("Closed SSH connection to {}", host);
            Ok(())
        })
        .await
    }
}
