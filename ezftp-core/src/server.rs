//! FTP server lifecycle
//!
//! State machine: `Stopped -> Starting -> Running -> Stopped`, with a direct
//! `Starting -> Stopped` on any startup failure.
//!
//! The protocol engine (libunftp) runs on one dedicated OS thread hosting its
//! own tokio runtime, so callers need no async context. Stopping is bounded:
//! clients get `shutdown_grace_secs` to finish, then after `force_close_secs`
//! more the accept loop is abandoned and the runtime torn down, dropping any
//! connection still open.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use libunftp::auth::{AuthenticationError, Authenticator, Credentials, DefaultUser};
use libunftp::notification::{EventMeta, PresenceEvent, PresenceListener};
use libunftp::options::Shutdown;
use libunftp::ServerBuilder;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use unftp_sbe_fs::Filesystem;

use crate::auth::{verify_password, Credential, CredentialError, CredentialStore};
use crate::config::ServerConfig;
use crate::network::{resolve_local_address, NetworkError};

const GREETING: &str = "ezftp ready";

/// Runtime teardown budget once the accept loop has returned
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long `start` waits for the engine to accept connections
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Username libunftp reports for sessions that never logged in
const ANONYMOUS_SESSION_USER: &str = "unknown";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid port {0}: must be in 1-65535")]
    InvalidPort(u32),

    #[error("Invalid credentials")]
    Authentication,

    #[error(transparent)]
    Credentials(CredentialError),

    #[error("Server is already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("Failed to prepare upload directory {path}: {source}")]
    UploadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch server thread: {0}")]
    Launch(String),

    #[error("Server thread panicked")]
    ThreadPanicked,
}

impl From<CredentialError> for ServerError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Authentication => ServerError::Authentication,
            other => ServerError::Credentials(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
}

/// Observed client activity, for live connection display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    LoggedIn { username: String, trace_id: String },
    LoggedOut { username: String, trace_id: String },
}

/// Parameters for [`ServerLifecycle::start`]
///
/// `port` is taken as entered so out-of-range values can be rejected rather
/// than truncated.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub username: String,
    pub password: String,
    pub port: u32,
    pub upload_dir: PathBuf,
    /// Skip address resolution and bind here
    pub bind_addr: Option<IpAddr>,
}

impl StartRequest {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        port: u32,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            port,
            upload_dir: upload_dir.into(),
            bind_addr: None,
        }
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }
}

/// A running server: bound address, stop signals and the engine thread
pub struct ServerSession {
    bound_address: SocketAddr,
    username: String,
    upload_dir: PathBuf,
    events: broadcast::Sender<ConnectionEvent>,
    graceful_tx: Option<oneshot::Sender<()>>,
    force_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("bound_address", &self.bound_address)
            .field("username", &self.username)
            .field("upload_dir", &self.upload_dir)
            .finish_non_exhaustive()
    }
}

impl ServerSession {
    pub fn bound_address(&self) -> SocketAddr {
        self.bound_address
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Receive login/logout events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// False once the engine thread has exited, e.g. after a listen failure
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn signal_stop(&mut self) {
        if let Some(tx) = self.graceful_tx.take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.force_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Signal the engine and wait for its thread to exit
    fn shutdown(mut self) -> Result<(), ServerError> {
        self.signal_stop();
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| ServerError::ThreadPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        // Thread winds down on its own within the configured bound.
        self.signal_stop();
    }
}

/// Owns the at-most-one server session of its caller
pub struct ServerLifecycle {
    store: CredentialStore,
    options: ServerConfig,
    state: ServerState,
    session: Option<ServerSession>,
}

impl ServerLifecycle {
    pub fn new(store: CredentialStore, options: ServerConfig) -> Self {
        Self {
            store,
            options,
            state: ServerState::Stopped,
            session: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn session(&self) -> Option<&ServerSession> {
        self.session.as_ref()
    }

    /// Verify credentials, bind, and launch the engine in the background
    pub fn start(&mut self, request: StartRequest) -> Result<&ServerSession, ServerError> {
        if let Some(session) = &self.session {
            return Err(ServerError::AlreadyRunning(session.bound_address));
        }

        self.state = ServerState::Starting;
        match self.launch(request) {
            Ok(session) => {
                self.state = ServerState::Running;
                Ok(&*self.session.insert(session))
            }
            Err(e) => {
                self.state = ServerState::Stopped;
                tracing::warn!("FTP server not started: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the running session; no-op when stopped
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let addr = session.bound_address;
        tracing::info!("Stopping FTP server on {}", addr);
        let result = session.shutdown();
        self.state = ServerState::Stopped;
        tracing::info!("FTP server on {} stopped", addr);
        result
    }

    fn launch(&self, request: StartRequest) -> Result<ServerSession, ServerError> {
        let port = u16::try_from(request.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ServerError::InvalidPort(request.port))?;

        let credential = self.store.authenticate(&request.password)?;
        if credential.username != request.username {
            return Err(ServerError::Authentication);
        }

        let upload_dir = prepare_upload_dir(&request.upload_dir)?;

        let ip = match request.bind_addr {
            Some(ip) => ip,
            None => resolve_local_address()?,
        };
        let addr = SocketAddr::new(ip, port);

        // Surface "address in use" synchronously; the engine binds its own socket.
        TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (graceful_tx, graceful_rx) = oneshot::channel();
        let (force_tx, force_rx) = oneshot::channel();

        let engine = EngineParams {
            addr,
            root: upload_dir.clone(),
            authenticator: SingleUserAuthenticator::new(credential),
            presence: PresenceForwarder::new(events.clone()),
            grace: self.options.shutdown_grace(),
            force_close: self.options.force_close(),
            idle_timeout_secs: self.options.idle_session_timeout_secs,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ezftp-engine")
            .enable_all()
            .build()
            .map_err(|e| ServerError::Launch(e.to_string()))?;

        let (failure_tx, failure_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("ezftp-server".to_string())
            .spawn(move || run_engine(runtime, engine, graceful_rx, force_rx, failure_tx))
            .map_err(|e| ServerError::Launch(e.to_string()))?;

        let session = ServerSession {
            bound_address: addr,
            username: request.username,
            upload_dir,
            events,
            graceful_tx: Some(graceful_tx),
            force_tx: Some(force_tx),
            thread: Some(thread),
        };

        if let Err(e) = wait_until_accepting(&session, &failure_rx) {
            let _ = session.shutdown();
            return Err(e);
        }

        tracing::info!(
            user = %session.username,
            dir = %session.upload_dir.display(),
            "FTP server started on {}",
            addr
        );
        Ok(session)
    }
}

/// Block until the engine accepts TCP connections on the session address.
///
/// Fails if the engine reports an error, its thread exits, or
/// [`STARTUP_TIMEOUT`] passes first.
fn wait_until_accepting(
    session: &ServerSession,
    failure_rx: &std::sync::mpsc::Receiver<String>,
) -> Result<(), ServerError> {
    let addr = session.bound_address;
    let local = SocketAddr::new(connectable_ip(addr.ip()), addr.port());
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    let mut backoff = Duration::from_millis(5);

    loop {
        if let Ok(message) = failure_rx.try_recv() {
            return Err(ServerError::Launch(message));
        }
        if !session.is_alive() {
            let message = failure_rx
                .try_recv()
                .unwrap_or_else(|_| "server thread exited during startup".to_string());
            return Err(ServerError::Launch(message));
        }
        if TcpStream::connect_timeout(&local, Duration::from_millis(250)).is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ServerError::Bind {
                addr,
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "server did not start accepting connections",
                ),
            });
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(Duration::from_millis(100));
    }
}

fn connectable_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

fn prepare_upload_dir(dir: &Path) -> Result<PathBuf, ServerError> {
    let io_err = |source| ServerError::UploadDir {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    std::fs::canonicalize(dir).map_err(io_err)
}

struct EngineParams {
    addr: SocketAddr,
    root: PathBuf,
    authenticator: SingleUserAuthenticator,
    presence: PresenceForwarder,
    grace: Duration,
    force_close: Duration,
    idle_timeout_secs: u64,
}

/// Body of the server thread
fn run_engine(
    runtime: tokio::runtime::Runtime,
    params: EngineParams,
    graceful_rx: oneshot::Receiver<()>,
    force_rx: oneshot::Receiver<()>,
    failure_tx: std::sync::mpsc::Sender<String>,
) {
    let EngineParams {
        addr,
        root,
        authenticator,
        presence,
        grace,
        force_close,
        idle_timeout_secs,
    } = params;

    let outcome = runtime.block_on(async move {
        let server = ServerBuilder::with_authenticator(
            Box::new(move || {
                // Filesystem::new panics on a missing root; recreate it if removed mid-session
                if let Err(e) = std::fs::create_dir_all(&root) {
                    tracing::error!("Upload root {} unavailable: {}", root.display(), e);
                }
                Filesystem::new(root.clone())
            }),
            Arc::new(authenticator),
        )
        .greeting(GREETING)
        .idle_session_timeout(idle_timeout_secs)
        .notify_presence(presence)
        .shutdown_indicator(async move {
            let _ = graceful_rx.await;
            Shutdown::new().grace_period(grace)
        })
        .build();

        let server = match server {
            Ok(server) => server,
            Err(e) => return Err(e.to_string()),
        };

        let forced = async move {
            let _ = force_rx.await;
            tokio::time::sleep(grace + force_close).await;
        };

        tokio::select! {
            result = server.listen(addr.to_string()) => result.map_err(|e| e.to_string()),
            _ = forced => {
                tracing::warn!("Clients on {} did not disconnect in time, forcing close", addr);
                Ok(())
            }
        }
    });

    if let Err(e) = outcome {
        tracing::error!("FTP server on {} failed: {}", addr, e);
        let _ = failure_tx.send(e);
    }
    runtime.shutdown_timeout(TEARDOWN_TIMEOUT);
}

/// Grants the one configured account full access to the upload root.
///
/// Holds only the stored hash, so the plaintext entered at startup is not
/// kept for the lifetime of the session.
struct SingleUserAuthenticator {
    credential: Arc<Credential>,
}

// libunftp prints its builder, authenticator included, in log spans
impl std::fmt::Debug for SingleUserAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleUserAuthenticator")
            .field("username", &self.credential.username)
            .finish_non_exhaustive()
    }
}

impl SingleUserAuthenticator {
    fn new(credential: Credential) -> Self {
        Self {
            credential: Arc::new(credential),
        }
    }
}

#[async_trait]
impl Authenticator<DefaultUser> for SingleUserAuthenticator {
    async fn authenticate(
        &self,
        username: &str,
        creds: &Credentials,
    ) -> Result<DefaultUser, AuthenticationError> {
        if username != self.credential.username {
            return Err(AuthenticationError::BadUser);
        }
        let Some(password) = creds.password.clone() else {
            return Err(AuthenticationError::BadPassword);
        };

        // argon2 verification blocks for tens of milliseconds
        let credential = Arc::clone(&self.credential);
        let verified = tokio::task::spawn_blocking(move || {
            verify_password(&password, &credential.password_hash)
        })
        .await
        .unwrap_or(false);

        if verified {
            Ok(DefaultUser)
        } else {
            tracing::debug!(user = %username, "FTP login rejected");
            Err(AuthenticationError::BadPassword)
        }
    }
}

/// Forwards login/logout to observers; logouts of sessions that never
/// logged in are dropped
#[derive(Debug)]
struct PresenceForwarder {
    events: broadcast::Sender<ConnectionEvent>,
    logged_in: Mutex<HashSet<String>>,
}

impl PresenceForwarder {
    fn new(events: broadcast::Sender<ConnectionEvent>) -> Self {
        Self {
            events,
            logged_in: Mutex::new(HashSet::new()),
        }
    }

    fn forward(&self, event: PresenceEvent, username: String, trace_id: String) {
        let Ok(mut logged_in) = self.logged_in.lock() else {
            return;
        };
        let event = match event {
            PresenceEvent::LoggedIn => {
                tracing::info!(user = %username, "FTP client logged in");
                logged_in.insert(trace_id.clone());
                ConnectionEvent::LoggedIn { username, trace_id }
            }
            PresenceEvent::LoggedOut => {
                if !logged_in.remove(&trace_id) || username == ANONYMOUS_SESSION_USER {
                    return;
                }
                tracing::info!(user = %username, "FTP client logged out");
                ConnectionEvent::LoggedOut { username, trace_id }
            }
        };
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PresenceListener for PresenceForwarder {
    async fn receive_presence_event(&self, e: PresenceEvent, m: EventMeta) {
        self.forward(e, m.username, m.trace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    fn fast_options() -> ServerConfig {
        ServerConfig {
            shutdown_grace_secs: 0,
            force_close_secs: 1,
            ..ServerConfig::default()
        }
    }

    fn lifecycle(dir: &TempDir) -> ServerLifecycle {
        let store = CredentialStore::new(dir.path().join("creds.cfg"));
        store.set_credentials("alice", "s3cret").unwrap();
        ServerLifecycle::new(store, fast_options())
    }

    fn free_port() -> u32 {
        let listener = TcpListener::bind((LOCALHOST, 0)).unwrap();
        u32::from(listener.local_addr().unwrap().port())
    }

    fn request(dir: &TempDir, password: &str, port: u32) -> StartRequest {
        StartRequest::new("alice", password, port, dir.path().join("up")).bind_addr(LOCALHOST)
    }

    #[test]
    fn test_invalid_ports_rejected() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);

        for port in [0, 65536, 70000] {
            let result = server.start(request(&dir, "s3cret", port));
            assert!(matches!(result, Err(ServerError::InvalidPort(p)) if p == port));
            assert_eq!(server.state(), ServerState::Stopped);
        }
    }

    #[test]
    fn test_wrong_password_rejected() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);

        let result = server.start(request(&dir, "wrong", free_port()));
        assert!(matches!(result, Err(ServerError::Authentication)));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!dir.path().join("up").exists());
    }

    #[test]
    fn test_wrong_username_rejected() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);

        let req = StartRequest::new("mallory", "s3cret", free_port(), dir.path().join("up"))
            .bind_addr(LOCALHOST);
        assert!(matches!(server.start(req), Err(ServerError::Authentication)));
    }

    #[test]
    fn test_missing_credentials() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("absent.cfg"));
        let mut server = ServerLifecycle::new(store, fast_options());

        let result = server.start(request(&dir, "s3cret", free_port()));
        assert!(matches!(
            result,
            Err(ServerError::Credentials(CredentialError::NotFound(_)))
        ));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_port_in_use() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);

        let occupied = TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = u32::from(occupied.local_addr().unwrap().port());

        let result = server.start(request(&dir, "s3cret", port));
        assert!(matches!(result, Err(ServerError::Bind { .. })));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_start_twice_then_stop_twice() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);
        let port = free_port();

        let session = server.start(request(&dir, "s3cret", port)).unwrap();
        assert_eq!(session.bound_address(), SocketAddr::new(LOCALHOST, port as u16));
        assert_eq!(session.username(), "alice");
        assert!(session.upload_dir().is_dir());
        assert_eq!(server.state(), ServerState::Running);

        let again = server.start(request(&dir, "s3cret", free_port()));
        assert!(matches!(again, Err(ServerError::AlreadyRunning(_))));
        assert_eq!(server.state(), ServerState::Running);

        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.session().is_none());

        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);
        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_port_released_after_stop() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);
        let port = free_port();

        server.start(request(&dir, "s3cret", port)).unwrap();
        server.stop().unwrap();

        server.start(request(&dir, "s3cret", port)).unwrap();
        assert_eq!(server.state(), ServerState::Running);
        server.stop().unwrap();
    }

    #[test]
    fn test_accepts_connections_as_soon_as_started() {
        let dir = TempDir::new().unwrap();
        let mut server = lifecycle(&dir);

        let addr = server.start(request(&dir, "s3cret", free_port())).unwrap().bound_address();
        assert_eq!(server.state(), ServerState::Running);

        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(1));
        assert!(stream.is_ok(), "connect right after start failed: {:?}", stream.err());
        drop(stream);

        server.stop().unwrap();
    }

    #[test]
    fn test_connectable_ip_maps_unspecified_to_loopback() {
        assert_eq!(connectable_ip("0.0.0.0".parse().unwrap()), LOCALHOST);
        assert_eq!(connectable_ip("::".parse().unwrap()), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(connectable_ip("192.0.2.4".parse().unwrap()), "192.0.2.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_authenticator_debug_hides_hash() {
        let credential = Credential {
            username: "alice".to_string(),
            password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
        };
        let shown = format!("{:?}", SingleUserAuthenticator::new(credential));
        assert!(shown.contains("alice"));
        assert!(!shown.contains("argon2"));
    }

    #[test]
    fn test_logout_without_login_not_forwarded() {
        let (events, mut rx) = broadcast::channel(8);
        let forwarder = PresenceForwarder::new(events);

        forwarder.forward(PresenceEvent::LoggedOut, "unknown".to_string(), "t0".to_string());
        forwarder.forward(PresenceEvent::LoggedIn, "alice".to_string(), "t1".to_string());
        forwarder.forward(PresenceEvent::LoggedOut, "alice".to_string(), "t1".to_string());
        forwarder.forward(PresenceEvent::LoggedOut, "alice".to_string(), "t1".to_string());

        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::LoggedIn {
                username: "alice".to_string(),
                trace_id: "t1".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::LoggedOut {
                username: "alice".to_string(),
                trace_id: "t1".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
