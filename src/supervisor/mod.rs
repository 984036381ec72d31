//! # Supervisor Module
//!
//! Owns the lifecycle of the external audio node process.
//!
//! ## Architecture
//!
//! ```text
//! NOT_STARTED → STARTING → READY → STOPPED
//!                  ↑  ↓       ↓
//!             RESTARTING ← CRASHED
//! ```
//!
//! - **Binary**: downloaded once per release, tracked by a version marker
//! - **Launch**: version-conditioned runtime flags, own process group, output
//!   to `node.log`, readiness read from the node's stdout
//! - **Monitor**: polls the child every 0.5s; a JVM crash dump stops it for
//!   good, anything else gets a bounded restart
//! - **Connect**: websocket handshake, retried on timeout only
//!
//! Everything outside this module only sees [`NodeStatus`].

pub mod runtime;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::node::{ConnectError, ConnectParams, NodeConnector, NodeError, NodeSession};
use runtime::{JavaDetector, RuntimeDetector, RuntimeVersion};

pub const JAR_NAME: &str = "Lavalink.jar";
pub const VERSION_MARKER: &str = "Lavalink.jar.version";
pub const NODE_LOG: &str = "node.log";
pub const APPLICATION_YML: &str = "application.yml";

const READY_LINE: &str = "Lavalink is ready to accept connections.";
const FAILED_LINE: &str = "Web server failed to start";

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const CONNECT_ATTEMPTS: u32 = 5;
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle of the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    Starting,
    Ready,
    Crashed,
    Restarting,
    Stopped,
}

/// The only thing callers learn about the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network hiccup or server error. Another attempt may work.
    #[error("download failed, will retry: {0}")]
    Retryable(String),

    #[error("download failed: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unsupported machine architecture: {0}")]
    UnsupportedArch(String),

    #[error("unsupported Java runtime {0}, the node needs 11 to 21")]
    UnsupportedRuntime(RuntimeVersion),

    #[error("Java runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("unexpected `java -version` output: {0}")]
    UnexpectedRuntimeOutput(String),

    #[error("invalid version pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("node binary download failed: {0}")]
    Download(String),

    #[error("node binary download failed after {0} attempts")]
    DownloadExhausted(u32),

    #[error("node failed to start: {0}")]
    Launch(String),

    #[error("node did not become ready in time")]
    NotReady,

    #[error("node crashed, see {}", .dump.display())]
    Crashed { dump: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid node configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Connect(#[from] NodeError),

    #[error("node handshake timed out {0} times")]
    HandshakeExhausted(u32),
}

/// Fetches the node binary for a release into `dest`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeDownloader: Send + Sync {
    /// Returns the number of bytes written.
    async fn download(&self, release: &str, dest: &Path) -> Result<u64, DownloadError>;
}

/// Downloads release jars over HTTP. `{release}` in the template is replaced
/// with the release tag.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    http: reqwest::Client,
    url_template: String,
}

impl HttpDownloader {
    pub fn new(url_template: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("open-music-audio/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            url_template: url_template.into(),
        })
    }

    pub fn url_for(&self, release: &str) -> String {
        self.url_template.replace("{release}", release)
    }
}

#[async_trait]
impl NodeDownloader for HttpDownloader {
    async fn download(&self, release: &str, dest: &Path) -> Result<u64, DownloadError> {
        let url = self.url_for(release);
        info!("📥 Descargando {} desde {}", JAR_NAME, url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DownloadError::Retryable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadError::Fatal(format!(
                "release {release} has not been published"
            )));
        }
        if !status.is_success() {
            return Err(DownloadError::Retryable(format!("HTTP {status}")));
        }

        let partial = dest.with_extension("jar.part");
        let retry = |e: std::io::Error| DownloadError::Retryable(e.to_string());
        let mut file = tokio::fs::File::create(&partial).await.map_err(retry)?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| DownloadError::Retryable(e.to_string()))?;
            file.write_all(&chunk).await.map_err(retry)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(retry)?;
        drop(file);

        tokio::fs::rename(&partial, dest).await.map_err(retry)?;
        info!("✅ {} descargado ({} bytes)", JAR_NAME, written);
        Ok(written)
    }
}

/// Everything the supervisor needs from the configuration.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub external: bool,
    pub node_dir: PathBuf,
    pub java_path: String,
    pub java_xms: String,
    pub java_xmx: Option<String>,
    pub release: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub start_retries: u32,
    pub download_retries: u32,
    pub download_backoff: Duration,
    pub connect_backoff: Duration,
    pub ready_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            external: config.use_external_node,
            node_dir: config.node_dir.clone(),
            java_path: config.java_path.clone(),
            java_xms: config.java_xms.clone(),
            java_xmx: config.java_xmx.clone(),
            release: config.node_release.clone(),
            host: config.node_host.clone(),
            port: config.node_rest_port,
            password: config.node_password.clone(),
            start_retries: config.node_start_retries,
            download_retries: config.node_download_retries,
            download_backoff: Duration::from_secs(3),
            connect_backoff: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(120),
        }
    }

    fn jar_path(&self) -> PathBuf {
        self.node_dir.join(JAR_NAME)
    }
}

/// `application.yml` as the node expects it.
#[derive(Debug, Serialize)]
struct NodeApplication {
    server: ServerSection,
    lavalink: LavalinkSection,
    logging: LoggingSection,
}

#[derive(Debug, Serialize)]
struct ServerSection {
    port: u16,
    address: String,
}

#[derive(Debug, Serialize)]
struct LavalinkSection {
    server: LavalinkServer,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LavalinkServer {
    password: String,
    sources: Sources,
    buffer_duration_ms: u32,
    frame_buffer_duration_ms: u32,
    track_stuck_threshold_ms: u32,
    youtube_playlist_load_limit: u32,
    player_update_interval: u32,
    youtube_search_enabled: bool,
    soundcloud_search_enabled: bool,
}

#[derive(Debug, Serialize)]
struct Sources {
    youtube: bool,
    bandcamp: bool,
    soundcloud: bool,
    twitch: bool,
    vimeo: bool,
    http: bool,
    local: bool,
}

#[derive(Debug, Serialize)]
struct LoggingSection {
    file: LoggingFile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoggingFile {
    max_history: u32,
    max_size: String,
    path: String,
}

impl NodeApplication {
    fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            server: ServerSection {
                port: settings.port,
                address: settings.host.clone(),
            },
            lavalink: LavalinkSection {
                server: LavalinkServer {
                    password: settings.password.clone(),
                    sources: Sources {
                        youtube: true,
                        bandcamp: true,
                        soundcloud: true,
                        twitch: true,
                        vimeo: true,
                        http: true,
                        local: false,
                    },
                    buffer_duration_ms: 400,
                    frame_buffer_duration_ms: 1000,
                    track_stuck_threshold_ms: 10_000,
                    youtube_playlist_load_limit: 100,
                    player_update_interval: 1,
                    youtube_search_enabled: true,
                    soundcloud_search_enabled: true,
                },
            },
            logging: LoggingSection {
                file: LoggingFile {
                    max_history: 15,
                    max_size: "10MB".to_string(),
                    path: "./logs/".to_string(),
                },
            },
        }
    }
}

/// State shared between the supervisor and its monitor task.
struct Shared {
    settings: SupervisorSettings,
    state: watch::Sender<NodeState>,
    status: watch::Sender<NodeStatus>,
}

impl Shared {
    fn set_state(&self, state: NodeState) {
        debug!("Estado del nodo: {:?}", state);
        self.state.send_replace(state);
    }

    fn set_status(&self, status: NodeStatus) {
        self.status.send_replace(status);
    }

    /// Unrecoverable: audio stays off for the rest of the session.
    fn fail(&self, reason: String) {
        error!("❌ Audio deshabilitado: {}", reason);
        self.set_state(NodeState::Stopped);
        self.set_status(NodeStatus::Unavailable(reason));
    }

    async fn write_application(&self) -> Result<(), SupervisorError> {
        let yaml = serde_yaml::to_string(&NodeApplication::from_settings(&self.settings))?;
        tokio::fs::write(self.settings.node_dir.join(APPLICATION_YML), yaml).await?;
        Ok(())
    }

    /// Starts the node and waits for its ready line. The child is killed if
    /// it never gets there.
    async fn launch(&self, args: &[String]) -> Result<Child, SupervisorError> {
        self.write_application().await?;

        let log_path = self.settings.node_dir.join(NODE_LOG);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let mut command = Command::new(&self.settings.java_path);
        command
            .args(args)
            .current_dir(&self.settings.node_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log.try_clone()?));
        #[cfg(unix)]
        command.process_group(0);
        command.kill_on_drop(true);

        let mut child = command.spawn()?;
        info!(
            "🚀 Nodo lanzado (PID {:?}): {} {}",
            child.id(),
            self.settings.java_path,
            args.join(" ")
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Launch("node stdout not captured".to_string()))?;
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(pump_output(stdout, tokio::fs::File::from_std(log), ready_tx));

        match tokio::time::timeout(self.settings.ready_timeout, ready_rx).await {
            Ok(Ok(Readiness::Ready)) => {
                info!("✅ Nodo listo para aceptar conexiones");
                Ok(child)
            }
            Ok(Ok(Readiness::Failed(line))) => {
                terminate(&mut child).await;
                Err(SupervisorError::Launch(line))
            }
            Ok(Err(_)) => {
                terminate(&mut child).await;
                Err(SupervisorError::Launch(format!(
                    "node exited early, see {}",
                    log_path.display()
                )))
            }
            Err(_) => {
                terminate(&mut child).await;
                Err(SupervisorError::NotReady)
            }
        }
    }
}

#[derive(Debug)]
enum Readiness {
    Ready,
    Failed(String),
}

/// Copies node stdout into the log file, reporting the first ready or
/// failure line.
async fn pump_output(stdout: ChildStdout, mut log: tokio::fs::File, ready: oneshot::Sender<Readiness>) {
    let mut ready = Some(ready);
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let verdict = if line.contains(READY_LINE) {
            Some(Readiness::Ready)
        } else if line.contains(FAILED_LINE) {
            Some(Readiness::Failed(line.trim().to_string()))
        } else {
            None
        };
        if let Some(verdict) = verdict {
            if let Some(tx) = ready.take() {
                let _ = tx.send(verdict);
            }
        }

        if log.write_all(line.as_bytes()).await.is_err() || log.write_all(b"\n").await.is_err() {
            warn!("No se pudo escribir en {}", NODE_LOG);
        }
    }
    let _ = log.flush().await;
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("El nodo ya había terminado: {}", e);
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!("🛑 Nodo detenido ({})", status),
        Ok(Err(e)) => warn!("Error esperando al nodo: {}", e),
        Err(_) => warn!("El nodo no terminó en {:?}", TERMINATE_GRACE),
    }
}

/// JVM crash dump left behind by process `pid`, if any.
pub fn crash_dump(node_dir: &Path, pid: u32) -> Option<PathBuf> {
    let path = node_dir.join(format!("hs_err_pid{pid}.log"));
    path.exists().then_some(path)
}

pub struct NodeSupervisor {
    shared: Arc<Shared>,
    downloader: Arc<dyn NodeDownloader>,
    detector: Arc<dyn RuntimeDetector>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl NodeSupervisor {
    pub fn new(settings: SupervisorSettings, downloader: Arc<dyn NodeDownloader>) -> Self {
        let (state, _) = watch::channel(NodeState::NotStarted);
        let (status, _) = watch::channel(NodeStatus::Unavailable("node not started".to_string()));
        Self {
            shared: Arc::new(Shared {
                settings,
                state,
                status,
            }),
            downloader,
            detector: Arc::new(JavaDetector),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Replaces the machine/runtime detector used by [`NodeSupervisor::start`].
    pub fn with_detector(mut self, detector: Arc<dyn RuntimeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.shared.status.subscribe()
    }

    pub fn state(&self) -> NodeState {
        *self.shared.state.borrow()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// Marks audio unavailable for the session.
    pub fn disable(&self, reason: impl Into<String>) {
        self.shared.fail(reason.into());
    }

    /// Makes sure the jar for the configured release is on disk.
    pub async fn ensure_binary_present(&self) -> Result<PathBuf, SupervisorError> {
        let settings = &self.shared.settings;
        tokio::fs::create_dir_all(&settings.node_dir).await?;

        let jar = settings.jar_path();
        let marker = settings.node_dir.join(VERSION_MARKER);
        let installed = tokio::fs::read_to_string(&marker)
            .await
            .ok()
            .map(|s| s.trim().to_string());

        if tokio::fs::try_exists(&jar).await.unwrap_or(false)
            && installed.as_deref() == Some(settings.release.as_str())
        {
            debug!("{} {} ya presente", JAR_NAME, settings.release);
            return Ok(jar);
        }

        let attempts = settings.download_retries.max(1);
        for attempt in 1..=attempts {
            match self.downloader.download(&settings.release, &jar).await {
                Ok(_) => {
                    tokio::fs::write(&marker, &settings.release).await?;
                    return Ok(jar);
                }
                Err(DownloadError::Fatal(reason)) => return Err(SupervisorError::Download(reason)),
                Err(DownloadError::Retryable(reason)) => {
                    warn!(
                        "⚠️ Descarga fallida (intento {}/{}): {}",
                        attempt, attempts, reason
                    );
                    if attempt < attempts {
                        tokio::time::sleep(settings.download_backoff).await;
                    }
                }
            }
        }
        Err(SupervisorError::DownloadExhausted(attempts))
    }

    /// Brings the managed node up and starts its monitor. In external mode
    /// there is nothing to start. Any error disables audio for the session.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.shared.settings.external {
            info!("🌐 Usando nodo externo en {}", self.shared.settings.host);
            return Ok(());
        }

        match self.start_managed().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn start_managed(&self) -> Result<(), SupervisorError> {
        runtime::check_arch(&self.detector.arch())?;
        let settings = &self.shared.settings;
        let version = self.detector.detect(&settings.java_path).await?;
        let jar = self.ensure_binary_present().await?;
        let args = runtime::launch_args(version, &settings.java_xms, settings.java_xmx.as_deref(), &jar);

        self.shared.set_state(NodeState::Starting);
        let attempts = settings.start_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.shared.launch(&args).await {
                Ok(child) => {
                    let handle = tokio::spawn(monitor(
                        self.shared.clone(),
                        child,
                        args,
                        self.shutdown.child_token(),
                    ));
                    *self.monitor.lock() = Some(handle);
                    return Ok(());
                }
                Err(e) => {
                    warn!("⚠️ Arranque del nodo fallido ({}/{}): {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(SupervisorError::NotReady))
    }

    /// Performs the websocket handshake, retrying timeouts. Publishes
    /// [`NodeStatus::Ready`] on success; any other failure is final.
    pub async fn connect(
        &self,
        connector: &dyn NodeConnector,
        params: &ConnectParams,
    ) -> Result<NodeSession, SupervisorError> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match connector.connect(params).await {
                Ok(session) => {
                    self.shared.set_state(NodeState::Ready);
                    self.shared.set_status(NodeStatus::Ready);
                    return Ok(session);
                }
                Err(ConnectError::Timeout) => {
                    warn!(
                        "⏳ Handshake con el nodo agotado (intento {}/{})",
                        attempt, CONNECT_ATTEMPTS
                    );
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(self.shared.settings.connect_backoff).await;
                    }
                }
                Err(ConnectError::Fatal(e)) => {
                    self.shared.fail(format!("node handshake failed: {e}"));
                    return Err(e.into());
                }
            }
        }

        let err = SupervisorError::HandshakeExhausted(CONNECT_ATTEMPTS);
        self.shared.fail(err.to_string());
        Err(err)
    }

    /// Terminates the node and waits for it. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("El monitor del nodo terminó con error: {}", e);
            }
        }
        self.shared.set_state(NodeState::Stopped);
        self.shared
            .set_status(NodeStatus::Unavailable("audio subsystem shut down".to_string()));
        info!("🛑 Supervisor del nodo detenido");
    }
}

/// Watches the child until shutdown. Owns it exclusively.
async fn monitor(shared: Arc<Shared>, mut child: Child, args: Vec<String>, shutdown: CancellationToken) {
    let mut pid = child.id();
    let mut restarts = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                terminate(&mut child).await;
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let exit = match child.try_wait() {
            Ok(None) => continue,
            Ok(Some(exit)) => exit,
            Err(e) => {
                warn!("No se pudo consultar el estado del nodo: {}", e);
                continue;
            }
        };

        shared.set_state(NodeState::Crashed);
        warn!("💥 El nodo terminó inesperadamente ({})", exit);

        if let Some(dump) = pid.and_then(|pid| crash_dump(&shared.settings.node_dir, pid)) {
            shared.fail(SupervisorError::Crashed { dump }.to_string());
            return;
        }
        if restarts >= shared.settings.start_retries {
            shared.fail(format!("node crashed {} times, giving up", restarts + 1));
            return;
        }

        restarts += 1;
        shared.set_state(NodeState::Restarting);
        shared.set_status(NodeStatus::Unavailable("node restarting".to_string()));
        info!("🔄 Reiniciando nodo ({}/{})", restarts, shared.settings.start_retries);

        let relaunch = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Apagado durante el reinicio del nodo, se aborta el arranque");
                return;
            }
            relaunch = shared.launch(&args) => relaunch,
        };
        match relaunch {
            Ok(new_child) => {
                child = new_child;
                pid = child.id();
                // Arriba de nuevo; falta el handshake
                shared.set_state(NodeState::Starting);
            }
            Err(e) => {
                shared.fail(e.to_string());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::runtime::MockRuntimeDetector;
    use super::*;
    use crate::node::socket::MockNodeConnector;
    use crate::node::MockNodeClient;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> SupervisorSettings {
        SupervisorSettings {
            external: false,
            node_dir: dir.path().to_path_buf(),
            java_path: "java".to_string(),
            java_xms: "64M".to_string(),
            java_xmx: None,
            release: "4.0.8".to_string(),
            host: "localhost".to_string(),
            port: 2333,
            password: "pw".to_string(),
            start_retries: 5,
            download_retries: 5,
            download_backoff: Duration::ZERO,
            connect_backoff: Duration::ZERO,
            ready_timeout: Duration::from_secs(1),
        }
    }

    fn params() -> ConnectParams {
        ConnectParams {
            host: "localhost".to_string(),
            password: "pw".to_string(),
            rest_port: 2333,
            ws_port: 2333,
            timeout: Duration::from_secs(1),
            user_id: 1,
        }
    }

    fn session() -> NodeSession {
        NodeSession {
            session_id: "s1".to_string(),
            client: Arc::new(MockNodeClient::new()),
            lifeline: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn retryable_download_is_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockNodeDownloader::new();
        let mut seq = mockall::Sequence::new();
        downloader
            .expect_download()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(DownloadError::Retryable("503".to_string())));
        downloader
            .expect_download()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, dest| {
                std::fs::write(dest, b"jar").unwrap();
                Ok(3)
            });

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(downloader));
        let jar = supervisor.ensure_binary_present().await.unwrap();

        assert_eq!(jar, dir.path().join(JAR_NAME));
        assert_eq!(
            std::fs::read_to_string(dir.path().join(VERSION_MARKER)).unwrap(),
            "4.0.8"
        );
    }

    #[tokio::test]
    async fn fatal_download_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockNodeDownloader::new();
        downloader
            .expect_download()
            .times(1)
            .returning(|_, _| Err(DownloadError::Fatal("not published".to_string())));

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(downloader));
        let err = supervisor.ensure_binary_present().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Download(_)));
    }

    fn java_17() -> Arc<MockRuntimeDetector> {
        let mut detector = MockRuntimeDetector::new();
        detector.expect_arch().return_const("x86_64".to_string());
        detector
            .expect_detect()
            .returning(|_| Ok(RuntimeVersion { major: 17, minor: 0 }));
        Arc::new(detector)
    }

    #[tokio::test]
    async fn fatal_download_disables_audio_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockNodeDownloader::new();
        downloader
            .expect_download()
            .times(1)
            .returning(|_, _| Err(DownloadError::Fatal("404".to_string())));

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(downloader)).with_detector(java_17());
        let status = supervisor.status();

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Download(_)));
        assert_eq!(supervisor.state(), NodeState::Stopped);
        assert!(matches!(&*status.borrow(), NodeStatus::Unavailable(reason) if reason.contains("404")));
    }

    #[tokio::test]
    async fn exhausted_downloads_disable_audio_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockNodeDownloader::new();
        downloader
            .expect_download()
            .times(5)
            .returning(|_, _| Err(DownloadError::Retryable("reset".to_string())));

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(downloader)).with_detector(java_17());
        let status = supervisor.status();

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::DownloadExhausted(5)));
        assert_eq!(supervisor.state(), NodeState::Stopped);
        assert!(matches!(&*status.borrow(), NodeStatus::Unavailable(_)));
    }

    #[tokio::test]
    async fn unsupported_arch_never_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockNodeDownloader::new();
        downloader.expect_download().never();
        let mut detector = MockRuntimeDetector::new();
        detector.expect_arch().return_const("armv7l".to_string());
        detector.expect_detect().never();

        let supervisor =
            NodeSupervisor::new(settings(&dir), Arc::new(downloader)).with_detector(Arc::new(detector));
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnsupportedArch(_)));
        assert_eq!(supervisor.state(), NodeState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_interrupts_a_pending_restart() {
        let dir = tempfile::tempdir().unwrap();
        // El relanzamiento nunca imprime la línea de listo
        let supervisor = NodeSupervisor::new(
            SupervisorSettings {
                java_path: "sh".to_string(),
                ready_timeout: Duration::from_secs(120),
                ..settings(&dir)
            },
            Arc::new(MockNodeDownloader::new()),
        );
        let shared = supervisor.shared.clone();
        let mut state = shared.state.subscribe();

        let crashed = Command::new("sh").args(["-c", "exit 1"]).spawn().unwrap();
        let args = vec!["-c".to_string(), "sleep 60".to_string()];
        let token = CancellationToken::new();
        let handle = tokio::spawn(monitor(shared, crashed, args, token.clone()));

        state
            .wait_for(|s| *s == NodeState::Restarting)
            .await
            .unwrap();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockNodeDownloader::new();
        downloader
            .expect_download()
            .times(5)
            .returning(|_, _| Err(DownloadError::Retryable("reset".to_string())));

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(downloader));
        let err = supervisor.ensure_binary_present().await.unwrap_err();
        assert!(matches!(err, SupervisorError::DownloadExhausted(5)));
    }

    #[tokio::test]
    async fn current_release_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(JAR_NAME), b"jar").unwrap();
        std::fs::write(dir.path().join(VERSION_MARKER), "4.0.8\n").unwrap();

        let mut downloader = MockNodeDownloader::new();
        downloader.expect_download().never();

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(downloader));
        supervisor.ensure_binary_present().await.unwrap();
    }

    #[tokio::test]
    async fn handshake_timeouts_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = MockNodeConnector::new();
        let mut seq = mockall::Sequence::new();
        connector
            .expect_connect()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(ConnectError::Timeout));
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(session()));

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(MockNodeDownloader::new()));
        let status = supervisor.status();
        let session = supervisor.connect(&connector, &params()).await.unwrap();

        assert_eq!(session.session_id, "s1");
        assert_eq!(*status.borrow(), NodeStatus::Ready);
        assert_eq!(supervisor.state(), NodeState::Ready);
    }

    #[tokio::test]
    async fn fatal_handshake_disables_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = MockNodeConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(ConnectError::Fatal(NodeError::Closed)));

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(MockNodeDownloader::new()));
        let status = supervisor.status();
        assert!(supervisor.connect(&connector, &params()).await.is_err());
        assert!(matches!(&*status.borrow(), NodeStatus::Unavailable(_)));
    }

    #[tokio::test]
    async fn handshake_gives_up_after_five_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = MockNodeConnector::new();
        connector
            .expect_connect()
            .times(5)
            .returning(|_| Err(ConnectError::Timeout));

        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(MockNodeDownloader::new()));
        let err = supervisor.connect(&connector, &params()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::HandshakeExhausted(5)));
        assert_eq!(supervisor.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = NodeSupervisor::new(settings(&dir), Arc::new(MockNodeDownloader::new()));
        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn external_mode_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockNodeDownloader::new();
        downloader.expect_download().never();

        let supervisor = NodeSupervisor::new(
            SupervisorSettings {
                external: true,
                ..settings(&dir)
            },
            Arc::new(downloader),
        );
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), NodeState::NotStarted);
    }

    #[test]
    fn crash_dump_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(crash_dump(dir.path(), 42), None);

        std::fs::write(dir.path().join("hs_err_pid42.log"), "SIGSEGV").unwrap();
        assert_eq!(
            crash_dump(dir.path(), 42),
            Some(dir.path().join("hs_err_pid42.log"))
        );
        assert_eq!(crash_dump(dir.path(), 43), None);
    }

    #[test]
    fn application_yml_carries_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = serde_yaml::to_string(&NodeApplication::from_settings(&settings(&dir))).unwrap();
        assert!(yaml.contains("port: 2333"));
        assert!(yaml.contains("password: pw"));
        assert!(yaml.contains("bufferDurationMs: 400"));
    }
}
