//! Process supervisor - owns the worker process and its channel.
//!
//! Flow:
//! 1. Bind both channel sockets for a fresh session id
//! 2. Spawn the worker with the startup parameters as one opaque argument
//! 3. Wait for the worker to connect, bounded by the connect timeout; early exit or timeout
//!    kills and reaps the child
//! 4. Publish every received frame as a [`ProcessEvent`]
//! 5. On process exit: tear down the channel, then publish one `ProcessStopped`

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::channel::{ChannelEvent, ChannelWriter, spawn_receive_loop};
use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
use crate::bridge::transport::{ChannelEndpoint, ChannelListener, ChannelNamespace, DuplexStreams};
use crate::error::RemoteHostError;
use crate::startup::{self, StartupParameters};
use crate::worker::EXIT_STARTUP_RESOLUTION;

/// How long teardown waits for the receive loop to drain frames the worker wrote before it
/// exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Notification from the supervisor to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    DataReceived(Bytes),
    Disconnected,
    ProcessStopped(ExitInfo),
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The spawner must pass `token` to the worker unchanged as its last command-line argument.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, token: &str) -> Result<Child, SpawnError>;
}

/// Spawns `program [args..] <token>`.
///
/// stdin is closed; stdout and stderr are inherited so worker logs land in the parent's
/// streams. The child is killed if its handle is dropped.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, token: &str) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(token)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub connect_timeout: Duration,
    pub namespace: ChannelNamespace,
    pub max_frame_length: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            namespace: ChannelNamespace::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl SupervisorConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_namespace(mut self, namespace: ChannelNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

/// One worker process plus its channel, as seen by the client.
///
/// This abstraction enables testing the client without a real worker subprocess.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    fn session_id(&self) -> &str;

    /// Spawn the worker and complete the channel handshake.
    async fn start(&self, params: StartupParameters) -> Result<(), RemoteHostError>;

    /// Send one frame to the worker.
    async fn send(&self, payload: Bytes) -> Result<(), RemoteHostError>;

    /// Forcibly terminate the worker. Idempotent; returns immediately, completion is reported
    /// through `ProcessStopped`.
    fn kill(&self);

    fn is_running(&self) -> bool;

    fn pid(&self) -> Option<u32>;

    /// True if the process exited within `timeout` (or was never started).
    async fn wait_for_exit(&self, timeout: Duration) -> bool;
}

/// Creates one [`ProcessHost`] per session.
pub trait ProcessFactory: Send + Sync {
    fn create(&self, events: mpsc::UnboundedSender<ProcessEvent>) -> Arc<dyn ProcessHost>;
}

/// Factory producing [`WorkerProcess`]es.
pub struct WorkerProcessFactory {
    spawner: Arc<dyn WorkerSpawner>,
    config: SupervisorConfig,
}

impl WorkerProcessFactory {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: SupervisorConfig) -> Self {
        Self { spawner, config }
    }
}

impl ProcessFactory for WorkerProcessFactory {
    fn create(&self, events: mpsc::UnboundedSender<ProcessEvent>) -> Arc<dyn ProcessHost> {
        Arc::new(WorkerProcess::new(
            Arc::clone(&self.spawner),
            self.config.clone(),
            events,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Connected,
    Exited,
}

struct ProcessState {
    phase: Phase,
    pid: Option<u32>,
    writer: Option<ChannelWriter>,
    reader: Option<(JoinHandle<()>, CancellationToken)>,
}

struct Shared {
    session: String,
    span: tracing::Span,
    spawner: Arc<dyn WorkerSpawner>,
    config: SupervisorConfig,
    events: mpsc::UnboundedSender<ProcessEvent>,
    state: Mutex<ProcessState>,
    kill: CancellationToken,
    exited: watch::Sender<Option<ExitInfo>>,
}

/// A supervised worker process. Single use: one start, one exit.
pub struct WorkerProcess {
    shared: Arc<Shared>,
}

impl WorkerProcess {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        config: SupervisorConfig,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Self {
        let session = uuid::Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!("session", %session);
        let (exited, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                session,
                span,
                spawner,
                config,
                events,
                state: Mutex::new(ProcessState {
                    phase: Phase::Idle,
                    pid: None,
                    writer: None,
                    reader: None,
                }),
                kill: CancellationToken::new(),
                exited,
            }),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        // State transitions are single assignments; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Session parameters go first so they win over caller-supplied duplicates.
    fn worker_parameters(
        &self,
        endpoint: &ChannelEndpoint,
        extra: StartupParameters,
    ) -> StartupParameters {
        let mut params = StartupParameters::new();
        endpoint.write_parameters(&mut params);
        params.add(
            startup::CONNECT_TIMEOUT_MS,
            self.config.connect_timeout.as_millis().to_string(),
        );
        params.add(
            startup::MAX_FRAME_LENGTH,
            self.config.max_frame_length.to_string(),
        );
        for (k, v) in extra.iter() {
            params.add(k, v);
        }
        params
    }

    async fn connect(
        self: &Arc<Self>,
        extra: StartupParameters,
    ) -> Result<(Child, DuplexStreams), RemoteHostError> {
        let endpoint = ChannelEndpoint::new(self.session.clone(), self.config.namespace.clone());
        let params = self.worker_parameters(&endpoint, extra);
        let token = params
            .to_token()
            .map_err(|e| RemoteHostError::Spawn(format!("failed to encode startup token: {e}")))?;

        let listener = ChannelListener::bind(&endpoint)
            .map_err(|e| RemoteHostError::Spawn(format!("failed to bind channel: {e}")))?;

        tracing::info!("Spawning worker subprocess");
        let mut child = self
            .spawner
            .spawn(&token)
            .map_err(|e| RemoteHostError::Spawn(e.to_string()))?;
        self.lock().pid = child.id();
        tracing::debug!(pid = ?child.id(), "Waiting for worker to connect");

        let timeout = self.config.connect_timeout;
        let result = tokio::select! {
            biased;

            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Ok(Ok(streams)) => Ok(streams),
                Ok(Err(e)) => Err(RemoteHostError::Spawn(format!("failed to accept connections: {e}"))),
                Err(_) => Err(RemoteHostError::ConnectionTimeout {
                    session: self.session.clone(),
                    timeout,
                }),
            },

            status = child.wait() => Err(match status {
                Ok(status) => {
                    let exit = ExitInfo::from(status);
                    if exit.code == Some(EXIT_STARTUP_RESOLUTION) {
                        RemoteHostError::StartupResolution(
                            "worker could not resolve its serializer or construct its hosted type".to_string(),
                        )
                    } else {
                        RemoteHostError::WorkerExited(exit)
                    }
                }
                Err(e) => RemoteHostError::Spawn(format!("failed to wait for worker: {e}")),
            }),

            _ = self.kill.cancelled() => Err(RemoteHostError::ConnectionLost(
                "worker killed during startup".to_string(),
            )),
        };

        match result {
            Ok(streams) => Ok((child, streams)),
            Err(e) => {
                tracing::warn!(error = %e, "Worker startup failed, killing process");
                if let Err(e) = child.start_kill()
                    && e.kind() != std::io::ErrorKind::InvalidInput
                {
                    tracing::warn!(error = %e, "Failed to kill worker");
                }
                let exit = child.wait().await.map(ExitInfo::from).unwrap_or_default();
                tracing::debug!(%exit, "Worker reaped");
                self.exited.send_replace(Some(exit));
                Err(e)
            }
        }
    }

    async fn watch_exit(self: Arc<Self>, mut child: Child) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.kill.cancelled() => {
                tracing::debug!("Killing worker");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill worker");
                }
                child.wait().await
            }
        };
        let exit = match status {
            Ok(status) => ExitInfo::from(status),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for worker");
                ExitInfo::default()
            }
        };
        tracing::info!(%exit, "Worker exited");
        self.teardown(exit).await;
    }

    async fn teardown(&self, exit: ExitInfo) {
        let (writer, reader) = {
            let mut state = self.lock();
            state.phase = Phase::Exited;
            state.pid = None;
            (state.writer.take(), state.reader.take())
        };
        drop(writer);

        if let Some((mut handle, cancel)) = reader
            && tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
        {
            tracing::debug!("Receive loop still running after exit, cancelling");
            cancel.cancel();
            handle.abort();
        }

        self.exited.send_replace(Some(exit));
        let _ = self.events.send(ProcessEvent::ProcessStopped(exit));
    }
}

#[async_trait]
impl ProcessHost for WorkerProcess {
    fn session_id(&self) -> &str {
        &self.shared.session
    }

    async fn start(&self, params: StartupParameters) -> Result<(), RemoteHostError> {
        let shared = &self.shared;
        {
            let mut state = shared.lock();
            if state.phase != Phase::Idle {
                return Err(RemoteHostError::Spawn(
                    "worker process already started".to_string(),
                ));
            }
            state.phase = Phase::Starting;
        }

        let connected = shared.connect(params).instrument(shared.span.clone()).await;
        let (child, streams) = match connected {
            Ok(c) => c,
            Err(e) => {
                let mut state = shared.lock();
                state.phase = Phase::Exited;
                state.pid = None;
                return Err(e);
            }
        };

        let codec = FrameCodec::with_max_frame_length(shared.config.max_frame_length);
        let writer = ChannelWriter::new(streams.writer, codec.clone());
        let cancel = CancellationToken::new();
        let events = shared.events.clone();
        let reader = shared.span.in_scope(|| {
            spawn_receive_loop(streams.reader, codec, cancel.clone(), move |event| {
                let event = match event {
                    ChannelEvent::Frame(bytes) => ProcessEvent::DataReceived(bytes),
                    ChannelEvent::Disconnected => ProcessEvent::Disconnected,
                };
                let _ = events.send(event);
            })
        });

        {
            let mut state = shared.lock();
            state.phase = Phase::Connected;
            state.writer = Some(writer);
            state.reader = Some((reader, cancel));
        }

        let watcher = Arc::clone(shared);
        tokio::spawn(watcher.watch_exit(child).instrument(shared.span.clone()));

        tracing::info!(parent: &shared.span, pid = ?self.pid(), "Worker connected");
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), RemoteHostError> {
        let writer = {
            let state = self.shared.lock();
            match state.phase {
                Phase::Connected => state.writer.clone(),
                _ => None,
            }
        }
        .ok_or(RemoteHostError::DisposedUse("send"))?;

        writer
            .send(payload)
            .await
            .map_err(|e| RemoteHostError::ConnectionLost(format!("failed to send frame: {e}")))
    }

    fn kill(&self) {
        let phase = self.shared.lock().phase;
        match phase {
            Phase::Starting | Phase::Connected => {
                tracing::debug!(parent: &self.shared.span, "Kill requested");
                self.shared.kill.cancel();
            }
            Phase::Idle | Phase::Exited => {
                tracing::warn!(parent: &self.shared.span, "Kill requested but no worker process is running");
            }
        }
    }

    fn is_running(&self) -> bool {
        matches!(
            self.shared.lock().phase,
            Phase::Starting | Phase::Connected
        )
    }

    fn pid(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        if self.shared.lock().phase == Phase::Idle {
            return true;
        }
        let mut rx = self.shared.exited.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.shared.kill.cancel();
    }
}
