//! Client proxy - blocking call API over a supervised worker.
//!
//! [`RemoteHosted`] owns a private tokio runtime. Its methods block the calling thread and
//! must not be called from inside an async context.
//!
//! Each call registers a one-shot waiter under its correlation id, sends the encoded Call and
//! blocks on the waiter. A background event loop decodes frames from the worker and completes
//! waiters by id; transport failures complete every waiter at once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::protocol::{CallMessage, Message, MessageId, MessageResult, Outcome, ShutdownMessage};
use crate::bridge::transport::ChannelNamespace;
use crate::error::RemoteHostError;
use crate::serializer::{JsonSerializer, MessageSerializer};
use crate::startup::{self, StartupParameters};
use crate::state::HostState;
use crate::supervisor::{
    CommandSpawner, ProcessEvent, ProcessFactory, ProcessHost, SupervisorConfig, WorkerProcessFactory,
    WorkerSpawner,
};
use crate::value::{FromValue, Value};

/// Slack on top of the worker's shutdown grace before falling back to kill.
const EXIT_MARGIN: Duration = Duration::from_secs(1);
/// How long to wait for a killed worker to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(2);

type Waiter = oneshot::Sender<Result<Value, RemoteHostError>>;

#[derive(Clone)]
enum ProcessSource {
    Spawner(Arc<dyn WorkerSpawner>),
    Factory(Arc<dyn ProcessFactory>),
}

#[derive(Clone)]
pub struct RemoteHostConfig {
    source: ProcessSource,
    pub hosted_type: String,
    pub serializer: Arc<dyn MessageSerializer>,
    /// Extra startup parameters, forwarded to the worker after the reserved keys.
    pub parameters: StartupParameters,
    pub connect_timeout: Duration,
    pub shutdown_ack_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Unbounded when `None`.
    pub call_timeout: Option<Duration>,
    pub namespace: ChannelNamespace,
    pub max_frame_length: usize,
}

impl RemoteHostConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, hosted_type: impl Into<String>) -> Self {
        Self::from_source(ProcessSource::Spawner(spawner), hosted_type.into())
    }

    fn from_source(source: ProcessSource, hosted_type: String) -> Self {
        Self {
            source,
            hosted_type,
            serializer: Arc::new(JsonSerializer),
            parameters: StartupParameters::new(),
            connect_timeout: Duration::from_secs(1),
            shutdown_ack_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            call_timeout: None,
            namespace: ChannelNamespace::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Run `program <token>` as the worker.
    pub fn for_program(program: impl Into<PathBuf>, hosted_type: impl Into<String>) -> Self {
        Self::new(Arc::new(CommandSpawner::new(program)), hosted_type)
    }

    /// Use a custom process host instead of spawning through the supervisor.
    pub fn with_process_factory(
        factory: Arc<dyn ProcessFactory>,
        hosted_type: impl Into<String>,
    ) -> Self {
        Self::from_source(ProcessSource::Factory(factory), hosted_type.into())
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.add(key, value);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_ack_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_ack_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
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

    fn process_factory(&self) -> Arc<dyn ProcessFactory> {
        match &self.source {
            ProcessSource::Factory(f) => Arc::clone(f),
            ProcessSource::Spawner(spawner) => Arc::new(WorkerProcessFactory::new(
                Arc::clone(spawner),
                SupervisorConfig::default()
                    .with_connect_timeout(self.connect_timeout)
                    .with_namespace(self.namespace.clone())
                    .with_max_frame_length(self.max_frame_length),
            )),
        }
    }

    fn startup_parameters(&self) -> StartupParameters {
        let mut params = StartupParameters::new()
            .with(startup::SERIALIZER, self.serializer.name())
            .with(startup::HOSTED_TYPE, self.hosted_type.clone())
            .with(
                startup::SHUTDOWN_GRACE_MS,
                self.shutdown_grace.as_millis().to_string(),
            );
        for (k, v) in self.parameters.iter() {
            params.add(k, v);
        }
        params
    }
}

struct ClientState {
    state: HostState,
    disposed: bool,
    process: Option<Arc<dyn ProcessHost>>,
    session: Option<String>,
    pending: HashMap<MessageId, Waiter>,
    event_task: Option<JoinHandle<()>>,
    /// Why a running session ended abnormally; returned to later calls.
    terminal: Option<RemoteHostError>,
}

struct Shared {
    config: RemoteHostConfig,
    state: Mutex<ClientState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Complete the waiter registered under the Result's id.
    fn resolve(&self, result: MessageResult) {
        if result.id.is_nil() {
            match result.outcome {
                Outcome::Fault(failure) => {
                    tracing::error!(error = %failure, "Worker reported a startup fault");
                    self.fail_session(RemoteHostError::from(failure));
                }
                Outcome::Return(_) => tracing::warn!("Ignoring value Result without correlation id"),
            }
            return;
        }

        let waiter = self.lock().pending.remove(&result.id);
        match waiter {
            Some(tx) => {
                let reply = match result.outcome {
                    Outcome::Return(value) => Ok(value),
                    Outcome::Fault(failure) => Err(RemoteHostError::from(failure)),
                };
                if tx.send(reply).is_err() {
                    tracing::debug!(id = %result.id, "Caller gave up before the Result arrived");
                }
            }
            None => tracing::warn!(id = %result.id, "Result does not match any outstanding call"),
        }
    }

    /// Fail every outstanding waiter. A running session becomes Stopped and remembers `error`.
    fn fail_session(&self, error: RemoteHostError) {
        let pending = {
            let mut inner = self.lock();
            if inner.state == HostState::Running {
                inner.state = HostState::Stopped;
                inner.terminal.get_or_insert_with(|| error.clone());
            }
            std::mem::take(&mut inner.pending)
        };
        if !pending.is_empty() {
            tracing::warn!(count = pending.len(), error = %error, "Failing outstanding calls");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    process: Arc<dyn ProcessHost>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::DataReceived(bytes) => match shared.config.serializer.decode(&bytes) {
                Ok(Message::Result(result)) => shared.resolve(result),
                Ok(other) => {
                    tracing::warn!(id = %other.id(), kind = other.kind(), "Unexpected message from worker");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to decode frame from worker");
                    shared.fail_session(RemoteHostError::Protocol(e.to_string()));
                    process.kill();
                }
            },
            ProcessEvent::Disconnected => {
                tracing::debug!("Channel disconnected");
                shared.fail_session(RemoteHostError::ConnectionLost(
                    "channel disconnected".to_string(),
                ));
                // A stopping worker closes its end before exiting; stop owns its grace period.
                let stopping = shared.lock().state == HostState::Stopping;
                if !stopping && process.is_running() {
                    process.kill();
                }
            }
            ProcessEvent::ProcessStopped(exit) => {
                tracing::info!(%exit, "Worker process stopped");
                shared.fail_session(RemoteHostError::ConnectionLost(format!(
                    "worker exited ({exit})"
                )));
                let mut inner = shared.lock();
                if inner.state == HostState::Running {
                    inner.state = HostState::Stopped;
                }
                inner.process = None;
                break;
            }
        }
    }
    tracing::trace!("Event loop exiting");
}

/// A hosted instance living in a worker process.
///
/// ```no_run
/// use remotehost::{RemoteHostConfig, RemoteHosted, Value};
///
/// let host = RemoteHosted::new(RemoteHostConfig::for_program("./my-worker", "Greeter"))?;
/// host.start()?;
/// let reply = host.call("Greet", vec![Value::from("world")])?;
/// host.stop()?;
/// # Ok::<(), remotehost::RemoteHostError>(())
/// ```
pub struct RemoteHosted {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
}

impl RemoteHosted {
    pub fn new(config: RemoteHostConfig) -> Result<Self, RemoteHostError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("remotehost")
            .enable_all()
            .build()
            .map_err(|e| RemoteHostError::Spawn(format!("failed to build runtime: {e}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ClientState {
                    state: HostState::NotStarted,
                    disposed: false,
                    process: None,
                    session: None,
                    pending: HashMap::new(),
                    event_task: None,
                    terminal: None,
                }),
            }),
            runtime: Some(runtime),
        })
    }

    fn runtime(&self, operation: &'static str) -> Result<&Runtime, RemoteHostError> {
        self.runtime
            .as_ref()
            .ok_or(RemoteHostError::DisposedUse(operation))
    }

    pub fn state(&self) -> HostState {
        self.shared.lock().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session.clone()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        let process = self.shared.lock().process.clone();
        process.and_then(|p| p.pid())
    }

    /// Spawn the worker and connect to it.
    ///
    /// Calling this while a session is starting or running logs a warning and does nothing.
    /// A failed start leaves the host `NotStarted` so it may be retried.
    pub fn start(&self) -> Result<(), RemoteHostError> {
        let runtime = self.runtime("start")?;
        let (process, events) = {
            let mut inner = self.shared.lock();
            if inner.disposed {
                return Err(RemoteHostError::DisposedUse("start"));
            }
            match inner.state {
                HostState::NotStarted => {}
                HostState::Starting | HostState::Running => {
                    tracing::warn!(session = ?inner.session, "Host already started, ignoring start");
                    return Ok(());
                }
                state @ (HostState::Stopping | HostState::Stopped) => {
                    return Err(RemoteHostError::InvalidState {
                        operation: "start",
                        state,
                    });
                }
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let process = self.shared.config.process_factory().create(tx);
            inner.state = HostState::Starting;
            inner.session = Some(process.session_id().to_string());
            inner.process = Some(Arc::clone(&process));
            (process, rx)
        };

        let span = tracing::info_span!("session", session = %process.session_id());
        let params = self.shared.config.startup_parameters();
        let started = runtime.block_on(process.start(params).instrument(span.clone()));

        let mut inner = self.shared.lock();
        match started {
            Ok(()) if !inner.disposed && inner.state == HostState::Starting => {
                inner.state = HostState::Running;
                inner.event_task = Some(runtime.spawn(
                    run_event_loop(Arc::clone(&self.shared), Arc::clone(&process), events)
                        .instrument(span.clone()),
                ));
                tracing::info!(parent: &span, pid = ?process.pid(), "Remote host running");
                Ok(())
            }
            Ok(()) => {
                drop(inner);
                process.kill();
                Err(RemoteHostError::DisposedUse("start"))
            }
            Err(_) if inner.disposed => Err(RemoteHostError::DisposedUse("start")),
            Err(e) => {
                tracing::warn!(parent: &span, error = %e, "Remote host failed to start");
                inner.state = HostState::NotStarted;
                inner.process = None;
                inner.session = None;
                Err(e)
            }
        }
    }

    /// Invoke `operation` and return its value.
    pub fn call(&self, operation: &str, arguments: Vec<Value>) -> Result<Value, RemoteHostError> {
        self.invoke(CallMessage::new(operation, arguments))
    }

    /// Invoke `operation` without transferring its value back. Returns once it has completed.
    pub fn call_void(&self, operation: &str, arguments: Vec<Value>) -> Result<(), RemoteHostError> {
        self.invoke(CallMessage::new(operation, arguments).without_return())
            .map(|_| ())
    }

    /// Invoke `operation` and convert its value.
    pub fn call_as<T: FromValue>(
        &self,
        operation: &str,
        arguments: Vec<Value>,
    ) -> Result<T, RemoteHostError> {
        let value = self.call(operation, arguments)?;
        T::from_value(value).map_err(|e| {
            RemoteHostError::Protocol(format!("unexpected value returned by '{operation}': {e}"))
        })
    }

    fn invoke(&self, call: CallMessage) -> Result<Value, RemoteHostError> {
        let runtime = self.runtime("call")?;
        let id = call.id;
        let (tx, rx) = oneshot::channel();
        let process = {
            let mut inner = self.shared.lock();
            if inner.disposed {
                return Err(RemoteHostError::DisposedUse("call"));
            }
            if inner.state != HostState::Running {
                return Err(inner.terminal.clone().unwrap_or(RemoteHostError::InvalidState {
                    operation: "call",
                    state: inner.state,
                }));
            }
            let Some(process) = inner.process.clone() else {
                return Err(RemoteHostError::ConnectionLost("no worker process".to_string()));
            };
            inner.pending.insert(id, tx);
            process
        };

        let payload = match self.shared.config.serializer.encode(&Message::Call(call)) {
            Ok(p) => p,
            Err(e) => {
                self.shared.lock().pending.remove(&id);
                return Err(RemoteHostError::Protocol(e.to_string()));
            }
        };

        let call_timeout = self.shared.config.call_timeout;
        runtime.block_on(async {
            if let Err(e) = process.send(payload).await {
                if self.shared.lock().pending.remove(&id).is_none() {
                    // The event loop already completed the waiter with the session failure.
                    return rx.await.unwrap_or(Err(e));
                }
                return Err(match e {
                    RemoteHostError::DisposedUse(_) => {
                        RemoteHostError::ConnectionLost("worker is gone".to_string())
                    }
                    other => other,
                });
            }

            let reply = match call_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        self.shared.lock().pending.remove(&id);
                        return Err(RemoteHostError::CallTimeout(timeout));
                    }
                },
                None => rx.await,
            };
            reply.unwrap_or_else(|_| {
                Err(RemoteHostError::ConnectionLost("call abandoned".to_string()))
            })
        })
    }

    /// Ask the worker to shut down and wait for it to exit.
    ///
    /// Sends Shutdown, waits for the acknowledgement, then gives the worker its grace period to
    /// exit before killing it. A no-op when no session is running.
    pub fn stop(&self) -> Result<(), RemoteHostError> {
        let runtime = self.runtime("stop")?;
        let (process, shutdown, rx) = {
            let mut inner = self.shared.lock();
            if inner.disposed {
                return Err(RemoteHostError::DisposedUse("stop"));
            }
            match inner.state {
                HostState::Running => {}
                HostState::NotStarted | HostState::Stopping | HostState::Stopped => {
                    tracing::debug!(state = %inner.state, "Stop with no running session");
                    return Ok(());
                }
                state @ HostState::Starting => {
                    return Err(RemoteHostError::InvalidState {
                        operation: "stop",
                        state,
                    });
                }
            }
            let Some(process) = inner.process.clone() else {
                inner.state = HostState::Stopped;
                return Ok(());
            };
            let shutdown = ShutdownMessage::new();
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(shutdown.id, tx);
            inner.state = HostState::Stopping;
            (process, shutdown, rx)
        };

        let id = shutdown.id;
        let config = &self.shared.config;
        let acked = match config.serializer.encode(&Message::Shutdown(shutdown)) {
            Ok(payload) => runtime.block_on(async {
                if let Err(e) = process.send(payload).await {
                    return Err(e);
                }
                match tokio::time::timeout(config.shutdown_ack_timeout, rx).await {
                    Ok(Ok(reply)) => reply.map(|_| ()),
                    Ok(Err(_)) => Err(RemoteHostError::ConnectionLost(
                        "shutdown abandoned".to_string(),
                    )),
                    Err(_) => Err(RemoteHostError::ConnectionLost(format!(
                        "shutdown not acknowledged within {:?}",
                        config.shutdown_ack_timeout
                    ))),
                }
            }),
            Err(e) => Err(RemoteHostError::Protocol(e.to_string())),
        };
        match &acked {
            Ok(()) => tracing::debug!("Shutdown acknowledged"),
            Err(e) => tracing::warn!(error = %e, "Shutdown not acknowledged"),
        }

        runtime.block_on(async {
            if !process.wait_for_exit(config.shutdown_grace + EXIT_MARGIN).await {
                tracing::warn!("Worker did not exit after shutdown, killing");
                process.kill();
                if !process.wait_for_exit(KILL_WAIT).await {
                    tracing::error!("Worker still running after kill");
                }
            }
        });

        let pending = {
            let mut inner = self.shared.lock();
            inner.pending.remove(&id);
            if !inner.disposed {
                inner.state = HostState::Stopped;
            }
            std::mem::take(&mut inner.pending)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(RemoteHostError::ConnectionLost(
                "host stopped".to_string(),
            )));
        }
        tracing::info!(session = ?self.session_id(), "Remote host stopped");
        acked
    }

    /// Kill the worker and release everything. Idempotent and callable from any thread.
    ///
    /// Outstanding calls fail with [`RemoteHostError::DisposedUse`].
    pub fn dispose(&self) {
        let (process, pending, event_task) = {
            let mut inner = self.shared.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.state = HostState::Stopped;
            (
                inner.process.take(),
                std::mem::take(&mut inner.pending),
                inner.event_task.take(),
            )
        };
        tracing::debug!(pending = pending.len(), "Disposing remote host");

        for (_, tx) in pending {
            let _ = tx.send(Err(RemoteHostError::DisposedUse("call")));
        }
        if let Some(task) = event_task {
            task.abort();
        }
        if let Some(process) = process {
            if process.is_running() {
                process.kill();
            }
            if let Some(runtime) = &self.runtime
                && tokio::runtime::Handle::try_current().is_err()
                && !runtime.block_on(process.wait_for_exit(KILL_WAIT))
            {
                tracing::warn!("Worker still running after dispose");
            }
        }
    }
}

impl Drop for RemoteHosted {
    fn drop(&mut self) {
        self.dispose();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
