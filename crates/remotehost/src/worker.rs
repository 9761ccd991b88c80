//! Worker subprocess - the run harness inside the hosted process.
//!
//! This module provides the child side of the channel protocol. The parent side (spawning,
//! correlation) is in supervisor.rs and client.rs.
//!
//! Startup order:
//! 1. Parse the startup token
//! 2. Resolve serializer and hosted type by name
//! 3. Construct the hosted instance
//! 4. Connect both channel sockets
//! 5. Dispatch loop until Shutdown or the parent goes away
//!
//! A failure in steps 2 or 3 exits with [`EXIT_STARTUP_RESOLUTION`] before anything is
//! connected, so the parent's `start` reports it.
//!
//! Each Call runs on the blocking pool, concurrently with other calls. All Results funnel
//! through one queue drained by a single writer task.

use std::any::Any;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, MessageCodec};
use crate::bridge::protocol::{CallMessage, FaultKind, Message, MessageResult, Outcome, RemoteFailure};
use crate::bridge::transport::{self, ChannelEndpoint};
use crate::hosted::{Dispatch, Registry};
use crate::logging::init_tracing;
use crate::serializer::MessageSerializer;
use crate::startup::{self, StartupParameters, StartupParametersError};
use crate::value::Value;

/// Exit code of a worker that could not resolve its serializer or construct its hosted type.
pub const EXIT_STARTUP_RESOLUTION: i32 = 3;

/// How long the writer may take to flush queued Results after the loop ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the worker stopped, mapped to its process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown acknowledged, or the parent closed the channel.
    Clean,
    /// I/O or protocol failure.
    RuntimeFailure,
    /// Missing or malformed startup token.
    BadToken,
    StartupResolution,
}

impl WorkerExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::RuntimeFailure => 1,
            Self::BadToken => 2,
            Self::StartupResolution => EXIT_STARTUP_RESOLUTION as u8,
        }
    }
}

impl From<WorkerExit> for ExitCode {
    fn from(exit: WorkerExit) -> Self {
        ExitCode::from(exit.code())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub connect_timeout: Duration,
    /// Delay between acknowledging Shutdown and exiting.
    pub shutdown_grace: Duration,
    pub max_frame_length: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl WorkerConfig {
    /// Read the values the parent forwarded, falling back to defaults.
    pub fn from_parameters(params: &StartupParameters) -> Result<Self, StartupParametersError> {
        let defaults = Self::default();
        Ok(Self {
            connect_timeout: params
                .duration_ms(startup::CONNECT_TIMEOUT_MS)?
                .unwrap_or(defaults.connect_timeout),
            shutdown_grace: params
                .duration_ms(startup::SHUTDOWN_GRACE_MS)?
                .unwrap_or(defaults.shutdown_grace),
            max_frame_length: params
                .usize(startup::MAX_FRAME_LENGTH)?
                .unwrap_or(defaults.max_frame_length),
        })
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

/// Entry point for a worker binary: parse the token from argv, run, exit.
///
/// ```no_run
/// use remotehost::Registry;
///
/// fn main() -> std::process::ExitCode {
///     remotehost::run_from_args(Registry::new())
/// }
/// ```
pub fn run_from_args(registry: Registry) -> ExitCode {
    init_tracing();

    let params = match StartupParameters::from_args(std::env::args()) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "Invalid startup token");
            return WorkerExit::BadToken.into();
        }
    };
    let config = match WorkerConfig::from_parameters(&params) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Invalid startup parameters");
            return WorkerExit::BadToken.into();
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build runtime");
            return WorkerExit::RuntimeFailure.into();
        }
    };

    let exit = runtime.block_on(run_worker(registry, params, config));
    // Operations still running on the blocking pool are abandoned.
    runtime.shutdown_timeout(Duration::from_millis(100));
    tracing::info!(code = exit.code(), "Worker exiting");
    exit.into()
}

/// Run the worker against the channel described by `params`.
pub async fn run_worker(
    registry: Registry,
    params: StartupParameters,
    config: WorkerConfig,
) -> WorkerExit {
    let endpoint = match ChannelEndpoint::from_parameters(&params) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "Invalid startup parameters");
            return WorkerExit::BadToken;
        }
    };
    let span = tracing::info_span!("session", session = %endpoint.session());
    serve(registry, params, config, endpoint)
        .instrument(span)
        .await
}

async fn serve(
    registry: Registry,
    params: StartupParameters,
    config: WorkerConfig,
    endpoint: ChannelEndpoint,
) -> WorkerExit {
    let resolved = params
        .get(startup::SERIALIZER)
        .ok_or_else(|| {
            RemoteFailure::new(FaultKind::StartupResolution, "no serializer selected")
        })
        .and_then(|name| registry.resolve_serializer(name));
    let serializer = match resolved {
        Ok(s) => s,
        Err(failure) => {
            tracing::error!(error = %failure, "Serializer resolution failed");
            return WorkerExit::StartupResolution;
        }
    };

    let Some(hosted_type) = params.get(startup::HOSTED_TYPE) else {
        tracing::error!("No hosted type selected");
        return WorkerExit::StartupResolution;
    };
    let hosted = match registry.resolve_hosted(hosted_type) {
        Ok(h) => h,
        Err(failure) => {
            tracing::error!(error = %failure, "Hosted instance resolution failed");
            return WorkerExit::StartupResolution;
        }
    };

    tracing::debug!(serializer = serializer.name(), hosted_type, "Connecting to parent");
    let streams = match tokio::time::timeout(config.connect_timeout, transport::connect(&endpoint))
        .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to connect to parent");
            return WorkerExit::RuntimeFailure;
        }
        Err(_) => {
            tracing::error!(timeout = ?config.connect_timeout, "Timed out connecting to parent");
            return WorkerExit::RuntimeFailure;
        }
    };

    let mut reader = FramedRead::new(
        streams.reader,
        MessageCodec::new(Arc::clone(&serializer)).with_max_frame_length(config.max_frame_length),
    );
    let mut writer = FramedWrite::new(
        streams.writer,
        FrameCodec::with_max_frame_length(config.max_frame_length),
    );
    tracing::info!(hosted_type, "Worker ready");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let outbox = Outbox {
        tx: out_tx,
        serializer,
        max_frame_length: config.max_frame_length,
    };
    let writer_task = tokio::spawn(
        async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    tracing::warn!(error = %e, "Failed to write result");
                    break;
                }
            }
            tracing::trace!("Writer task exiting");
        }
        .in_current_span(),
    );

    let shutdown = CancellationToken::new();
    let mut exit = WorkerExit::Clean;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown grace elapsed");
                break;
            }

            msg = reader.next() => match msg {
                Some(Ok(Message::Call(call))) => {
                    tracing::trace!(id = %call.id, operation = %call.operation, "Call received");
                    spawn_dispatch(Arc::clone(&hosted), call, outbox.clone());
                }
                Some(Ok(Message::Shutdown(msg))) => {
                    tracing::info!(id = %msg.id, "Shutdown requested");
                    outbox.post(MessageResult::value(msg.id, Value::Null));
                    let shutdown = shutdown.clone();
                    let grace = config.shutdown_grace;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        shutdown.cancel();
                    });
                }
                Some(Ok(Message::Result(result))) => {
                    tracing::warn!(id = %result.id, "Ignoring Result sent to worker");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Channel protocol error");
                    exit = WorkerExit::RuntimeFailure;
                    break;
                }
                None => {
                    tracing::info!("Channel closed (parent died?), exiting");
                    break;
                }
            },
        }
    }

    drop(outbox);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await.is_err() {
        tracing::warn!("Timed out flushing results");
    }
    exit
}

/// Encodes Results and queues their frames for the single writer task.
///
/// A Result that cannot be encoded within the frame limit is replaced by an Operation fault
/// for the same call.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Bytes>,
    serializer: Arc<dyn MessageSerializer>,
    max_frame_length: usize,
}

impl Outbox {
    fn encode(&self, result: &MessageResult) -> Result<Bytes, String> {
        let frame = self
            .serializer
            .encode(&Message::Result(result.clone()))
            .map_err(|e| e.to_string())?;
        if frame.len() > self.max_frame_length {
            return Err(format!(
                "result of {} bytes exceeds the {} byte frame limit",
                frame.len(),
                self.max_frame_length
            ));
        }
        Ok(frame)
    }

    fn post(&self, result: MessageResult) {
        let id = result.id;
        let frame = match self.encode(&result) {
            Ok(frame) => frame,
            Err(reason) => {
                tracing::warn!(%id, error = %reason, "Result could not be encoded");
                let fault = MessageResult::fault(
                    id,
                    RemoteFailure::new(
                        FaultKind::Operation,
                        format!("result could not be encoded: {reason}"),
                    ),
                );
                match self.encode(&fault) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(%id, error = %e, "Fault could not be encoded either");
                        return;
                    }
                }
            }
        };
        if self.tx.send(frame).is_err() {
            tracing::debug!(%id, "Result dropped, writer gone");
        }
    }
}

fn spawn_dispatch(hosted: Arc<dyn Dispatch>, call: CallMessage, outbox: Outbox) {
    let CallMessage {
        id,
        operation,
        arguments,
        returns,
    } = call;
    tokio::spawn(
        async move {
            let op = operation.clone();
            let joined =
                tokio::task::spawn_blocking(move || hosted.dispatch(&op, arguments)).await;
            let outcome = match joined {
                Ok(Ok(value)) if returns => Outcome::Return(value),
                Ok(Ok(_)) => Outcome::Return(Value::Null),
                Ok(Err(failure)) => Outcome::Fault(failure),
                Err(e) if e.is_panic() => Outcome::Fault(RemoteFailure::new(
                    FaultKind::Panic,
                    panic_message(e.into_panic()),
                )),
                Err(_) => Outcome::Fault(RemoteFailure::new(
                    FaultKind::Operation,
                    "operation was cancelled",
                )),
            };
            if let Outcome::Fault(failure) = &outcome {
                tracing::debug!(%id, %operation, error = %failure, "Call failed");
            } else {
                tracing::trace!(%id, %operation, "Call completed");
            }
            outbox.post(MessageResult { id, outcome });
        }
        .in_current_span(),
    );
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("operation panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("operation panicked: {s}")
    } else {
        "operation panicked".to_string()
    }
}
