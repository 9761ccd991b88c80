//! remotehost: run an object in an isolated worker process and call it synchronously.
//!
//! The parent side is [`RemoteHosted`]: it spawns a worker through a [`WorkerSpawner`],
//! connects a duplex channel, and turns blocking calls into correlated Call/Result messages.
//! The worker side is [`run_from_args`]: it decodes the startup token, resolves the hosted type
//! from a [`Registry`], and serves calls until shutdown or disconnect.

pub mod bridge;
pub mod client;
pub mod error;
pub mod hosted;
pub mod logging;
pub mod serializer;
pub mod startup;
pub mod state;
pub mod supervisor;
pub mod value;
pub mod worker;

pub use client::{RemoteHostConfig, RemoteHosted};
pub use error::RemoteHostError;
pub use hosted::{Arguments, Dispatch, Hosted, OperationError, Operations, Registry};
pub use logging::init_tracing;
pub use serializer::{JsonSerializer, MessageSerializer, SerializerError};
pub use startup::{StartupParameters, StartupParametersError};
pub use state::HostState;
pub use supervisor::{CommandSpawner, ExitInfo, SpawnError, WorkerSpawner};
pub use value::{FromValue, Value, ValueTypeError};
pub use worker::{WorkerConfig, WorkerExit, run_from_args, run_worker};
