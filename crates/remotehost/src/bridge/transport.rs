//! Socket transport for the duplex channel.
//!
//! A session uses two Unix sockets named after the session id:
//! - `{session}_a`: parent writes, worker reads
//! - `{session}_b`: worker writes, parent reads
//!
//! Platform-specific naming:
//! - **Abstract**: Linux abstract namespace (no filesystem entries, auto-cleanup)
//! - **Directory**: filesystem sockets in a directory, removed once both ends connect

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use crate::startup::{self, StartupParameters, StartupParametersError};

/// Where socket names live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNamespace {
    #[cfg(target_os = "linux")]
    Abstract,
    Directory(PathBuf),
}

impl Default for ChannelNamespace {
    /// Abstract on Linux, the temp directory elsewhere.
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Abstract
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::Directory(std::env::temp_dir())
        }
    }
}

/// Names of both sockets of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    session: String,
    namespace: ChannelNamespace,
}

impl ChannelEndpoint {
    pub fn new(session: impl Into<String>, namespace: ChannelNamespace) -> Self {
        Self {
            session: session.into(),
            namespace,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Parent → worker socket name.
    pub fn to_worker_name(&self) -> String {
        format!("{}_a", self.session)
    }

    /// Worker → parent socket name.
    pub fn to_parent_name(&self) -> String {
        format!("{}_b", self.session)
    }

    /// Record the session id and socket location in the worker's startup parameters.
    pub fn write_parameters(&self, params: &mut StartupParameters) {
        params.add(startup::SESSION_ID, self.session.clone());
        if let ChannelNamespace::Directory(dir) = &self.namespace {
            params.add(startup::CHANNEL_DIR, dir.to_string_lossy());
        }
    }

    pub fn from_parameters(params: &StartupParameters) -> Result<Self, StartupParametersError> {
        let session = params.require(startup::SESSION_ID)?;
        let namespace = match params.get(startup::CHANNEL_DIR) {
            Some(dir) => ChannelNamespace::Directory(PathBuf::from(dir)),
            None => ChannelNamespace::default(),
        };
        Ok(Self::new(session, namespace))
    }

    fn socket_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.sock"))
    }
}

/// Connected streams of one side of the channel.
#[derive(Debug)]
pub struct DuplexStreams {
    /// Incoming frames.
    pub reader: UnixStream,
    /// Outgoing frames.
    pub writer: UnixStream,
}

/// Parent side: both sockets bound, waiting for the worker.
pub struct ChannelListener {
    to_worker: UnixListener,
    to_parent: UnixListener,
    socket_files: Vec<PathBuf>,
}

impl ChannelListener {
    pub fn bind(endpoint: &ChannelEndpoint) -> io::Result<Self> {
        match &endpoint.namespace {
            #[cfg(target_os = "linux")]
            ChannelNamespace::Abstract => {
                tracing::debug!(transport_type = "abstract", session = %endpoint.session, "Binding channel");
                Ok(Self {
                    to_worker: bind_abstract(&endpoint.to_worker_name())?,
                    to_parent: bind_abstract(&endpoint.to_parent_name())?,
                    socket_files: Vec::new(),
                })
            }
            ChannelNamespace::Directory(dir) => {
                tracing::debug!(transport_type = "named", dir = %dir.display(), session = %endpoint.session, "Binding channel");
                std::fs::create_dir_all(dir)?;

                let a = ChannelEndpoint::socket_path(dir, &endpoint.to_worker_name());
                let b = ChannelEndpoint::socket_path(dir, &endpoint.to_parent_name());
                let to_worker = bind_path(&a)?;
                let to_parent = bind_path(&b).inspect_err(|_| {
                    let _ = std::fs::remove_file(&a);
                })?;
                Ok(Self {
                    to_worker,
                    to_parent,
                    socket_files: vec![a, b],
                })
            }
        }
    }

    /// Wait until the worker has connected both sockets.
    ///
    /// Socket files are removed once both connections are accepted.
    pub async fn accept(mut self) -> io::Result<DuplexStreams> {
        tracing::trace!("Waiting for worker connections");
        let (writer, reader) = tokio::try_join!(self.to_worker.accept(), self.to_parent.accept())?;
        tracing::trace!("Worker connected");
        self.remove_socket_files();
        Ok(DuplexStreams {
            reader: reader.0,
            writer: writer.0,
        })
    }

    fn remove_socket_files(&mut self) {
        for path in self.socket_files.drain(..) {
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        self.remove_socket_files();
    }
}

/// Worker side: connect to both sockets of a session.
pub async fn connect(endpoint: &ChannelEndpoint) -> io::Result<DuplexStreams> {
    let (reader, writer) = match &endpoint.namespace {
        #[cfg(target_os = "linux")]
        ChannelNamespace::Abstract => (
            connect_abstract(&endpoint.to_worker_name())?,
            connect_abstract(&endpoint.to_parent_name())?,
        ),
        ChannelNamespace::Directory(dir) => {
            let a = ChannelEndpoint::socket_path(dir, &endpoint.to_worker_name());
            let b = ChannelEndpoint::socket_path(dir, &endpoint.to_parent_name());
            tracing::trace!(path = %a.display(), "Connecting to socket");
            let reader = UnixStream::connect(&a).await?;
            tracing::trace!(path = %b.display(), "Connecting to socket");
            let writer = UnixStream::connect(&b).await?;
            (reader, writer)
        }
    };
    tracing::trace!(session = %endpoint.session, "Connected");
    Ok(DuplexStreams { reader, writer })
}

fn bind_path(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::trace!(path = %path.display(), "Bound socket");
    Ok(listener)
}

#[cfg(target_os = "linux")]
fn abstract_name(name: &str) -> String {
    format!("remotehost-{name}")
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

    let name = abstract_name(name);
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let std_listener = StdUnixListener::bind_addr(&addr)?;
    std_listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(std_listener)?;
    tracing::trace!(name = %name, "Bound abstract socket");
    Ok(listener)
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let name = abstract_name(name);
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    tracing::trace!(name = %name, "Connecting to abstract socket");

    // tokio doesn't support abstract sockets directly
    let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    std_stream.set_nonblocking(true)?;
    UnixStream::from_std(std_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    async fn exchange(endpoint: ChannelEndpoint) {
        let listener = ChannelListener::bind(&endpoint).unwrap();
        let worker_endpoint = endpoint.clone();
        let worker = tokio::spawn(async move { connect(&worker_endpoint).await.unwrap() });

        let mut parent = listener.accept().await.unwrap();
        let mut worker = worker.await.unwrap();

        parent.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        worker.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        worker.writer.write_all(b"pong").await.unwrap();
        parent.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn endpoint_names_use_direction_suffix() {
        let endpoint = ChannelEndpoint::new("abc", ChannelNamespace::default());
        assert_eq!(endpoint.to_worker_name(), "abc_a");
        assert_eq!(endpoint.to_parent_name(), "abc_b");
    }

    #[test]
    fn endpoint_roundtrips_through_parameters() {
        let endpoint = ChannelEndpoint::new("abc", ChannelNamespace::Directory("/tmp/x".into()));
        let mut params = StartupParameters::new();
        endpoint.write_parameters(&mut params);
        assert_eq!(params.get(startup::SESSION_ID), Some("abc"));
        assert_eq!(ChannelEndpoint::from_parameters(&params).unwrap(), endpoint);
    }

    #[tokio::test]
    async fn named_sockets_exchange_and_clean_up() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ChannelEndpoint::new(
            session(),
            ChannelNamespace::Directory(dir.path().to_path_buf()),
        );
        exchange(endpoint).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dropped_listener_removes_socket_files() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ChannelEndpoint::new(
            session(),
            ChannelNamespace::Directory(dir.path().to_path_buf()),
        );
        let listener = ChannelListener::bind(&endpoint).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        drop(listener);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abstract_sockets_exchange() {
        exchange(ChannelEndpoint::new(session(), ChannelNamespace::Abstract)).await;
    }

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ChannelEndpoint::new(
            session(),
            ChannelNamespace::Directory(dir.path().to_path_buf()),
        );
        assert!(connect(&endpoint).await.is_err());
    }
}
