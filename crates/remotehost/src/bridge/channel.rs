//! Framed send/receive over the connected channel streams.
//!
//! The parent side works on raw frames; decoding happens in the client so one serializer
//! instance owns the encoding for a whole session.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::codec::FrameCodec;

/// Published by the receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One complete frame payload.
    Frame(Bytes),
    /// The remote end closed or reset the stream. Emitted at most once, and never after a
    /// local cancel.
    Disconnected,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Single-writer handle for outgoing frames.
///
/// Clones share one underlying stream; concurrent `send`s are serialized by the inner lock so
/// frames never interleave.
#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<Mutex<FramedWrite<BoxedWriter, FrameCodec>>>,
}

impl ChannelWriter {
    pub fn new<W>(writer: W, codec: FrameCodec) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedWriter = Box::new(writer);
        Self {
            inner: Arc::new(Mutex::new(FramedWrite::new(boxed, codec))),
        }
    }

    pub async fn send(&self, payload: Bytes) -> io::Result<()> {
        let mut w = self.inner.lock().await;
        w.send(payload).await
    }

    /// Flush and shut down the write direction.
    pub async fn close(&self) -> io::Result<()> {
        let mut w = self.inner.lock().await;
        w.close().await
    }
}

/// Spawn the receive loop for one channel direction.
///
/// Calls `on_event` for every frame in arrival order, then once with
/// [`ChannelEvent::Disconnected`] on EOF or read error. Cancelling `cancel` stops the loop
/// without a Disconnected event. The loop runs in the caller's current span.
pub fn spawn_receive_loop<R, F>(
    reader: R,
    codec: FrameCodec,
    cancel: CancellationToken,
    on_event: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    F: Fn(ChannelEvent) + Send + 'static,
{
    let mut frames = FramedRead::new(reader, codec);
    let task = async move {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::trace!("Receive loop cancelled");
                    break;
                }

                frame = frames.next() => match frame {
                    Some(Ok(bytes)) => on_event(ChannelEvent::Frame(bytes.freeze())),
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Channel read failed");
                        on_event(ChannelEvent::Disconnected);
                        break;
                    }
                    None => {
                        tracing::debug!("Channel closed by remote");
                        on_event(ChannelEvent::Disconnected);
                        break;
                    }
                },
            }
        }
    };
    tokio::spawn(task.in_current_span())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn collect() -> (
        impl Fn(ChannelEvent) + Send + 'static,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn frames_arrive_in_order_then_disconnect_once() {
        let (client, server) = tokio::io::duplex(1024);
        let writer = ChannelWriter::new(client, FrameCodec::new());
        let (sink, mut rx) = collect();
        let handle =
            spawn_receive_loop(server, FrameCodec::new(), CancellationToken::new(), sink);

        writer.send(Bytes::from_static(b"one")).await.unwrap();
        writer.send(Bytes::from_static(b"two")).await.unwrap();
        drop(writer);

        assert_eq!(rx.recv().await, Some(ChannelEvent::Frame(Bytes::from_static(b"one"))));
        assert_eq!(rx.recv().await, Some(ChannelEvent::Frame(Bytes::from_static(b"two"))));
        assert_eq!(rx.recv().await, Some(ChannelEvent::Disconnected));
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn close_flushes_then_disconnects() {
        let (client, server) = tokio::io::duplex(1024);
        let writer = ChannelWriter::new(client, FrameCodec::new());
        let (sink, mut rx) = collect();
        let _handle =
            spawn_receive_loop(server, FrameCodec::new(), CancellationToken::new(), sink);

        writer.send(Bytes::from_static(b"last")).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(rx.recv().await, Some(ChannelEvent::Frame(Bytes::from_static(b"last"))));
        assert_eq!(rx.recv().await, Some(ChannelEvent::Disconnected));
    }

    #[tokio::test]
    async fn truncated_frame_is_disconnect() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (sink, mut rx) = collect();
        let _handle =
            spawn_receive_loop(server, FrameCodec::new(), CancellationToken::new(), sink);

        // Prefix promises 10 bytes, only 3 arrive before close.
        client.write_all(&[0, 0, 0, 10, 1, 2, 3]).await.unwrap();
        drop(client);

        assert_eq!(rx.recv().await, Some(ChannelEvent::Disconnected));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_stops_without_disconnect() {
        let (_client, server) = tokio::io::duplex(1024);
        let (sink, mut rx) = collect();
        let cancel = CancellationToken::new();
        let handle = spawn_receive_loop(server, FrameCodec::new(), cancel.clone(), sink);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let (client, server) = tokio::io::duplex(64);
        let writer = ChannelWriter::new(client, FrameCodec::new());
        let (sink, mut rx) = collect();
        let _handle =
            spawn_receive_loop(server, FrameCodec::new(), CancellationToken::new(), sink);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                writer.send(Bytes::from(vec![i; 200])).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        for _ in 0..8 {
            match rx.recv().await {
                Some(ChannelEvent::Frame(bytes)) => {
                    assert_eq!(bytes.len(), 200);
                    assert!(bytes.iter().all(|b| *b == bytes[0]));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
