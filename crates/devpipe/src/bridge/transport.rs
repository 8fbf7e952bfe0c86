//! Pipe transport: a reader/writer pair carrying NUL-delimited text frames.
//!
//! The transport has no handshake. It reports `Open` as soon as its reader
//! task starts, one `Message` per frame in arrival order, and `Closed` once
//! when the inbound stream ends. Writes are not gated on state here; callers
//! check state first so their errors can name the failed call.
//!
//! A write blocked on a full pipe never holds up `close`: closing cancels the
//! in-flight write and drops the writer without flushing it.

use std::io;
use std::string::FromUtf8Error;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::NulDelimitedCodec;

type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, NulDelimitedCodec>;

/// Lifecycle of a transport. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(String),
    /// A complete frame that is not UTF-8 text.
    Undecodable(FromUtf8Error),
    Closed,
}

pub struct PipeTransport {
    writer: Mutex<Option<FrameWriter>>,
    state: Arc<watch::Sender<TransportState>>,
    reader: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl PipeTransport {
    /// Start reading `reader` and return the transport with its event stream.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open<R, W>(reader: R, writer: W) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TransportState::Connecting);
        let state = Arc::new(state);

        let frames = FramedRead::new(reader, NulDelimitedCodec::new());
        let reader = tokio::spawn(read_frames(frames, Arc::clone(&state), events_tx));

        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let transport = Self {
            writer: Mutex::new(Some(FramedWrite::new(writer, NulDelimitedCodec::new()))),
            state,
            reader,
            shutdown: CancellationToken::new(),
        };

        (transport, events_rx)
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Write one frame. The sentinel is appended by the codec.
    pub async fn send(&self, payload: Bytes) -> io::Result<()> {
        self.send_frame(payload, || {}).await
    }

    /// Write one frame, calling `on_buffered` once the frame is in the write
    /// buffer. From then on it goes out with the next flush even if this
    /// future is dropped.
    ///
    /// Fails with `BrokenPipe` once [`close`](Self::close) has been called,
    /// including while the write is waiting on a full pipe.
    pub async fn send_frame(&self, payload: Bytes, on_buffered: impl FnOnce()) -> io::Result<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(writer_shut_down()),
            result = async move {
                let mut writer = self.writer.lock().await;
                let Some(writer) = writer.as_mut() else {
                    return Err(writer_shut_down());
                };
                writer.feed(payload).await?;
                on_buffered();
                writer.flush().await
            } => result,
        }
    }

    /// Stop reading and drop the writer. Idempotent.
    ///
    /// The reader task is aborted, so no `Closed` event follows a local close;
    /// the event stream simply ends. Bytes still sitting in the write buffer
    /// are discarded.
    pub async fn close(&self) {
        // Releases the writer lock if a send is parked on a full pipe.
        self.shutdown.cancel();
        self.reader.abort();
        self.state.send_replace(TransportState::Closed);

        if self.writer.lock().await.take().is_some() {
            tracing::debug!("Transport writer dropped");
        }
    }
}

fn writer_shut_down() -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        "transport writer has been shut down",
    )
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.reader.abort();
    }
}

async fn read_frames<R>(
    mut frames: FramedRead<R, NulDelimitedCodec>,
    state: Arc<watch::Sender<TransportState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    R: AsyncRead + Unpin,
{
    state.send_replace(TransportState::Open);
    if events.send(TransportEvent::Open).is_err() {
        return;
    }

    loop {
        let event = match frames.next().await {
            Some(Ok(frame)) => match String::from_utf8(frame.to_vec()) {
                Ok(text) => TransportEvent::Message(text),
                Err(e) => TransportEvent::Undecodable(e),
            },
            Some(Err(e)) => {
                tracing::error!(error = %e, "Pipe read failed");
                break;
            }
            None => break,
        };

        if events.send(event).is_err() {
            tracing::debug!("Transport event receiver dropped");
            break;
        }
    }

    tracing::debug!("Inbound pipe closed");
    state.send_replace(TransportState::Closed);
    let _ = events.send(TransportEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    struct Remote {
        /// Remote writes here, the transport reads it.
        outbound: DuplexStream,
        /// Transport writes here, the remote reads it.
        inbound: DuplexStream,
    }

    fn open() -> (PipeTransport, mpsc::UnboundedReceiver<TransportEvent>, Remote) {
        let (transport_in, outbound) = duplex(4096);
        let (transport_out, inbound) = duplex(4096);
        let (transport, events) = PipeTransport::open(transport_in, transport_out);
        (transport, events, Remote { outbound, inbound })
    }

    #[tokio::test]
    async fn opens_without_handshake() {
        let (transport, mut events, _remote) = open();

        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));
        assert_eq!(transport.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn delivers_messages_in_order_then_closes_once() {
        let (transport, mut events, mut remote) = open();

        remote
            .outbound
            .write_all(b"{\"id\":1,\"result\":{}}\0{\"method\":\"Foo.bar\",\"params\":{}}\0")
            .await
            .unwrap();
        drop(remote.outbound);

        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));
        match events.recv().await {
            Some(TransportEvent::Message(text)) => assert_eq!(text, r#"{"id":1,"result":{}}"#),
            other => panic!("expected message, got {other:?}"),
        }
        match events.recv().await {
            Some(TransportEvent::Message(text)) => {
                assert_eq!(text, r#"{"method":"Foo.bar","params":{}}"#)
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(TransportEvent::Closed)));
        assert!(events.recv().await.is_none());
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn reports_undecodable_frames() {
        let (_transport, mut events, mut remote) = open();

        remote.outbound.write_all(b"\xff\xfe\0").await.unwrap();

        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));
        match events.recv().await {
            Some(TransportEvent::Undecodable(e)) => assert_eq!(e.as_bytes(), b"\xff\xfe"),
            other => panic!("expected undecodable frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_writes_payload_and_sentinel() {
        let (transport, _events, mut remote) = open();

        transport
            .send(Bytes::from_static(br#"{"id":1,"method":"Fetch.enable"}"#))
            .await
            .unwrap();

        let mut buf = vec![0u8; 33];
        remote.inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"{\"id\":1,\"method\":\"Fetch.enable\"}\0");
    }

    #[tokio::test]
    async fn close_cancels_a_write_blocked_on_a_full_pipe() {
        let (transport_in, _outbound) = duplex(64);
        let (transport_out, _inbound) = duplex(64);
        let (transport, mut events) = PipeTransport::open(transport_in, transport_out);
        let transport = Arc::new(transport);
        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));

        // Nobody reads `_inbound`, so this parks with the writer lock held.
        let buffered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let write = tokio::spawn({
            let transport = Arc::clone(&transport);
            let buffered = Arc::clone(&buffered);
            async move {
                transport
                    .send_frame(Bytes::from(vec![b'x'; 1 << 20]), || {
                        buffered.store(true, std::sync::atomic::Ordering::SeqCst)
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!write.is_finished());

        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .expect("close must not wait for the blocked write");

        let err = write.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(buffered.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let (transport, mut events, mut remote) = open();
        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));

        transport.close().await;
        transport.close().await;

        assert_eq!(transport.state(), TransportState::Closed);
        assert!(events.recv().await.is_none());

        let err = transport.send(Bytes::from_static(b"{}")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let mut buf = Vec::new();
        let read = remote.inbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}
