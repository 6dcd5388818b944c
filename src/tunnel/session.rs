//! Per-session plumbing shared by both engines
//!
//! A session owns one control channel. Frames arriving on it are surfaced by
//! a dedicated reader task; bytes flowing through data sockets are shuttled
//! by one relay task per stream. All control-channel writes happen on the
//! session loop, so a frame is always a single uninterleaved write.

use super::{READ_CHUNK_SIZE, TunnelError};
use crate::protocol::{Frame, ProtocolError, MAX_PAYLOAD_SIZE};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// JoinHandle wrapper that aborts the task when dropped, so helper tasks
/// (frame readers, per-client listeners) never outlive their session even
/// when the session task itself is cancelled.
pub(crate) struct SessionTask(pub JoinHandle<()>);

impl Drop for SessionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Message from the control-channel reader task
pub(crate) enum ReaderMessage {
    /// A complete frame was read
    Frame(Frame),
    /// The peer closed the channel on a frame boundary
    Closed,
    /// Decoding failed; the session must end
    Error(ProtocolError),
}

/// Read frames off the control channel until it closes or decoding fails.
pub(crate) async fn read_frames<R>(mut reader: R, tx: mpsc::Sender<ReaderMessage>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match Frame::read_from(&mut reader, MAX_PAYLOAD_SIZE).await {
            Ok(frame) => {
                if tx.send(ReaderMessage::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Err(ProtocolError::Closed) => {
                let _ = tx.send(ReaderMessage::Closed).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(ReaderMessage::Error(e)).await;
                return;
            }
        }
    }
}

/// Write one frame as a single contiguous buffer.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&frame.encode())
        .await
        .map_err(TunnelError::ControlWrite)?;
    writer.flush().await.map_err(TunnelError::ControlWrite)
}

/// Event from a stream relay task to its session loop
pub(crate) enum StreamEvent {
    /// Bytes read from the data socket, to be framed onto the control channel
    Data { stream_id: u32, data: Bytes },
    /// The data socket reached EOF or failed; the stream should be closed
    Closed { stream_id: u32 },
}

/// Shuttle bytes between one data socket and the session loop.
///
/// Socket reads become [`StreamEvent::Data`]; frames delivered on `data_rx`
/// are written to the socket. The task ends when the socket closes, a write
/// fails, or the session drops the sending side of `data_rx` (peer CLOSE),
/// which also tears the socket down.
pub(crate) async fn relay_stream(
    stream_id: u32,
    socket: TcpStream,
    mut data_rx: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<StreamEvent>,
) {
    let (mut reader, mut writer) = socket.into_split();

    let pull = async {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if events
                        .send(StreamEvent::Data { stream_id, data })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    debug!(stream = stream_id, error = %e, "data socket read error");
                    break;
                }
            }
        }
        let _ = events.send(StreamEvent::Closed { stream_id }).await;
    };

    let push = async {
        while let Some(data) = data_rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                debug!(stream = stream_id, error = %e, "data socket write error");
                let _ = events.send(StreamEvent::Closed { stream_id }).await;
                return;
            }
        }
    };

    tokio::select! {
        _ = pull => {}
        _ = push => {}
    }
}

/// Server-side state for one connected client.
pub(crate) struct ClientSession {
    pub id: String,
    next_stream_id: u32,
    /// Live streams, keyed by stream ID; the sender feeds the relay task.
    pub streams: HashMap<u32, mpsc::Sender<Bytes>>,
    /// Mapping metadata reported by INIT, kept for diagnostics.
    pub local_addr: String,
    pub remote_port: u16,
    pub init_seen: bool,
    /// Acceptor task for this client's own public listener, if it asked for one.
    pub listener_task: Option<SessionTask>,
}

impl ClientSession {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            next_stream_id: 0,
            streams: HashMap::new(),
            local_addr: String::new(),
            remote_port: 0,
            init_seen: false,
            listener_task: None,
        }
    }

    /// Allocate the next stream ID. The first allocation yields 1, so the
    /// reserved INIT id 0 is never produced.
    pub fn alloc_stream_id(&mut self) -> u32 {
        self.next_stream_id += 1;
        self.next_stream_id
    }

    /// Drop every live stream and release the per-client listener.
    pub fn shutdown(&mut self) {
        self.listener_task.take();
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_stream_ids_start_at_one() {
        let mut session = ClientSession::new("client-1");
        assert_eq!(session.alloc_stream_id(), 1);
        assert_eq!(session.alloc_stream_id(), 2);
        assert_eq!(session.alloc_stream_id(), 3);
    }

    #[tokio::test]
    async fn test_relay_stream_shuttles_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut remote = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        let (data_tx, data_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let relay = tokio::spawn(relay_stream(5, socket, data_rx, event_tx));

        // Socket reads surface as Data events tagged with the stream id
        remote.write_all(b"hello").await.unwrap();
        match event_rx.recv().await.unwrap() {
            StreamEvent::Data { stream_id, data } => {
                assert_eq!(stream_id, 5);
                assert_eq!(&data[..], b"hello");
            }
            StreamEvent::Closed { .. } => panic!("unexpected close"),
        }

        // Session-side sends are written to the socket
        data_tx.send(Bytes::from_static(b"world")).await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // Peer EOF produces a Closed event and ends the relay
        remote.shutdown().await.unwrap();
        match event_rx.recv().await.unwrap() {
            StreamEvent::Closed { stream_id } => assert_eq!(stream_id, 5),
            StreamEvent::Data { .. } => panic!("unexpected data"),
        }
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_stream_ends_when_session_drops_sender() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut remote = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();

        let (data_tx, data_rx) = mpsc::channel(8);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let relay = tokio::spawn(relay_stream(9, socket, data_rx, event_tx));

        // Dropping the sender is how the session closes a stream on peer CLOSE
        drop(data_tx);
        relay.await.unwrap();

        // The socket is torn down with the relay
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }
}
