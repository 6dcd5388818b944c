//! Client engine
//!
//! Keeps one control channel to the server alive through a fixed-delay
//! reconnect loop, announces the mapping with INIT, dials the local service
//! on NEW_CONN, and pumps bytes between local sockets and the channel.

use super::session::{
    read_frames, relay_stream, write_frame, ReaderMessage, SessionTask, StreamEvent,
};
use super::{TunnelError, CHANNEL_DEPTH, LOCAL_DIAL_TIMEOUT, RECONNECT_DELAY, SERVER_DIAL_TIMEOUT};
use crate::protocol::{Frame, FrameType, InitConfig};
use crate::transport::PqcConnector;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Reverse tunnel client.
pub struct Client {
    server_addr: String,
    local_addr: String,
    remote_port: u16,
    tls: Option<PqcConnector>,
}

impl Client {
    pub fn new(server_addr: &str, local_addr: &str, remote_port: u16) -> Self {
        Self {
            server_addr: server_addr.to_string(),
            local_addr: local_addr.to_string(),
            remote_port,
            tls: None,
        }
    }

    /// Enable PQC mTLS on the control channel.
    pub fn with_tls(mut self, connector: PqcConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Run the reconnect loop. Ends only when the task is cancelled.
    pub async fn run(self) -> crate::Result<()> {
        loop {
            match self.connect_and_serve().await {
                Ok(()) => info!(server = %self.server_addr, "disconnected from server"),
                Err(e) => {
                    error!(server = %self.server_addr, error = %e, "connection to server failed")
                }
            }
            info!("reconnecting in {}s...", RECONNECT_DELAY.as_secs());
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_serve(&self) -> Result<(), TunnelError> {
        let tcp = timeout(SERVER_DIAL_TIMEOUT, TcpStream::connect(&self.server_addr))
            .await
            .map_err(|_| {
                TunnelError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "server dial timed out",
                ))
            })??;
        tcp.set_nodelay(true)?;

        match &self.tls {
            Some(connector) => {
                let stream = connector.connect(tcp).await?;
                info!(server = %self.server_addr, "PQC mTLS control channel established");
                self.serve(stream).await
            }
            None => {
                info!(server = %self.server_addr, "control channel established");
                self.serve(tcp).await
            }
        }
    }

    /// Run one connected session; any error here drops back into the
    /// reconnect loop with every local stream closed.
    async fn serve<S>(&self, stream: S) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);

        if self.remote_port > 0 {
            let init = InitConfig {
                remote_port: self.remote_port,
                local_addr: self.local_addr.clone(),
            };
            write_frame(&mut write_half, &Frame::init(&init)).await?;
            info!(remote_port = self.remote_port, local = %self.local_addr, "sent tunnel configuration");
        }

        let (reader_tx, mut reader_rx) = mpsc::channel(CHANNEL_DEPTH);
        let _reader = SessionTask(tokio::spawn(read_frames(read_half, reader_tx)));

        let (event_tx, mut event_rx) = mpsc::channel(CHANNEL_DEPTH);
        let mut streams: HashMap<u32, mpsc::Sender<Bytes>> = HashMap::new();

        let result = loop {
            tokio::select! {
                msg = reader_rx.recv() => match msg {
                    Some(ReaderMessage::Frame(frame)) => {
                        if let Err(e) = self
                            .handle_server_frame(frame, &mut streams, &mut write_half, &event_tx)
                            .await
                        {
                            break Err(e);
                        }
                    }
                    Some(ReaderMessage::Closed) | None => break Ok(()),
                    Some(ReaderMessage::Error(e)) => break Err(e.into()),
                },

                Some(event) = event_rx.recv() => match event {
                    StreamEvent::Data { stream_id, data } => {
                        if streams.contains_key(&stream_id) {
                            if let Err(e) =
                                write_frame(&mut write_half, &Frame::data(stream_id, data)).await
                            {
                                break Err(e);
                            }
                        }
                    }
                    StreamEvent::Closed { stream_id } => {
                        if streams.remove(&stream_id).is_some() {
                            debug!(stream = stream_id, "local connection closed");
                            if let Err(e) =
                                write_frame(&mut write_half, &Frame::close(stream_id)).await
                            {
                                break Err(e);
                            }
                        }
                    }
                },
            }
        };

        streams.clear();
        result
    }

    /// Apply one frame received from the server.
    async fn handle_server_frame<W>(
        &self,
        frame: Frame,
        streams: &mut HashMap<u32, mpsc::Sender<Bytes>>,
        write_half: &mut W,
        event_tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        match frame.frame_type {
            FrameType::NewConn => {
                let stream_id = frame.stream_id;
                debug!(stream = stream_id, local = %self.local_addr, "NEW_CONN received, dialing local service");

                // Dialed inline so no DATA for this stream can be handled
                // before the map entry exists.
                let socket =
                    match timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&self.local_addr)).await {
                        Ok(Ok(socket)) => socket,
                        Ok(Err(e)) => {
                            warn!(stream = stream_id, local = %self.local_addr, error = %e, "local dial failed");
                            return write_frame(write_half, &Frame::close(stream_id)).await;
                        }
                        Err(_) => {
                            warn!(stream = stream_id, local = %self.local_addr, "local dial timed out");
                            return write_frame(write_half, &Frame::close(stream_id)).await;
                        }
                    };
                socket.set_nodelay(true).ok();

                let (data_tx, data_rx) = mpsc::channel(CHANNEL_DEPTH);
                streams.insert(stream_id, data_tx);
                tokio::spawn(relay_stream(stream_id, socket, data_rx, event_tx.clone()));
                debug!(stream = stream_id, local = %self.local_addr, "local connection established");
                Ok(())
            }
            FrameType::Data => {
                let stream_id = frame.stream_id;
                match streams.get(&stream_id) {
                    Some(data_tx) => {
                        if data_tx.send(frame.payload).await.is_err() {
                            streams.remove(&stream_id);
                            write_frame(write_half, &Frame::close(stream_id)).await?;
                        }
                    }
                    None => {
                        debug!(stream = stream_id, "data frame for unknown stream, discarding");
                    }
                }
                Ok(())
            }
            FrameType::Close => {
                let stream_id = frame.stream_id;
                if streams.remove(&stream_id).is_some() {
                    debug!(stream = stream_id, "stream closed by server");
                    // Echoed back so a peer still reading lingering bytes
                    // cannot leave the stream half-open.
                    write_frame(write_half, &Frame::close(stream_id)).await?;
                }
                Ok(())
            }
            FrameType::Init => {
                warn!(stream = frame.stream_id, "unexpected INIT from server, ignoring");
                Ok(())
            }
            FrameType::Unknown(value) => {
                warn!(frame_type = value, stream = frame.stream_id, "unknown frame type, ignoring");
                Ok(())
            }
        }
    }
}
