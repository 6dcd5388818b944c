//! Server engine
//!
//! Accepts control channels from clients, owns the public listeners, and for
//! every external TCP session allocates a stream ID, announces it on the
//! owning client's control channel, and pumps bytes between the external
//! socket and the channel.

use super::session::{
    read_frames, relay_stream, write_frame, ClientSession, ReaderMessage, SessionTask, StreamEvent,
};
use super::{TunnelError, CHANNEL_DEPTH};
use crate::config::normalize_listen_addr;
use crate::protocol::{Frame, FrameType, InitConfig};
use crate::transport::PqcAcceptor;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Handle for routing external sockets into a client session.
#[derive(Clone)]
struct ClientHandle {
    attach_tx: mpsc::Sender<TcpStream>,
}

type Registry = Arc<RwLock<HashMap<String, ClientHandle>>>;

/// Reverse tunnel server.
pub struct Server {
    control_listener: TcpListener,
    public_listener: Option<TcpListener>,
    tls: Option<PqcAcceptor>,
    clients: Registry,
    next_client_id: Arc<AtomicU32>,
}

impl Server {
    /// Bind the control listener and, when `public_listen` is non-empty, the
    /// global public listener. Either bind failing is fatal.
    pub async fn bind(
        control_listen: &str,
        public_listen: &str,
        tls: Option<PqcAcceptor>,
    ) -> Result<Self, TunnelError> {
        let control_addr = normalize_listen_addr(control_listen);
        let control_listener =
            TcpListener::bind(&control_addr)
                .await
                .map_err(|e| TunnelError::Listen {
                    addr: control_addr.clone(),
                    source: e,
                })?;
        info!(addr = %control_addr, tls = tls.is_some(), "control listener started");

        let public_listener = if public_listen.is_empty() {
            info!("no global public listener; ports are assigned per client via INIT");
            None
        } else {
            let public_addr = normalize_listen_addr(public_listen);
            let listener =
                TcpListener::bind(&public_addr)
                    .await
                    .map_err(|e| TunnelError::Listen {
                        addr: public_addr.clone(),
                        source: e,
                    })?;
            info!(addr = %public_addr, "public listener started");
            Some(listener)
        };

        Ok(Self {
            control_listener,
            public_listener,
            tls,
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_client_id: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Actual control listen address (useful when bound to port 0).
    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control_listener.local_addr()
    }

    /// Actual global public listen address, if one is configured.
    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.public_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Accept control connections until the future is dropped. Dropping it
    /// cancels the public acceptor and every client session.
    pub async fn run(self) -> Result<(), TunnelError> {
        let mut tasks = JoinSet::new();

        let has_global_public = self.public_listener.is_some();
        if let Some(listener) = self.public_listener {
            tasks.spawn(accept_public_global(listener, Arc::clone(&self.clients)));
        }

        loop {
            tokio::select! {
                conn = self.control_listener.accept() => {
                    let (tcp, peer) = match conn {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "control accept error");
                            continue;
                        }
                    };

                    let tls = self.tls.clone();
                    let clients = Arc::clone(&self.clients);
                    let next_client_id = Arc::clone(&self.next_client_id);
                    tasks.spawn(async move {
                        tcp.set_nodelay(true).ok();
                        match tls {
                            Some(acceptor) => match acceptor.accept(tcp).await {
                                Ok(stream) => {
                                    let id = allocate_client_id(&next_client_id);
                                    run_control_session(id, peer, stream, clients, has_global_public)
                                        .await;
                                }
                                Err(e) => warn!(%peer, error = %e, "control handshake failed"),
                            },
                            None => {
                                let id = allocate_client_id(&next_client_id);
                                run_control_session(id, peer, tcp, clients, has_global_public).await;
                            }
                        }
                    });
                }

                // Reap finished session tasks
                Some(_) = tasks.join_next() => {}
            }
        }
    }
}

fn allocate_client_id(counter: &AtomicU32) -> String {
    format!("client-{}", counter.fetch_add(1, Ordering::Relaxed) + 1)
}

/// Register a session, run it, and tear everything down when it ends.
async fn run_control_session<S>(
    client_id: String,
    peer: SocketAddr,
    stream: S,
    clients: Registry,
    has_global_public: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!(client = %client_id, %peer, "client connected");

    let (attach_tx, attach_rx) = mpsc::channel(CHANNEL_DEPTH);
    clients.write().await.insert(
        client_id.clone(),
        ClientHandle {
            attach_tx: attach_tx.clone(),
        },
    );

    let result = session_loop(&client_id, stream, attach_tx, attach_rx, has_global_public).await;

    clients.write().await.remove(&client_id);
    match result {
        Ok(()) => info!(client = %client_id, "client disconnected"),
        Err(e) => warn!(client = %client_id, error = %e, "control session ended"),
    }
}

async fn session_loop<S>(
    client_id: &str,
    stream: S,
    attach_tx: mpsc::Sender<TcpStream>,
    mut attach_rx: mpsc::Receiver<TcpStream>,
    has_global_public: bool,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);

    let (reader_tx, mut reader_rx) = mpsc::channel(CHANNEL_DEPTH);
    let _reader = SessionTask(tokio::spawn(read_frames(read_half, reader_tx)));

    let (event_tx, mut event_rx) = mpsc::channel(CHANNEL_DEPTH);
    let mut session = ClientSession::new(client_id);

    let result = loop {
        tokio::select! {
            msg = reader_rx.recv() => match msg {
                Some(ReaderMessage::Frame(frame)) => {
                    if let Err(e) = handle_client_frame(
                        &mut session,
                        frame,
                        &mut write_half,
                        &attach_tx,
                        has_global_public,
                    )
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
                    // A relay may still deliver reads for a stream that was
                    // just removed; those are dropped.
                    if session.streams.contains_key(&stream_id) {
                        if let Err(e) =
                            write_frame(&mut write_half, &Frame::data(stream_id, data)).await
                        {
                            break Err(e);
                        }
                    }
                }
                StreamEvent::Closed { stream_id } => {
                    if session.streams.remove(&stream_id).is_some() {
                        debug!(client = %session.id, stream = stream_id, "external connection closed");
                        if let Err(e) =
                            write_frame(&mut write_half, &Frame::close(stream_id)).await
                        {
                            break Err(e);
                        }
                    }
                }
            },

            Some(socket) = attach_rx.recv() => {
                let stream_id = session.alloc_stream_id();
                info!(client = %session.id, stream = stream_id, "new external connection");

                // NEW_CONN goes on the wire before the entry exists: the
                // client cannot produce DATA for the stream until it has
                // seen NEW_CONN.
                if let Err(e) = write_frame(&mut write_half, &Frame::new_conn(stream_id)).await {
                    break Err(e);
                }

                let (data_tx, data_rx) = mpsc::channel(CHANNEL_DEPTH);
                session.streams.insert(stream_id, data_tx);
                tokio::spawn(relay_stream(stream_id, socket, data_rx, event_tx.clone()));
            }
        }
    };

    session.shutdown();
    result
}

/// Apply one frame received from the client.
async fn handle_client_frame<W>(
    session: &mut ClientSession,
    frame: Frame,
    write_half: &mut W,
    attach_tx: &mpsc::Sender<TcpStream>,
    has_global_public: bool,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    match frame.frame_type {
        FrameType::Init => {
            handle_init(session, &frame.payload, attach_tx, has_global_public).await;
            Ok(())
        }
        FrameType::Data => {
            let stream_id = frame.stream_id;
            match session.streams.get(&stream_id) {
                Some(data_tx) => {
                    if data_tx.send(frame.payload).await.is_err() {
                        // Relay already died on a socket error; close our side.
                        session.streams.remove(&stream_id);
                        write_frame(write_half, &Frame::close(stream_id)).await?;
                    }
                }
                None => {
                    debug!(client = %session.id, stream = stream_id, "data frame for unknown stream, discarding");
                }
            }
            Ok(())
        }
        FrameType::Close => {
            if session.streams.remove(&frame.stream_id).is_some() {
                debug!(client = %session.id, stream = frame.stream_id, "stream closed by client");
            }
            Ok(())
        }
        FrameType::NewConn => {
            warn!(client = %session.id, stream = frame.stream_id, "unexpected NEW_CONN from client, ignoring");
            Ok(())
        }
        FrameType::Unknown(value) => {
            warn!(client = %session.id, frame_type = value, stream = frame.stream_id, "unknown frame type, ignoring");
            Ok(())
        }
    }
}

/// Apply the INIT frame: record the mapping and, when the server has no
/// global public listener, bind this client's own one.
async fn handle_init(
    session: &mut ClientSession,
    payload: &[u8],
    attach_tx: &mpsc::Sender<TcpStream>,
    has_global_public: bool,
) {
    if session.init_seen {
        warn!(client = %session.id, "duplicate INIT frame, ignoring");
        return;
    }
    session.init_seen = true;

    let config = match InitConfig::decode(payload) {
        Ok(config) => config,
        Err(e) => {
            warn!(client = %session.id, error = %e, "invalid INIT payload, ignoring");
            return;
        }
    };

    session.local_addr = config.local_addr;
    session.remote_port = config.remote_port;

    if has_global_public {
        info!(
            client = %session.id,
            local = %session.local_addr,
            "client joins the global public listener; requested port ignored"
        );
        return;
    }

    if session.remote_port == 0 {
        info!(client = %session.id, local = %session.local_addr, "client did not request a public port");
        return;
    }

    let addr = format!("0.0.0.0:{}", session.remote_port);
    match TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!(client = %session.id, addr = %addr, local = %session.local_addr, "per-client public listener started");
            session.listener_task = Some(SessionTask(tokio::spawn(accept_public_for_client(
                listener,
                session.id.clone(),
                attach_tx.clone(),
            ))));
        }
        Err(e) => {
            // The session stays up; it just has no public exposure.
            warn!(client = %session.id, addr = %addr, error = %e, "failed to bind per-client public listener");
        }
    }
}

/// Accept sessions on the global public listener and route each to any live
/// client. With no client connected the socket is closed immediately.
async fn accept_public_global(listener: TcpListener, clients: Registry) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "public accept error");
                continue;
            }
        };
        socket.set_nodelay(true).ok();

        let target = {
            let clients = clients.read().await;
            clients
                .iter()
                .next()
                .map(|(id, handle)| (id.clone(), handle.attach_tx.clone()))
        };

        match target {
            Some((client_id, attach_tx)) => {
                debug!(%peer, client = %client_id, "routing external connection");
                if attach_tx.send(socket).await.is_err() {
                    warn!(%peer, client = %client_id, "client session gone, dropping external connection");
                }
            }
            None => {
                warn!(%peer, "no connected client, closing external connection");
            }
        }
    }
}

/// Accept sessions on a per-client public listener; everything goes to the
/// owning client. Ends when the session side of the channel is gone.
async fn accept_public_for_client(
    listener: TcpListener,
    client_id: String,
    attach_tx: mpsc::Sender<TcpStream>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                socket.set_nodelay(true).ok();
                debug!(%peer, client = %client_id, "external connection on per-client listener");
                if attach_tx.send(socket).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!(client = %client_id, error = %e, "public accept error");
            }
        }
    }
}
