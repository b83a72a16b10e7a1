//! TCP edge: listening server, bootstrap dialing and framed channels
//!
//! The listener accepts plain connections and hands each one to routing as
//! a channel immediately; neighbor bindings then form through Hello
//! gossip. Frames are length-prefixed (u32 big-endian). The TCP connector
//! used for direct peering advertises the node's listening endpoint as its
//! description and dials the remote endpoint when an answer arrives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{next_channel_id, Channel, CloseCallback, FrameCallback};
use crate::crypto::Identifier;
use crate::error::{Error, Result};
use crate::peering::{
    Connection, ConnectionHandler, Connector, Description, SignalingState, DESCRIPTION_ANSWER,
    DESCRIPTION_OFFER,
};
use crate::routing::Routing;

/// Upper bound on one framed message; a full envelope stays well below.
const MAX_FRAME_SIZE: usize = 1 << 20;

/// A framed TCP connection. Outbound frames go through a writer task;
/// inbound frames invoke the installed callback from the reader task.
pub struct TcpChannel {
    id: u64,
    open: AtomicBool,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    frame_callback: RwLock<Option<FrameCallback>>,
    close_callback: RwLock<Option<CloseCallback>>,
}

impl TcpChannel {
    /// Wraps a connected stream; must run inside a tokio runtime.
    pub fn spawn(stream: TcpStream) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id: next_channel_id(),
            open: AtomicBool::new(true),
            sender,
            frame_callback: RwLock::new(None),
            close_callback: RwLock::new(None),
        });

        tokio::spawn(write_loop(write_half, receiver));
        let reader_channel = Arc::downgrade(&channel);
        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match read_frame(&mut read_half).await {
                    Ok(frame) => {
                        let Some(channel) = reader_channel.upgrade() else { break };
                        let callback = channel.frame_callback.read().clone();
                        if let Some(callback) = callback {
                            callback(&frame);
                        }
                    }
                    Err(e) => {
                        debug!("Connection ended: {}", e);
                        if let Some(channel) = reader_channel.upgrade() {
                            channel.shutdown();
                        }
                        break;
                    }
                }
            }
        });

        channel
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let callback = self.close_callback.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        self.sender.send(frame.to_vec()).map_err(|_| Error::ChannelClosed)
    }

    fn close(&self) {
        // The socket itself goes down once the last reference drops and
        // the write loop exits; the state flips immediately.
        self.shutdown();
    }

    fn on_frame(&self, callback: Option<FrameCallback>) {
        *self.frame_callback.write() = callback;
    }

    fn on_close(&self, callback: Option<CloseCallback>) {
        *self.close_callback.write() = callback;
    }
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let mut length = [0u8; 4];
    read_half.read_exact(&mut length).await?;
    let length = u32::from_be_bytes(length) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut frame = vec![0u8; length];
    read_half.read_exact(&mut frame).await?;
    Ok(frame)
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut receiver: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = receiver.recv().await {
        let length = (frame.len() as u32).to_be_bytes();
        if write_half.write_all(&length).await.is_err()
            || write_half.write_all(&frame).await.is_err()
        {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Plain listening server; every accepted connection becomes a channel.
pub struct Server {
    local_addr: SocketAddr,
    external: Option<(String, u16)>,
}

impl Server {
    pub fn bind(
        port: u16,
        external: Option<(String, u16)>,
        routing: Arc<Routing>,
    ) -> Result<Arc<Self>> {
        let handle = Handle::try_current()
            .map_err(|_| Error::Config("listening requires a tokio runtime".into()))?;

        let listener = std::net::TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| Error::Config(format!("cannot bind port {}: {}", port, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Config(format!("cannot configure listener: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("cannot read listener address: {}", e)))?;

        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(listener)
                .map_err(|e| Error::Config(format!("cannot register listener: {}", e)))?
        };

        info!("Listening on {}", local_addr);
        handle.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        info!("Incoming connection from {}", remote);
                        let channel = TcpChannel::spawn(stream);
                        routing.add_channel(channel);
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                }
            }
        });

        Ok(Arc::new(Self { local_addr, external }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bootstrap URL other nodes can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.endpoint())
    }

    /// The dialable `host:port` endpoint, preferring the configured
    /// external address.
    pub fn endpoint(&self) -> String {
        match &self.external {
            Some((host, port)) => format!("{}:{}", host, port),
            None => format!("{}", self.local_addr),
        }
    }
}

/// Extracts `host:port` from a bootstrap URL (`ws://`, `wss://` or bare).
fn host_port(url: &str) -> Result<String> {
    let rest = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    };
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        return Err(Error::Config(format!("no host in url: {}", url)));
    }
    if host.rsplit(':').next().is_some_and(|p| p.parse::<u16>().is_ok()) {
        Ok(host.to_string())
    } else {
        Ok(format!("{}:{}", host, crate::node::DEFAULT_PORT))
    }
}

/// Dials a bootstrap URL in the background; the connection is handed to
/// routing once established.
pub fn connect_url(routing: Arc<Routing>, url: &str) -> Result<()> {
    let handle = Handle::try_current()
        .map_err(|_| Error::Config("dialing requires a tokio runtime".into()))?;
    let address = host_port(url)?;

    info!("Connecting to {}", address);
    handle.spawn(async move {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                let channel = TcpChannel::spawn(stream);
                routing.add_channel(channel);
            }
            Err(e) => warn!("Connection to {} failed: {}", address, e),
        }
    });
    Ok(())
}

/// Direct-connection collaborator over plain TCP. Local descriptions carry
/// this node's listening endpoint; the side receiving an answer dials it.
pub struct TcpConnector {
    endpoint: Option<String>,
    handle: Handle,
}

impl TcpConnector {
    pub fn new(endpoint: Option<String>) -> Result<Arc<Self>> {
        let handle = Handle::try_current()
            .map_err(|_| Error::Config("peering requires a tokio runtime".into()))?;
        Ok(Arc::new(Self { endpoint, handle }))
    }
}

impl Connector for TcpConnector {
    fn open(
        &self,
        remote_id: &Identifier,
        relays: Vec<String>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<dyn Connection> {
        if !relays.is_empty() {
            // Plain TCP cannot relay; a future connector will.
            debug!("Ignoring {} relay urls for {}", relays.len(), remote_id);
        }
        Arc::new(TcpConnection {
            endpoint: self.endpoint.clone(),
            handler,
            handle: self.handle.clone(),
            state: Mutex::new(SignalingState::Stable),
        })
    }
}

struct TcpConnection {
    endpoint: Option<String>,
    handler: Arc<dyn ConnectionHandler>,
    handle: Handle,
    state: Mutex<SignalingState>,
}

impl TcpConnection {
    fn local_description(&self, kind: &str) -> Description {
        Description {
            kind: kind.to_string(),
            content: self.endpoint.clone().unwrap_or_default(),
        }
    }

    fn dial(&self, address: String) {
        let handler = self.handler.clone();
        self.handle.spawn(async move {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    let channel = TcpChannel::spawn(stream);
                    handler.on_channel(channel);
                }
                Err(e) => warn!("Direct dial to {} failed: {}", address, e),
            }
        });
    }
}

impl Connection for TcpConnection {
    fn offer(&self) {
        *self.state.lock() = SignalingState::HaveLocalOffer;
        self.handler.on_local_description(self.local_description(DESCRIPTION_OFFER));
    }

    fn apply_remote_description(&self, description: Description) -> Result<()> {
        match description.kind.as_str() {
            DESCRIPTION_OFFER => {
                *self.state.lock() = SignalingState::Stable;
                // Answer with our endpoint and wait for the inbound dial;
                // the accepted connection binds through Hello gossip.
                self.handler.on_local_description(self.local_description(DESCRIPTION_ANSWER));
                Ok(())
            }
            DESCRIPTION_ANSWER => {
                *self.state.lock() = SignalingState::Stable;
                if description.content.is_empty() {
                    return Err(Error::Malformed("answer carries no endpoint"));
                }
                self.dial(description.content);
                Ok(())
            }
            _ => Err(Error::Malformed("unknown description type")),
        }
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    fn close(&self) {}
}
