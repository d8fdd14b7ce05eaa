//! Drives a single peer connection through handshake and the peer message
//! loop, translating wire messages into coordinator calls.

use std::{net::SocketAddr, sync::Arc};

use futures::{select, stream::Fuse, FutureExt, Sink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex, RwLock,
    },
};
use tokio_util::codec::{Framed, FramedParts};

use super::codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use crate::{
    coordinator::{Coordinator, SessionId},
    error::{PeerError, Result},
    Bitfield, PeerId, Sha1Hash,
};

/// The multi-consumer queue of peer addresses that sessions pull from; the
/// supervisor is the sole producer.
pub type PeerQueue = Arc<Mutex<UnboundedReceiver<SocketAddr>>>;

/// The channel on which the supervisor sends a session a shutdown command.
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands the supervisor can send a running session.
pub enum Command {
    Shutdown,
}

/// Drives one peer connection at a time, restarting with the next address
/// from the shared queue whenever the current one ends.
pub struct PeerSession {
    client_id: PeerId,
    info_hash: Sha1Hash,
    piece_count: usize,
    coordinator: Arc<RwLock<Coordinator>>,
    peer_queue: PeerQueue,
    cmd_port: Fuse<Receiver>,
}

/// Per-connection state: reset every time a new address is pulled off the
/// queue.
struct State {
    session_id: Option<SessionId>,
    choked: bool,
    interested: bool,
    pending_request: bool,
    sent_interested: bool,
}

impl Default for State {
    fn default() -> Self {
        // A freshly handshaked connection enters {Choked, Interested}.
        Self {
            session_id: None,
            choked: true,
            interested: true,
            pending_request: false,
            sent_interested: false,
        }
    }
}

impl State {
    fn can_request(&self) -> bool {
        !self.choked && self.interested
    }
}

impl PeerSession {
    /// Creates a new session that pulls addresses from `peer_queue` and
    /// returns the command sender the supervisor uses to stop it.
    pub fn new(
        client_id: PeerId,
        info_hash: Sha1Hash,
        piece_count: usize,
        coordinator: Arc<RwLock<Coordinator>>,
        peer_queue: PeerQueue,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                client_id,
                info_hash,
                piece_count,
                coordinator,
                peer_queue,
                cmd_port: cmd_port.fuse(),
            },
            cmd_chan,
        )
    }

    /// Runs the outer "pull peer address, handshake, run until dead" loop
    /// until told to shut down or the peer queue is exhausted and closed.
    pub async fn start(&mut self) {
        loop {
            let addr = select! {
                addr = next_peer_addr(&self.peer_queue).fuse() => match addr {
                    Some(addr) => addr,
                    None => {
                        log::info!("peer queue closed, ending session");
                        break;
                    }
                },
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("peer session shutting down");
                            break;
                        }
                    }
                }
            };

            if let Err(error) = self.run_with(addr).await {
                log::debug!("peer {} session ended: {}", addr, error);
            }
        }
    }

    async fn run_with(&mut self, addr: SocketAddr) -> Result<()> {
        log::info!("connecting to peer {}", addr);
        let socket = TcpStream::connect(addr).await.map_err(PeerError::from)?;
        let mut handshake_socket = Framed::new(socket, HandshakeCodec);

        let handshake = Handshake::new(self.info_hash, self.client_id);
        handshake_socket.send(handshake).await?;

        let peer_handshake = match handshake_socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(PeerError::InvalidHandshake.into()),
        };
        if peer_handshake.info_hash != self.info_hash {
            return Err(PeerError::InvalidInfoHash.into());
        }
        log::info!("peer {} handshake ok", addr);

        let old_parts = handshake_socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.run_messages(addr, socket).await
    }

    async fn run_messages(
        &mut self,
        addr: SocketAddr,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut state = State::default();

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.handle_message(&mut state, msg).await?;
                    self.make_request(&mut sink, &mut state).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("stopping session with peer {}", addr);
                            return Ok(());
                        }
                    }
                }
                complete => return Ok(()),
            }
        }
    }

    async fn handle_message(&mut self, state: &mut State, msg: Message) -> Result<()> {
        match msg {
            Message::Choke => state.choked = true,
            Message::Unchoke => state.choked = false,
            Message::Interested => state.interested = true,
            Message::NotInterested => state.interested = false,
            Message::Have(index) => {
                if let Some(session_id) = state.session_id {
                    self.coordinator.write().await.update_peer_piece(session_id, index);
                }
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.piece_count, false);
                let session_id = self.coordinator.write().await.add_peer(bitfield);
                state.session_id = Some(session_id);
            }
            Message::Piece { info, data } => {
                state.pending_request = false;
                self.coordinator
                    .write()
                    .await
                    .on_block_complete(info.piece_index, info.offset, data)?;
            }
            Message::Request(_) | Message::Cancel(_) => {
                // uploading is not implemented; ignore
            }
        }
        Ok(())
    }

    async fn make_request(
        &mut self,
        sink: &mut (impl Sink<Message, Error = PeerError> + Unpin),
        state: &mut State,
    ) -> Result<()> {
        if !state.sent_interested && state.session_id.is_some() {
            sink.send(Message::Interested).await?;
            state.sent_interested = true;
        }

        if state.can_request() && !state.pending_request {
            if let Some(session_id) = state.session_id {
                let request = self.coordinator.write().await.next_request(session_id);
                if let Some(block) = request {
                    sink.send(Message::Request(block)).await?;
                    state.pending_request = true;
                }
            }
        }
        Ok(())
    }
}

async fn next_peer_addr(queue: &PeerQueue) -> Option<SocketAddr> {
    queue.lock().await.recv().await
}
