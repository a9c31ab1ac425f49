//! Peer sessions: one TCP connection to one remote peer, advanced through
//! the connect, control exchange and download stages by the pipeline
//! workers. A session is owned by exactly one worker at a time and moves
//! between stages through the pipeline queues.

mod codec;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    block_count, block_len,
    error::*,
    ledger::{ClaimGuard, CommitOutcome},
    torrent::TorrentContext,
    Bitfield, BlockInfo, PieceIndex, BLOCK_LEN,
};
use codec::*;

type Socket = Framed<TcpStream, PeerCodec>;

/// At any given time, a connection with a peer is in one of the below
/// states. Any error tears the connection down; there is no explicit
/// closed state, as dropping the session closes the stream.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The state during which the TCP connection is established.
    TcpConnecting,
    /// Our handshake is sent and the peer's is awaited.
    HandshakePending,
    /// Handshakes are exchanged and the peer's piece availability is
    /// awaited (a bitfield or a first have message).
    ControlExchange,
    /// Interest is declared and the peer's unchoke is awaited.
    Interested,
    /// The peer unchoked us and blocks are being transferred.
    Downloading,
}

/// The four standard flags of a peer connection. Both sides of a fresh
/// connection start choked and not interested.
#[derive(Clone, Copy, Debug)]
struct Status {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// The result of fetching a single piece from the peer.
enum Fetch {
    /// The piece was fully assembled.
    Piece(Vec<u8>),
    /// The peer choked us before the piece was complete; the partial data
    /// is discarded.
    Choked,
}

pub(crate) struct PeerSession {
    ctx: Arc<TorrentContext>,
    /// The remote address of the peer.
    addr: SocketAddr,
    socket: Socket,
    state: State,
    status: Status,
    /// All pieces peer has, updated when it announces a new piece.
    peer_has: Bitfield,
}

impl PeerSession {
    /// Stage one: establishes the TCP connection and exchanges handshakes
    /// with the peer at the given address.
    ///
    /// Returns a session that is ready for the control exchange, with the
    /// stream already switched over to the message codec.
    pub async fn connect(
        addr: SocketAddr,
        ctx: Arc<TorrentContext>,
    ) -> Result<Self> {
        log::debug!(
            "Peer {} session state: {:?}",
            addr,
            State::TcpConnecting
        );
        let socket = time::timeout(
            ctx.conf.connect_timeout,
            TcpStream::connect(addr),
        )
        .await??;
        log::debug!("Connected to peer {}", addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        log::debug!(
            "Peer {} session state: {:?}",
            addr,
            State::HandshakePending
        );
        let handshake = Handshake::new(ctx.info_hash, ctx.client_id);
        socket.send(handshake).await?;

        // receive peer's handshake
        let peer_handshake =
            match time::timeout(ctx.conf.handshake_timeout, socket.next())
                .await?
            {
                Some(peer_handshake) => peer_handshake?,
                None => return Err(Error::PeerDisconnected),
            };
        // the codec only returns a handshake whose protocol string is valid
        debug_assert_eq!(&peer_handshake.prot[..], PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        // Now that the handshakes are exchanged, switch to the peer message
        // codec. The buffers of the handshake codec are carried over, as
        // they may already hold the start of a message the peer sent right
        // after its handshake.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let piece_count = ctx.storage.piece_count;
        let mut session = Self {
            ctx,
            addr,
            socket,
            state: State::ControlExchange,
            status: Status::default(),
            peer_has: Bitfield::repeat(false, piece_count),
        };
        session.set_state(State::ControlExchange);
        Ok(session)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stage two: waits for the peer's piece availability, declares
    /// interest and waits to be unchoked.
    ///
    /// Downloading may only start once the peer unchokes us; this holds on
    /// the bitfield path just as on the have path.
    pub async fn exchange_control(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::ControlExchange);

        // wait for the first message carrying availability; anything else
        // carries no availability information yet, so keep waiting
        loop {
            match self.recv(self.ctx.conf.unchoke_timeout).await? {
                Message::Bitfield(bitfield) => {
                    self.handle_bitfield(bitfield);
                    break;
                }
                Message::Have { piece_index } => {
                    self.grant_piece(piece_index)?;
                    break;
                }
                msg => log::debug!(
                    "Peer {} sent {:?} before announcing availability",
                    self.addr,
                    msg.id()
                ),
            }
        }

        if !self.ctx.ledger.has_needed(&self.peer_has) {
            log::debug!("Peer {} has no pieces we need", self.addr);
            return Err(Error::PeerNotUseful);
        }

        self.socket.send(Message::Interested).await?;
        self.status.am_interested = true;
        log::debug!("Interested in peer {}", self.addr);
        self.set_state(State::Interested);

        self.wait_for_unchoke().await
    }

    /// Stage three: repeatedly claims a batch of pieces the peer has and
    /// fetches them block by block, committing each assembled piece to the
    /// ledger. Returns cleanly once no claimable piece remains.
    pub async fn download(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::Downloading);

        loop {
            let batch = self.ctx.ledger.claim_batch(
                &self.peer_has,
                self.ctx.conf.max_claim_per_peer,
            );
            if batch.is_empty() {
                log::debug!(
                    "No more pieces to claim from peer {}",
                    self.addr
                );
                return Ok(());
            }
            log::debug!(
                "Claimed {} pieces from peer {}",
                batch.len(),
                self.addr
            );
            // whatever this batch still holds when it goes out of scope is
            // released, on success, error and cancellation alike
            let mut batch =
                ClaimGuard::new(Arc::clone(&self.ctx.ledger), batch);

            let mut choked = false;
            while let Some(index) = batch.first() {
                match self.fetch_piece(index).await? {
                    Fetch::Piece(data) => {
                        let outcome =
                            self.ctx.ledger.commit(index, data).await?;
                        // committed or rejected, the ledger has settled
                        // this claim
                        batch.settle(index);
                        if outcome == CommitOutcome::HashMismatch {
                            log::warn!(
                                "Piece {} from peer {} failed verification",
                                index,
                                self.addr
                            );
                            return Err(Error::PieceHashMismatch);
                        }
                    }
                    Fetch::Choked => {
                        choked = true;
                        break;
                    }
                }
            }
            drop(batch);

            if choked {
                log::debug!("Peer {} choked us mid-download", self.addr);
                self.status.peer_choking = true;
                self.set_state(State::Interested);
                self.wait_for_unchoke().await?;
            }
        }
    }

    /// Waits in the interested state until the peer unchokes us. A have
    /// message augments the peer's availability; choke and unknown messages
    /// are logged and the wait continues; each read is bounded by the
    /// unchoke timeout.
    async fn wait_for_unchoke(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::Interested);
        loop {
            match self.recv(self.ctx.conf.unchoke_timeout).await? {
                Message::Unchoke => {
                    self.status.peer_choking = false;
                    self.set_state(State::Downloading);
                    return Ok(());
                }
                Message::Have { piece_index } => {
                    self.grant_piece(piece_index)?
                }
                Message::Bitfield(_) => {
                    return Err(Error::BitfieldNotAfterHandshake)
                }
                Message::KeepAlive => {}
                msg => log::debug!(
                    "Peer {} sent {:?} while we wait for unchoke",
                    self.addr,
                    msg.id()
                ),
            }
        }
    }

    /// Downloads a single piece with one outstanding block request at a
    /// time, matching replies by piece index and offset.
    ///
    /// Messages interleaved with the blocks are processed: have augments
    /// the peer's availability, a choke aborts the fetch, keep-alives and
    /// stray blocks are ignored, and a second bitfield is a protocol error.
    async fn fetch_piece(&mut self, index: PieceIndex) -> Result<Fetch> {
        let piece_len = self.ctx.storage.piece_len(index)?;
        // the buffer is sized to the piece's effective length, which for
        // the last piece is usually shorter than the nominal piece length
        let mut piece = vec![0; piece_len as usize];

        'blocks: for block_index in 0..block_count(piece_len) {
            let block = BlockInfo {
                piece_index: index,
                offset: block_index as u32 * BLOCK_LEN,
                len: block_len(piece_len, block_index),
            };
            self.socket.send(Message::Request(block)).await?;

            loop {
                match self.recv(self.ctx.conf.block_timeout).await? {
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    } => {
                        if piece_index == block.piece_index
                            && offset == block.offset
                            && data.len() == block.len as usize
                        {
                            let offset = offset as usize;
                            piece[offset..offset + data.len()]
                                .copy_from_slice(&data);
                            continue 'blocks;
                        }
                        log::debug!(
                            "Peer {} sent block {}:{} we did not request",
                            self.addr,
                            piece_index,
                            offset
                        );
                    }
                    Message::Choke => return Ok(Fetch::Choked),
                    Message::Have { piece_index } => {
                        self.grant_piece(piece_index)?
                    }
                    Message::Bitfield(_) => {
                        return Err(Error::BitfieldNotAfterHandshake)
                    }
                    Message::Unchoke | Message::KeepAlive => {}
                    msg => log::debug!(
                        "Peer {} sent {:?} during download",
                        self.addr,
                        msg.id()
                    ),
                }
            }
        }

        Ok(Fetch::Piece(piece))
    }

    /// Reads the next frame, or errors if the peer disconnected, sent a
    /// malformed frame or nothing arrived in time.
    async fn recv(&mut self, timeout: Duration) -> Result<Message> {
        match time::timeout(timeout, self.socket.next()).await? {
            Some(msg) => Ok(msg?),
            None => Err(Error::PeerDisconnected),
        }
    }

    /// Derives the peer's availability from its bitfield.
    ///
    /// The raw bitfield sent over the wire may be longer than the logical
    /// pieces it represents if the piece count is not a multiple of 8, so
    /// it is cut down (or padded) to the torrent's piece count.
    fn handle_bitfield(&mut self, mut bitfield: Bitfield) {
        bitfield.resize(self.ctx.storage.piece_count, false);
        self.peer_has = bitfield;
    }

    /// Records that the peer announced possession of a piece.
    fn grant_piece(&mut self, piece_index: PieceIndex) -> Result<()> {
        if piece_index >= self.ctx.storage.piece_count {
            return Err(Error::InvalidPieceIndex);
        }
        self.peer_has.set(piece_index, true);
        Ok(())
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
        log::debug!("Peer {} session state: {:?}", self.addr, state);
    }
}
