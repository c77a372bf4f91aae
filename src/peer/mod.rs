//! The per-connection peer protocol state machine.
//!
//! Every connected peer gets its own [`PeerSession`] task that pumps the
//! socket through the handshake and message codecs, keeps the choke and
//! interest matrix, fills its request pipeline from the torrent's shared
//! piece picker and download map, serves uploads through the rate
//! limiter, and relays extension traffic (metadata, PEX, donthave) to
//! its torrent. The torrent owns the session via its command channel;
//! everything the session learns flows back as torrent commands.

pub mod codec;

use std::{
  collections::{HashMap, VecDeque},
  net::SocketAddr,
  sync::{atomic::Ordering, Arc},
  time::Duration,
};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
  net::TcpStream,
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
  time::Instant,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
  avg::SlidingDurationAvg,
  bandwidth::Direction,
  blockinfo::{Block, BlockInfo},
  counter::ThruputCounters,
  disk,
  error::{disk::ReadError, peer::PeerError, PeerResult},
  extension::{
    self, ExtensionHandshake, PexMsg, UtMetadataMsg, EXT_HANDSHAKE_ID,
    LOCAL_LT_DONTHAVE_ID, LOCAL_UT_METADATA_ID, LOCAL_UT_PEX_ID,
    METADATA_PIECE_LEN,
  },
  peer::codec::{Handshake, HandshakeCodec, Message, PeerCodec},
  swarm::PeerOrigin,
  torrent::{self, TorrentContext},
  Bitfield, PeerId, PieceIndex,
};

/// The channel on which a torrent (and the disk task) sends commands to
/// a peer session.
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub enum Command {
  /// A block read from disk is ready to be sent to the peer.
  Block(Block),
  /// A disk read for this peer's request failed.
  BlockReadError {
    block_info: BlockInfo,
    error: ReadError,
  },
  /// Another peer won the endgame race for this block; withdraw our
  /// request with a CANCEL if it is still outstanding.
  CancelRequest(BlockInfo),
  /// We verified and stored a new piece: announce it and re-evaluate
  /// interest.
  PieceCompleted(PieceIndex),
  /// The choke policy decided to choke the peer.
  Choke,
  /// The choke policy granted the peer an unchoke slot.
  Unchoke,
  /// Ask the peer for this metadata piece.
  RequestMetadataPiece(usize),
  /// Gossip known peers to this peer.
  Pex(PexMsg),
  /// Gracefully close the session.
  Shutdown,
}

/// The state of a session's connection at any given time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
  /// The TCP connection is being established.
  Connecting,
  /// The BitTorrent handshakes are being exchanged.
  Handshaking,
  /// The window right after the handshake in which a bitfield may be
  /// received; any later bitfield is a protocol violation.
  AvailabilityExchange,
  /// The normal operating state in which all other messages flow.
  Connected,
  /// The session is tearing down.
  Disconnecting,
  /// The session is defunct.
  Disconnected,
}

impl Default for ConnectionState {
  fn default() -> Self {
    Self::Connecting
  }
}

/// A snapshot of a session's protocol state.
///
/// Both sides start choked and uninterested.
#[derive(Clone, Copy, Debug)]
pub struct SessionState {
  pub connection: ConnectionState,
  /// If the peer is choking us, our requests will not be served.
  pub is_peer_choking: bool,
  /// Whether we want pieces the peer has.
  pub is_interested: bool,
  /// If we are choking the peer, we do not serve its requests.
  pub is_choking: bool,
  /// Whether the peer wants pieces we have.
  pub is_peer_interested: bool,
}

impl Default for SessionState {
  fn default() -> Self {
    Self {
      connection: ConnectionState::default(),
      is_peer_choking: true,
      is_interested: false,
      is_choking: true,
      is_peer_interested: false,
    }
  }
}

/// The most essential information of a peer session, sent to the
/// torrent with every session tick.
pub struct SessionTick {
  /// A snapshot of the session state.
  pub state: SessionState,
  /// Various transfer statistics.
  pub counters: ThruputCounters,
  /// The number of pieces the peer has available.
  pub piece_count: usize,
}

/// The extension ids the remote registered with us in its extension
/// handshake.
#[derive(Clone, Copy, Debug, Default)]
struct RemoteExtensions {
  ut_metadata: Option<u8>,
  ut_pex: Option<u8>,
  lt_donthave: Option<u8>,
}

/// Information about the peer, set after a successful handshake.
struct PeerInfo {
  /// The peer's 20 byte BitTorrent id.
  #[allow(dead_code)]
  id: PeerId,
  /// Whether the peer's handshake advertised the extension protocol.
  supports_extensions: bool,
  /// All pieces the peer has, kept current from its bitfield, haves,
  /// and donthaves.
  pieces: Option<Bitfield>,
  /// Whether `pieces` has been counted into the torrent's piece picker
  /// (only possible once we have the metadata).
  registered_pieces: bool,
  extensions: RemoteExtensions,
  /// The info dictionary size the peer announced, if any.
  metadata_size: Option<u32>,
}

/// How often the session runs its maintenance tick.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The initial request queue length; grows toward the configured
/// pipeline depth while the link keeps up.
const START_REQUEST_QUEUE_LEN: usize = 4;

/// The floor of the adaptive request timeout.
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the remote handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PeerSession {
  /// Shared state of the torrent this session belongs to.
  ctx: Arc<TorrentContext>,
  /// The port on which the session receives commands.
  cmd_rx: Receiver,
  /// Our own command channel, handed to the disk task so read results
  /// come straight back to this session.
  cmd_tx: Sender,
  /// The remote address of the peer.
  addr: SocketAddr,
  /// Whether we dialed (true) or accepted (false) this connection.
  #[allow(dead_code)]
  is_outbound: bool,
  /// Protocol state.
  state: SessionState,
  /// Information about the peer, after the handshake.
  peer: Option<PeerInfo>,

  /// Our pending block requests to the peer and when each went out.
  /// A block arriving without an entry here is unsolicited and counted
  /// as waste. Emptied when the peer chokes us.
  outgoing_requests: HashMap<BlockInfo, Instant>,
  /// The adaptive target for `outgoing_requests`, capped by the
  /// configured pipeline depth.
  target_request_queue_len: usize,
  /// Request timeouts since the last served block.
  consecutive_timeouts: usize,
  /// While set, the peer misbehaved recently and we don't request from
  /// it.
  snoozed_until: Option<Instant>,

  /// Blocks the peer requested of us, not yet handed to the disk task.
  upload_queue: VecDeque<BlockInfo>,

  /// Transfer statistics, drained into the torrent on each tick.
  counters: ThruputCounters,
  /// Running average of request round trip times, tuning the request
  /// timeout.
  request_rtt: SlidingDurationAvg,

  last_send: Instant,
  last_recv: Instant,
}

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

impl PeerSession {
  /// Creates a session for an address the torrent wants to dial.
  pub fn outbound(
    ctx: Arc<TorrentContext>,
    addr: SocketAddr,
  ) -> (Self, Sender) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    (Self::new(ctx, addr, cmd_tx.clone(), cmd_rx, true), cmd_tx)
  }

  /// Creates a session for an accepted connection whose handshake the
  /// engine listener already read.
  pub fn inbound(ctx: Arc<TorrentContext>, addr: SocketAddr) -> (Self, Sender) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    (Self::new(ctx, addr, cmd_tx.clone(), cmd_rx, false), cmd_tx)
  }

  fn new(
    ctx: Arc<TorrentContext>,
    addr: SocketAddr,
    cmd_tx: Sender,
    cmd_rx: Receiver,
    is_outbound: bool,
  ) -> Self {
    let now = Instant::now();
    let target_request_queue_len =
      START_REQUEST_QUEUE_LEN.min(ctx.conf.pipeline_depth);
    Self {
      ctx,
      cmd_rx,
      cmd_tx,
      addr,
      is_outbound,
      state: SessionState::default(),
      peer: None,
      outgoing_requests: HashMap::new(),
      target_request_queue_len,
      consecutive_timeouts: 0,
      snoozed_until: None,
      upload_queue: VecDeque::new(),
      counters: ThruputCounters::default(),
      request_rtt: SlidingDurationAvg::default(),
      last_send: now,
      last_recv: now,
    }
  }

  /// Dials the peer, exchanges handshakes, and runs the session until
  /// the connection closes. The torrent is always notified of the
  /// disconnect, with the error if there was one.
  pub async fn start_outbound(&mut self, connect_timeout: Duration) {
    let result = self.run_outbound(connect_timeout).await;
    self.teardown(result).await;
  }

  /// Answers an accepted connection whose remote handshake was already
  /// consumed by the listener, then runs the session.
  pub async fn start_inbound(
    &mut self,
    stream: TcpStream,
    read_buf: bytes::BytesMut,
    remote_handshake: Handshake,
  ) {
    let result = self
      .run_inbound(stream, read_buf, remote_handshake)
      .await;
    self.teardown(result).await;
  }

  async fn run_outbound(
    &mut self,
    connect_timeout: Duration,
  ) -> PeerResult<()> {
    log::info!("Connecting to peer {}", self.addr);
    self.state.connection = ConnectionState::Connecting;

    let dial_start = Instant::now();
    let stream = tokio::time::timeout(
      connect_timeout,
      TcpStream::connect(self.addr),
    )
    .await
    .map_err(|_| {
      PeerError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "connect timed out",
      ))
    })??;
    let connect_time = dial_start.elapsed();
    log::info!("Connected to peer {} in {:?}", self.addr, connect_time);

    let mut socket = Framed::new(stream, HandshakeCodec);

    // outbound connections send the first handshake
    self.state.connection = ConnectionState::Handshaking;
    let own_handshake =
      Handshake::new(self.ctx.info_hash, self.ctx.client_id);
    socket.send(own_handshake).await?;
    self.counters.up.protocol.add(own_handshake.len());

    log::debug!("Waiting for peer {} handshake", self.addr);
    let peer_handshake =
      match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
        Ok(Some(handshake)) => handshake?,
        Ok(None) | Err(_) => {
          return Err(PeerError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "no handshake received",
          )))
        }
      };

    self.check_handshake(&peer_handshake, Some(connect_time))?;

    // now that we have the handshake, we need to switch to the peer
    // message codec, keeping any already buffered bytes
    let socket = swap_to_message_codec(socket);
    self.run(socket).await
  }

  async fn run_inbound(
    &mut self,
    stream: TcpStream,
    read_buf: bytes::BytesMut,
    remote_handshake: Handshake,
  ) -> PeerResult<()> {
    log::info!("Answering inbound peer {}", self.addr);
    self.state.connection = ConnectionState::Handshaking;

    // rebuild the framed socket with whatever the listener over-read
    let mut parts = FramedParts::new(stream, HandshakeCodec);
    parts.read_buf = read_buf;
    let mut socket = Framed::from_parts(parts);

    self.check_handshake(&remote_handshake, None)?;

    let own_handshake =
      Handshake::new(self.ctx.info_hash, self.ctx.client_id);
    socket.send(own_handshake).await?;
    self.counters.up.protocol.add(own_handshake.len());

    let socket = swap_to_message_codec(socket);
    self.run(socket).await
  }

  /// Validates the remote handshake and records the peer info.
  fn check_handshake(
    &mut self,
    handshake: &Handshake,
    connect_time: Option<Duration>,
  ) -> PeerResult<()> {
    self.counters.down.protocol.add(handshake.len());

    if handshake.info_hash != self.ctx.info_hash {
      log::info!("Peer {} handshake has the wrong info hash", self.addr);
      return Err(PeerError::InvalidInfoHash);
    }
    // a handshake carrying our own id means we dialed ourselves through
    // some address we advertise
    if handshake.peer_id == self.ctx.client_id {
      log::info!("Peer {} is ourselves, closing", self.addr);
      return Err(PeerError::SelfConnect);
    }

    self.peer = Some(PeerInfo {
      id: handshake.peer_id,
      supports_extensions: handshake.supports_extensions(),
      pieces: None,
      registered_pieces: false,
      extensions: RemoteExtensions::default(),
      metadata_size: None,
    });

    self
      .ctx
      .cmd_tx
      .send(torrent::Command::PeerConnected {
        addr: self.addr,
        id: handshake.peer_id,
        connect_time,
      })
      .ok();
    Ok(())
  }

  /// The main session loop: exchanges messages, runs the maintenance
  /// tick, and executes torrent commands, until the connection closes.
  async fn run(
    &mut self,
    socket: Framed<TcpStream, PeerCodec>,
  ) -> PeerResult<()> {
    self.state.connection = ConnectionState::AvailabilityExchange;
    log::info!("Peer {} session state: {:?}", self.addr, self.state.connection);

    let (mut sink, mut stream) = socket.split();

    // if both sides advertise the extension protocol, our extension
    // handshake goes out first
    if self.peer.as_ref().map(|p| p.supports_extensions).unwrap_or(false) {
      let handshake = ExtensionHandshake::ours(
        self.ctx.listen_port,
        self.ctx.metadata_size(),
      );
      let payload = handshake.to_bytes()?;
      self
        .send(
          &mut sink,
          Message::Extended {
            ext_id: EXT_HANDSHAKE_ID,
            payload,
          },
        )
        .await?;
    }

    // if we have any pieces, the peer learns of them from our bitfield;
    // with none we send nothing
    let own_pieces = {
      let picker = self.ctx.piece_picker.read().unwrap();
      if picker.own_pieces().any() {
        Some(picker.own_pieces().clone())
      } else {
        None
      }
    };
    if let Some(own_pieces) = own_pieces {
      self.send(&mut sink, Message::Bitfield(own_pieces)).await?;
    }

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        maybe_msg = stream.next() => {
          let msg = match maybe_msg {
            Some(msg) => msg?,
            None => {
              log::info!("Peer {} closed the connection", self.addr);
              return Ok(());
            }
          };
          self.last_recv = Instant::now();
          self.handle_msg(&mut sink, msg).await?;
        }
        cmd = self.cmd_rx.recv() => {
          match cmd {
            Some(Command::Shutdown) | None => {
              log::info!("Shutting down peer {} session", self.addr);
              return Ok(());
            }
            Some(cmd) => self.handle_cmd(&mut sink, cmd).await?,
          }
        }
        _ = tick.tick() => {
          self.tick(&mut sink).await?;
        }
      }
    }
  }

  /// Sends a message, bumping the send timestamp and protocol counters.
  async fn send(
    &mut self,
    sink: &mut MessageSink,
    msg: Message,
  ) -> PeerResult<()> {
    log::trace!("Sending {} to peer {}", msg, self.addr);
    let protocol_len = msg.protocol_len();
    if let Message::Block { data, .. } = &msg {
      self.counters.up.payload.add(data.len() as u64);
      self.ctx.rate_limiter.record(Direction::Up, data.len() as u64);
    }
    self.counters.up.protocol.add(protocol_len);
    sink.send(msg).await?;
    self.last_send = Instant::now();
    Ok(())
  }

  async fn handle_msg(
    &mut self,
    sink: &mut MessageSink,
    msg: Message,
  ) -> PeerResult<()> {
    log::trace!("Received {} from peer {}", msg, self.addr);
    self.counters.down.protocol.add(msg.protocol_len());

    // the bitfield may only arrive right after the handshake
    if self.state.connection == ConnectionState::AvailabilityExchange {
      if let Message::Bitfield(bitfield) = msg {
        self.handle_bitfield_msg(sink, bitfield).await?;
        self.state.connection = ConnectionState::Connected;
        log::info!(
          "Peer {} session state: {:?}",
          self.addr,
          self.state.connection
        );
        return Ok(());
      }
      // any other message ends the exchange window
      self.state.connection = ConnectionState::Connected;
      log::info!(
        "Peer {} session state: {:?}",
        self.addr,
        self.state.connection
      );
    } else if matches!(msg, Message::Bitfield(_)) {
      log::warn!("Peer {} sent a bitfield mid-session", self.addr);
      return Err(PeerError::BitfieldNotAfterHandshake);
    }

    match msg {
      Message::Bitfield(_) => unreachable!("handled above"),
      Message::KeepAlive => {
        log::debug!("Peer {} sent keep alive", self.addr);
      }
      Message::Choke => {
        if !self.state.is_peer_choking {
          log::info!("Peer {} choked us", self.addr);
          self.state.is_peer_choking = true;
          // the peer will not serve outstanding requests; hand the
          // blocks back to the shared downloads
          self.release_outgoing_requests();
        }
      }
      Message::Unchoke => {
        if self.state.is_peer_choking {
          log::info!("Peer {} unchoked us", self.addr);
          self.state.is_peer_choking = false;
          self.make_requests(sink).await?;
        }
      }
      Message::Interested => {
        if !self.state.is_peer_interested {
          log::info!("Peer {} is interested", self.addr);
          self.state.is_peer_interested = true;
        }
      }
      Message::NotInterested => {
        if self.state.is_peer_interested {
          log::info!("Peer {} is no longer interested", self.addr);
          self.state.is_peer_interested = false;
        }
      }
      Message::Have { piece_index } => {
        self.handle_have_msg(sink, piece_index).await?;
      }
      Message::Request(block_info) => {
        self.handle_request_msg(sink, block_info).await?;
      }
      Message::Block {
        piece_index,
        offset,
        data,
      } => {
        let block_info = BlockInfo {
          piece_index,
          offset,
          len: data.len() as u32,
        };
        self.handle_block_msg(block_info, data.into_owned())?;
        // a served request frees pipeline room
        self.make_requests(sink).await?;
      }
      Message::Cancel(block_info) => {
        // drop it from the upload queue if we haven't served it yet
        self.upload_queue.retain(|queued| *queued != block_info);
      }
      Message::Port { .. } => {
        // we run no DHT; parsed and dropped
        log::debug!("Peer {} sent its DHT port", self.addr);
      }
      Message::Extended { ext_id, payload } => {
        self.handle_extended_msg(sink, ext_id, payload).await?;
      }
    }

    Ok(())
  }

  /// Handles the bitfield sent right after the handshake.
  async fn handle_bitfield_msg(
    &mut self,
    sink: &mut MessageSink,
    mut bitfield: Bitfield,
  ) -> PeerResult<()> {
    log::info!("Handling peer {} bitfield message", self.addr);

    // The wire bitfield is byte padded, so it may be longer than the
    // actual piece count; cut it down once we know the piece count.
    // Before the metadata is known we keep it at wire length and
    // register it when the metadata arrives.
    if let Some(piece_count) = self.ctx.piece_count() {
      bitfield.resize(piece_count, false);
    }
    if let Some(peer) = &mut self.peer {
      peer.pieces = Some(bitfield);
    }
    self.register_peer_pieces();
    self.update_interest(sink).await?;
    Ok(())
  }

  /// Counts the peer's pieces into the piece picker, once metadata is
  /// available.
  fn register_peer_pieces(&mut self) {
    let piece_count = match self.ctx.piece_count() {
      Some(count) => count,
      None => return,
    };
    if let Some(peer) = &mut self.peer {
      if peer.registered_pieces {
        return;
      }
      if let Some(pieces) = &mut peer.pieces {
        pieces.resize(piece_count, false);
        let mut picker = self.ctx.piece_picker.write().unwrap();
        picker.register_peer_pieces(pieces);
        peer.registered_pieces = true;
      }
    }
  }

  async fn handle_have_msg(
    &mut self,
    sink: &mut MessageSink,
    piece_index: PieceIndex,
  ) -> PeerResult<()> {
    log::debug!("Peer {} has piece {}", self.addr, piece_index);
    if let Some(piece_count) = self.ctx.piece_count() {
      if piece_index >= piece_count {
        return Err(PeerError::InvalidPieceIndex);
      }
    }

    let piece_count = self.ctx.piece_count();
    if let Some(peer) = &mut self.peer {
      let pieces = peer.pieces.get_or_insert_with(Bitfield::new);
      if pieces.len() <= piece_index {
        let new_len =
          piece_count.unwrap_or(piece_index + 1).max(piece_index + 1);
        pieces.resize(new_len, false);
      }
      let already_had = pieces
        .get(piece_index)
        .map(|b| *b)
        .unwrap_or(false);
      pieces.set(piece_index, true);
      if !already_had && peer.registered_pieces {
        let mut picker = self.ctx.piece_picker.write().unwrap();
        picker.register_piece_availability(piece_index);
      }
    }

    self.update_interest(sink).await?;
    if self.can_request() {
      self.make_requests(sink).await?;
    }
    Ok(())
  }

  /// Validates and queues a peer's block request.
  async fn handle_request_msg(
    &mut self,
    sink: &mut MessageSink,
    block_info: BlockInfo,
  ) -> PeerResult<()> {
    log::debug!("Peer {} requested {}", self.addr, block_info);
    if self.state.is_choking {
      log::warn!("Choked peer {} sent a request", self.addr);
      return Err(PeerError::RequestWhileChoked);
    }

    let piece_len = self
      .ctx
      .piece_len(block_info.piece_index)
      .ok_or(PeerError::InvalidPieceIndex)?;
    if !block_info.is_valid(piece_len) {
      return Err(PeerError::InvalidBlockInfo);
    }
    // only verified pieces are served
    {
      let picker = self.ctx.piece_picker.read().unwrap();
      if !picker.have_piece(block_info.piece_index) {
        log::warn!(
          "Peer {} requested missing piece {}",
          self.addr,
          block_info.piece_index
        );
        return Err(PeerError::InvalidBlockInfo);
      }
    }

    if self.upload_queue.contains(&block_info) {
      return Ok(());
    }
    if self.upload_queue.len() >= self.ctx.conf.upload_queue_limit {
      // the peer keeps requesting past the bound: choke it until the
      // queue drains
      log::warn!("Peer {} overflowed its upload queue", self.addr);
      self.choke_peer(sink).await?;
      return Ok(());
    }
    self.upload_queue.push_back(block_info);
    self.drain_upload_queue();
    Ok(())
  }

  /// Hands as much of the upload queue to the disk task as the upload
  /// token bucket allows; the rest is retried on the next tick.
  fn drain_upload_queue(&mut self) {
    while let Some(block_info) = self.upload_queue.front().copied() {
      if !self
        .ctx
        .rate_limiter
        .try_consume(Direction::Up, block_info.len as u64)
      {
        log::trace!("Peer {} upload rate limited", self.addr);
        return;
      }
      self.upload_queue.pop_front();
      self
        .ctx
        .disk_tx
        .send(disk::Command::ReadBlock {
          id: self.ctx.id,
          block_info,
          result_tx: self.cmd_tx.clone(),
        })
        .ok();
    }
  }

  /// Registers a block the peer delivered, persists it, and hands out
  /// endgame cancels.
  fn handle_block_msg(
    &mut self,
    block_info: BlockInfo,
    data: Vec<u8>,
  ) -> PeerResult<()> {
    let request_time = match self.outgoing_requests.remove(&block_info) {
      Some(at) => at,
      None => {
        // not asked for (or no longer): endgame leftovers and junk
        log::debug!(
          "Peer {} sent unsolicited block {}",
          self.addr,
          block_info
        );
        self.counters.waste.add(block_info.len as u64);
        return Ok(());
      }
    };

    self.consecutive_timeouts = 0;
    let rtt = Instant::now().saturating_duration_since(request_time);
    self.request_rtt.update(rtt);
    self.counters.down.payload.add(block_info.len as u64);
    self
      .ctx
      .rate_limiter
      .record(Direction::Down, block_info.len as u64);

    // grow the pipeline while the peer keeps up
    if self.outgoing_requests.len() + 1 >= self.target_request_queue_len {
      self.target_request_queue_len =
        (self.target_request_queue_len + 1).min(self.ctx.conf.pipeline_depth);
    }

    let receipt = {
      let downloads = self.ctx.downloads.read().unwrap();
      match downloads.get(&block_info.piece_index) {
        Some(download) => download
          .lock()
          .unwrap()
          .received_block(&block_info, self.addr),
        None => {
          // the piece completed or was torn down elsewhere
          self.counters.waste.add(block_info.len as u64);
          return Ok(());
        }
      }
    };

    match receipt {
      crate::download::BlockReceipt::Accepted { cancel_peers } => {
        if !cancel_peers.is_empty() {
          self
            .ctx
            .cmd_tx
            .send(torrent::Command::BlockReceived {
              block: block_info,
              cancel_peers,
            })
            .ok();
        }
        self
          .ctx
          .disk_tx
          .send(disk::Command::WriteBlock {
            id: self.ctx.id,
            block_info,
            data,
          })
          .ok();
      }
      crate::download::BlockReceipt::Duplicate => {
        log::debug!("Peer {} sent duplicate block {}", self.addr, block_info);
        self.counters.waste.add(block_info.len as u64);
      }
      crate::download::BlockReceipt::Invalid => {
        return Err(PeerError::InvalidBlockInfo);
      }
    }
    Ok(())
  }

  async fn handle_extended_msg(
    &mut self,
    sink: &mut MessageSink,
    ext_id: u8,
    payload: Vec<u8>,
  ) -> PeerResult<()> {
    match ext_id {
      EXT_HANDSHAKE_ID => {
        let handshake = ExtensionHandshake::from_bytes(&payload)?;
        log::info!(
          "Peer {} extension handshake: {:?} metadata_size {:?}",
          self.addr,
          handshake.v,
          handshake.metadata_size
        );
        let extensions = RemoteExtensions {
          ut_metadata: handshake.remote_id(extension::UT_METADATA),
          ut_pex: handshake.remote_id(extension::UT_PEX),
          lt_donthave: handshake.remote_id(extension::LT_DONTHAVE),
        };
        let metadata_size = handshake.metadata_size;
        if let Some(peer) = &mut self.peer {
          peer.extensions = extensions;
          peer.metadata_size = metadata_size;
        }
        let supports_metadata = extensions.ut_metadata.is_some();
        self
          .ctx
          .cmd_tx
          .send(torrent::Command::PeerExtensions {
            addr: self.addr,
            supports_metadata,
            metadata_size,
          })
          .ok();
      }
      LOCAL_UT_METADATA_ID => {
        let msg = UtMetadataMsg::from_bytes(&payload)?;
        self.handle_ut_metadata_msg(sink, msg).await?;
      }
      LOCAL_UT_PEX_ID => {
        let msg = PexMsg::from_bytes(&payload)?;
        let addrs = msg.added_addrs();
        if !addrs.is_empty() {
          log::debug!(
            "Peer {} sent {} peers over PEX",
            self.addr,
            addrs.len()
          );
          self
            .ctx
            .cmd_tx
            .send(torrent::Command::PeersFound {
              addrs,
              origin: PeerOrigin::Pex,
            })
            .ok();
        }
      }
      LOCAL_LT_DONTHAVE_ID => {
        let piece_index = extension::decode_donthave(&payload)
          .ok_or(PeerError::InvalidBlockInfo)?;
        log::debug!(
          "Peer {} no longer has piece {}",
          self.addr,
          piece_index
        );
        if let Some(peer) = &mut self.peer {
          if let Some(pieces) = &mut peer.pieces {
            if pieces.get(piece_index).map(|b| *b).unwrap_or(false) {
              pieces.set(piece_index, false);
              if peer.registered_pieces {
                let mut picker = self.ctx.piece_picker.write().unwrap();
                picker.unregister_piece_availability(piece_index);
              }
            }
          }
        }
        self.update_interest(sink).await?;
      }
      _ => {
        log::warn!(
          "Peer {} sent a message for unknown extension {}",
          self.addr,
          ext_id
        );
        return Err(PeerError::UnknownExtension);
      }
    }
    Ok(())
  }

  /// Serves or relays a ut_metadata message.
  async fn handle_ut_metadata_msg(
    &mut self,
    sink: &mut MessageSink,
    msg: UtMetadataMsg,
  ) -> PeerResult<()> {
    match msg {
      UtMetadataMsg::Request { piece } => {
        let remote_id = self
          .peer
          .as_ref()
          .and_then(|p| p.extensions.ut_metadata);
        let remote_id = match remote_id {
          Some(id) => id,
          // it asks without advertising; be lenient and just ignore
          None => return Ok(()),
        };
        let info = self.ctx.info_raw();
        let reply = match info {
          Some(info) => {
            let total_size = info.len();
            let start = piece * METADATA_PIECE_LEN;
            if start < total_size {
              let end = (start + METADATA_PIECE_LEN).min(total_size);
              UtMetadataMsg::Data {
                piece,
                total_size,
                payload: info[start..end].to_vec(),
              }
            } else {
              UtMetadataMsg::Reject { piece }
            }
          }
          None => UtMetadataMsg::Reject { piece },
        };
        let payload = reply.to_bytes()?;
        self
          .send(
            sink,
            Message::Extended {
              ext_id: remote_id,
              payload,
            },
          )
          .await?;
      }
      UtMetadataMsg::Data {
        piece,
        total_size,
        payload,
      } => {
        self
          .ctx
          .cmd_tx
          .send(torrent::Command::MetadataPiece {
            addr: self.addr,
            piece,
            total_size,
            data: payload,
          })
          .ok();
      }
      UtMetadataMsg::Reject { piece } => {
        self
          .ctx
          .cmd_tx
          .send(torrent::Command::MetadataReject {
            addr: self.addr,
            piece,
          })
          .ok();
      }
    }
    Ok(())
  }

  async fn handle_cmd(
    &mut self,
    sink: &mut MessageSink,
    cmd: Command,
  ) -> PeerResult<()> {
    match cmd {
      Command::Block(block) => {
        log::trace!(
          "Sending block {} to peer {}",
          block.info(),
          self.addr
        );
        self
          .send(
            sink,
            Message::Block {
              piece_index: block.piece_index,
              offset: block.offset,
              data: block.data,
            },
          )
          .await?;
      }
      Command::BlockReadError { block_info, error } => {
        // serving failed: choke the peer and put the block back so an
        // unchoke retries it
        log::warn!(
          "Read of {} for peer {} failed: {}",
          block_info,
          self.addr,
          error
        );
        self.upload_queue.push_front(block_info);
        self.choke_peer(sink).await?;
      }
      Command::CancelRequest(block_info) => {
        if self.outgoing_requests.remove(&block_info).is_some() {
          self.send(sink, Message::Cancel(block_info)).await?;
        }
      }
      Command::PieceCompleted(piece_index) => {
        // announce to peers that lack the piece
        let peer_has = self
          .peer
          .as_ref()
          .and_then(|p| p.pieces.as_ref())
          .and_then(|pieces| pieces.get(piece_index).map(|b| *b))
          .unwrap_or(false);
        if !peer_has {
          self.send(sink, Message::Have { piece_index }).await?;
        }
        self.update_interest(sink).await?;
      }
      Command::Choke => {
        self.choke_peer(sink).await?;
      }
      Command::Unchoke => {
        if self.state.is_choking {
          log::info!("Unchoking peer {}", self.addr);
          self.state.is_choking = false;
          self.send(sink, Message::Unchoke).await?;
          self.drain_upload_queue();
        }
      }
      Command::RequestMetadataPiece(piece) => {
        let remote_id = self
          .peer
          .as_ref()
          .and_then(|p| p.extensions.ut_metadata);
        match remote_id {
          Some(remote_id) => {
            let payload = UtMetadataMsg::Request { piece }.to_bytes()?;
            self
              .send(
                sink,
                Message::Extended {
                  ext_id: remote_id,
                  payload,
                },
              )
              .await?;
          }
          None => {
            // cannot serve the acquirer; let it rotate elsewhere
            self
              .ctx
              .cmd_tx
              .send(torrent::Command::MetadataReject {
                addr: self.addr,
                piece,
              })
              .ok();
          }
        }
      }
      Command::Pex(msg) => {
        let remote_id =
          self.peer.as_ref().and_then(|p| p.extensions.ut_pex);
        if let Some(remote_id) = remote_id {
          let payload = msg.to_bytes()?;
          self
            .send(
              sink,
              Message::Extended {
                ext_id: remote_id,
                payload,
              },
            )
            .await?;
        }
      }
      Command::Shutdown => unreachable!("handled by the select loop"),
    }
    Ok(())
  }

  /// The 1 s maintenance tick: timeouts, keep-alives, queue drains, and
  /// the state report to the torrent.
  async fn tick(&mut self, sink: &mut MessageSink) -> PeerResult<()> {
    let now = Instant::now();

    // a peer that went quiet for too long is dropped
    if now.saturating_duration_since(self.last_recv)
      >= self.ctx.conf.inactivity_timeout
    {
      log::info!("Peer {} inactive, closing", self.addr);
      return Err(PeerError::InactivityTimeout);
    }

    // if we haven't sent anything in a while, the peer gets a
    // keep-alive so it doesn't drop us either
    if now.saturating_duration_since(self.last_send)
      >= self.ctx.conf.keep_alive_interval
    {
      self.send(sink, Message::KeepAlive).await?;
    }

    self.check_request_timeouts(now);

    // a metadata-less torrent gained its metadata: register what the
    // peer told us back then
    if self.ctx.has_metadata() {
      self.register_peer_pieces();
    }

    if self.snoozed_until.map(|until| until <= now).unwrap_or(false) {
      log::info!("Peer {} snooze over", self.addr);
      self.snoozed_until = None;
      self.consecutive_timeouts = 0;
    }

    self.drain_upload_queue();
    self.update_interest(sink).await?;
    if self.can_request() {
      self.make_requests(sink).await?;
    }

    // report the round to the torrent
    let piece_count = self
      .peer
      .as_ref()
      .and_then(|p| p.pieces.as_ref())
      .map(|pieces| pieces.count_ones())
      .unwrap_or(0);
    let tick_info = SessionTick {
      state: self.state,
      counters: self.counters,
      piece_count,
    };
    self.counters.tick();
    self
      .ctx
      .cmd_tx
      .send(torrent::Command::PeerState {
        addr: self.addr,
        info: tick_info,
      })
      .ok();
    Ok(())
  }

  /// Returns requests that outlived their timeout to the shared
  /// downloads and snoozes the peer when it keeps timing out.
  fn check_request_timeouts(&mut self, now: Instant) {
    let timeout = self.request_timeout();
    let timed_out: Vec<BlockInfo> = self
      .outgoing_requests
      .iter()
      .filter(|(_, at)| now.saturating_duration_since(**at) >= timeout)
      .map(|(block, _)| *block)
      .collect();
    if timed_out.is_empty() {
      return;
    }

    log::info!(
      "Peer {} timed out {} requests",
      self.addr,
      timed_out.len()
    );
    let downloads = self.ctx.downloads.read().unwrap();
    for block in timed_out {
      self.outgoing_requests.remove(&block);
      if let Some(download) = downloads.get(&block.piece_index) {
        download.lock().unwrap().release_block(&block, self.addr);
      }
      self.consecutive_timeouts += 1;
    }
    drop(downloads);

    // shrink the pipeline back; the link clearly isn't keeping up
    self.target_request_queue_len = START_REQUEST_QUEUE_LEN;

    if self.consecutive_timeouts >= self.ctx.conf.request_timeout_limit
      && self.snoozed_until.is_none()
    {
      log::info!("Snoozing peer {}", self.addr);
      self.snoozed_until = Some(now + self.ctx.conf.snooze_duration);
      self.release_outgoing_requests();
    }
  }

  /// The adaptive request timeout: four round trip means once measured,
  /// within fixed bounds.
  fn request_timeout(&self) -> Duration {
    if self.request_rtt.sample_count() > 0 {
      (self.request_rtt.mean() * 4)
        .clamp(MIN_REQUEST_TIMEOUT, self.ctx.conf.request_timeout)
    } else {
      self.ctx.conf.request_timeout
    }
  }

  fn can_request(&self) -> bool {
    self.state.connection == ConnectionState::Connected
      && self.state.is_interested
      && !self.state.is_peer_choking
      && self.snoozed_until.is_none()
      && !self.ctx.paused.load(Ordering::Relaxed)
      && self.ctx.has_metadata()
  }

  /// Fills the session's request pipeline from the shared downloads and
  /// the piece picker, gated by the download token bucket.
  async fn make_requests(&mut self, sink: &mut MessageSink) -> PeerResult<()> {
    if !self.can_request() {
      return Ok(());
    }
    let peer_pieces = match self.peer.as_ref().and_then(|p| p.pieces.as_ref())
    {
      Some(pieces) => pieces.clone(),
      None => return Ok(()),
    };

    let target = self.target_request_queue_len;
    if self.outgoing_requests.len() >= target {
      return Ok(());
    }
    let mut to_request = target - self.outgoing_requests.len();
    let in_endgame = self.ctx.in_endgame.load(Ordering::Relaxed);
    let mut blocks = Vec::with_capacity(to_request);

    // prefer continuing existing downloads: fewer in-progress pieces
    {
      let downloads = self.ctx.downloads.read().unwrap();
      for (piece_index, download) in downloads.iter() {
        if to_request == 0 {
          break;
        }
        if !peer_pieces.get(*piece_index).map(|b| *b).unwrap_or(false) {
          continue;
        }
        let mut download = download.lock().unwrap();
        let before = blocks.len();
        download.pick_blocks(to_request, self.addr, in_endgame, &mut blocks);
        to_request -= blocks.len() - before;
      }
    }

    // then start new downloads of the rarest pieces the peer has
    while to_request > 0 {
      let index = {
        let mut picker = self.ctx.piece_picker.write().unwrap();
        picker.pick_piece(&peer_pieces)
      };
      let index = match index {
        Some(index) => index,
        None => break,
      };
      log::debug!("Peer {} session starting piece {}", self.addr, index);
      let piece_len = self
        .ctx
        .piece_len(index)
        .ok_or(PeerError::InvalidPieceIndex)?;
      let mut download = crate::download::PieceDownload::new(index, piece_len);
      let before = blocks.len();
      download.pick_blocks(to_request, self.addr, in_endgame, &mut blocks);
      to_request -= blocks.len() - before;
      self
        .ctx
        .downloads
        .write()
        .unwrap()
        .insert(index, std::sync::Mutex::new(download));
    }

    // issue the requests, each one gated by the download bucket
    let now = Instant::now();
    for (position, block) in blocks.iter().enumerate() {
      if !self
        .ctx
        .rate_limiter
        .try_consume(Direction::Down, block.len as u64)
      {
        // out of tokens: hand the unsent tail back and retry on a tick
        log::trace!("Peer {} download rate limited", self.addr);
        let downloads = self.ctx.downloads.read().unwrap();
        for unsent in &blocks[position..] {
          if let Some(download) = downloads.get(&unsent.piece_index) {
            download.lock().unwrap().release_block(unsent, self.addr);
          }
        }
        return Ok(());
      }
      self.outgoing_requests.insert(*block, now);
      self.send(sink, Message::Request(*block)).await?;
    }

    Ok(())
  }

  /// Recomputes our interest in the peer and announces changes,
  /// deduplicated.
  async fn update_interest(&mut self, sink: &mut MessageSink) -> PeerResult<()> {
    let interested = {
      let peer_pieces = self.peer.as_ref().and_then(|p| p.pieces.as_ref());
      match peer_pieces {
        Some(pieces) if self.ctx.has_metadata() => {
          let picker = self.ctx.piece_picker.read().unwrap();
          picker.is_interested_in(pieces)
        }
        // pre-metadata the peer is only useful for ut_metadata; no
        // content interest either way
        _ => false,
      }
    };
    if interested && !self.state.is_interested {
      log::info!("Interested in peer {}", self.addr);
      self.state.is_interested = true;
      self.send(sink, Message::Interested).await?;
    } else if !interested && self.state.is_interested {
      log::info!("No longer interested in peer {}", self.addr);
      self.state.is_interested = false;
      self.send(sink, Message::NotInterested).await?;
    }
    Ok(())
  }

  async fn choke_peer(&mut self, sink: &mut MessageSink) -> PeerResult<()> {
    if !self.state.is_choking {
      log::info!("Choking peer {}", self.addr);
      self.state.is_choking = true;
      // pending uploads are dropped on choke
      self.upload_queue.clear();
      self.send(sink, Message::Choke).await?;
    }
    Ok(())
  }

  /// Returns all our outstanding requests to the shared downloads.
  fn release_outgoing_requests(&mut self) {
    if self.outgoing_requests.is_empty() {
      return;
    }
    log::debug!(
      "Releasing {} outstanding requests to peer {}",
      self.outgoing_requests.len(),
      self.addr
    );
    let downloads = self.ctx.downloads.read().unwrap();
    for block in self.outgoing_requests.keys() {
      if let Some(download) = downloads.get(&block.piece_index) {
        download.lock().unwrap().release_block(block, self.addr);
      }
    }
    self.outgoing_requests.clear();
  }

  /// Cleans up after the session loop ends, however it ended, and
  /// notifies the torrent.
  async fn teardown(&mut self, result: PeerResult<()>) {
    self.state.connection = ConnectionState::Disconnecting;
    self.release_outgoing_requests();

    // withdraw the peer's pieces from the availability counts
    if let Some(peer) = &self.peer {
      if peer.registered_pieces {
        if let Some(pieces) = &peer.pieces {
          let mut picker = self.ctx.piece_picker.write().unwrap();
          picker.unregister_peer_pieces(pieces);
        }
      }
    }

    let error = match result {
      Ok(()) => None,
      Err(e) => {
        log::info!("Peer {} session error: {}", self.addr, e);
        Some(e)
      }
    };
    self.state.connection = ConnectionState::Disconnected;
    self
      .ctx
      .cmd_tx
      .send(torrent::Command::PeerDisconnected {
        addr: self.addr,
        error,
      })
      .ok();
  }
}

/// Swaps the handshake codec for the message codec, preserving the read
/// and write buffers: the peer may have sent messages right after its
/// handshake.
fn swap_to_message_codec(
  socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, PeerCodec> {
  let old_parts = socket.into_parts();
  let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
  new_parts.read_buf = old_parts.read_buf;
  new_parts.write_buf = old_parts.write_buf;
  Framed::from_parts(new_parts)
}
