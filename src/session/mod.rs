//! The per-torrent engine: a single actor that owns every bit of mutable
//! torrent state and never shares it.
//!
//! Every external event reaches the session as a message on a channel and
//! every reply leaves it the same way. Around it, short-lived workers
//! (handshakers, disk reads) and long-lived tasks (peers, announcers, the
//! writer pool, verifier, allocator, web seeds) perform the I/O and report
//! back as [`SessionEvent`]s. The session performs all state updates between
//! messages, which rules out data races by construction.
mod types;

pub use types::*;

use std::{
    net::{IpAddr, SocketAddr},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use bendy::{decoding::FromBencode, encoding::ToBencode};
use hashbrown::{HashMap, HashSet};
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::{
    net::TcpListener,
    select, spawn,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    addrlist::{AddrList, AddrSource},
    allocator::Allocator,
    announcer::{Announcer, AnnouncerConfig, DhtAnnouncer, StopAnnouncer},
    bitfield::{Bitfield, BitfieldExt},
    blocklist::Blocklist,
    config::Config,
    counter::Counter,
    error::Error,
    extensions::{Metadata, METADATA_PIECE_LEN},
    handshaker,
    infodownloader::{InfoDownloader, MetadataReceipt},
    metainfo::Info,
    peer::{Direction, Peer, PeerCtx, PeerId, PeerMsg, PeerParams},
    piece::Piece,
    piececache::PieceCache,
    piecedownloader::{BlockReceipt, PieceDownloader},
    piecepicker::PiecePicker,
    piecewriter::PieceWriterPool,
    resumer::{Resumer, Snapshot},
    storage::{FileTable, Storage},
    tracker::event::Event,
    verifier::Verifier,
    webseed::WebSeed,
    wire::{Block, BlockInfo, ExtendedMessage, Message},
};

/// Hash failures a peer gets away with before being dropped.
const PENALTY_LIMIT: u32 = 3;

/// Rounds of metadata downloads that may fail before the torrent gives up.
const METADATA_ROUND_LIMIT: u32 = 5;

/// Requests the session sends to one info downloader at a time.
const METADATA_WINDOW: usize = 8;

/// Handle used by embedding code to drive a [`Session`]. Clones freely.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionMsg>,
}

impl SessionHandle {
    /// Idempotent; readiness is signaled through [`Self::notify_listen`].
    pub async fn start(&self) -> Result<(), Error> {
        Ok(self.tx.send(SessionMsg::Start).await?)
    }

    /// Idempotent. A terminal `stopped` announce is delivered with a
    /// bounded wait.
    pub async fn stop(&self) -> Result<(), Error> {
        Ok(self.tx.send(SessionMsg::Stop).await?)
    }

    /// Stop if needed and end the session task.
    pub async fn close(&self) -> Result<(), Error> {
        Ok(self.tx.send(SessionMsg::Close).await?)
    }

    pub async fn stats(&self) -> Result<SessionStats, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(SessionMsg::Stats(otx)).await?;
        Ok(orx.await?)
    }

    pub async fn trackers(&self) -> Result<Vec<TrackerStats>, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(SessionMsg::Trackers(otx)).await?;
        Ok(orx.await?)
    }

    pub async fn peers(&self) -> Result<Vec<PeerStats>, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(SessionMsg::Peers(otx)).await?;
        Ok(orx.await?)
    }

    pub async fn add_peers(&self, addrs: Vec<SocketAddr>) -> Result<(), Error> {
        Ok(self.tx.send(SessionMsg::AddPeers(addrs)).await?)
    }

    /// Resolves with the bound listen port once the listener is up.
    pub async fn notify_listen(
        &self,
    ) -> Result<oneshot::Receiver<u16>, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(SessionMsg::NotifyListen(otx)).await?;
        Ok(orx)
    }

    /// Resolves when every piece is downloaded, verified and written.
    pub async fn notify_complete(
        &self,
    ) -> Result<oneshot::Receiver<()>, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(SessionMsg::NotifyComplete(otx)).await?;
        Ok(orx)
    }

    /// Resolves with the fatal error that stopped the torrent, if one does.
    pub async fn notify_error(
        &self,
    ) -> Result<oneshot::Receiver<Arc<Error>>, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(SessionMsg::NotifyError(otx)).await?;
        Ok(orx)
    }

    /// Resolves when the session reaches Stopped.
    pub async fn notify_stop(&self) -> Result<oneshot::Receiver<()>, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(SessionMsg::NotifyStop(otx)).await?;
        Ok(orx)
    }

    /// Bind the external resumer; from then on the session persists
    /// snapshots on its coalescing timers.
    pub async fn set_resumer(&self, resumer: Resumer) -> Result<(), Error> {
        Ok(self.tx.send(SessionMsg::SetResumer(resumer)).await?)
    }
}

pub struct Session {
    config: Arc<Config>,
    source: Source,
    name: String,
    status: Status,
    ctx: Arc<SessionCtx>,

    rx: mpsc::Receiver<SessionMsg>,
    events_rx: mpsc::Receiver<SessionEvent>,
    blocks_rx: mpsc::Receiver<(SocketAddr, Block)>,

    // torrent data, present once the metadata is known
    info: Option<Info>,
    metadata_size: Option<u32>,
    pieces: Vec<Piece>,
    bitfield: Bitfield,
    picker: Option<PiecePicker>,
    storage: Option<Arc<Storage>>,
    file_table: Option<FileTable>,
    writer_pool: Option<PieceWriterPool>,
    inflight_writes: usize,

    // swarm state
    addrs: AddrList,
    blocklist: Blocklist,
    peers: HashMap<SocketAddr, Arc<PeerCtx>>,
    peer_pieces: HashMap<SocketAddr, Bitfield>,
    /// Peers that sent have-all before the metadata was known; their
    /// bitfields are filled in once the piece count exists.
    peer_have_all: HashSet<SocketAddr>,
    /// The remote's chosen id for ut_metadata, learned from its handshake.
    peer_metadata_ids: HashMap<SocketAddr, u8>,
    connected_ips: HashSet<IpAddr>,
    peer_ids: HashSet<PeerId>,
    handshaking: HashSet<SocketAddr>,

    downloaders: HashMap<SocketAddr, PieceDownloader>,
    downloaders_choked: HashMap<SocketAddr, PieceDownloader>,
    downloaders_snubbed: HashMap<SocketAddr, PieceDownloader>,
    total_outstanding: usize,
    endgame: bool,

    info_downloader: Option<InfoDownloader>,
    metadata_failed: HashSet<SocketAddr>,
    metadata_rounds: u32,

    unchoked: Vec<SocketAddr>,
    opt_unchoked: Option<SocketAddr>,

    pending_reads: HashSet<(SocketAddr, BlockInfo)>,
    read_mutex: Arc<tokio::sync::Mutex<()>>,
    cache: PieceCache,
    webseed_assigned: HashSet<u32>,

    // lifecycle
    listen_port: Option<u16>,
    close_tx: Option<watch::Sender<bool>>,
    acceptor: Option<JoinHandle<()>>,
    announcer_triggers: Vec<mpsc::Sender<Event>>,
    tracker_stats: HashMap<String, TrackerStats>,
    resumer: Option<Resumer>,
    resume_claimed: bool,
    dht: Option<DhtHandle>,
    last_error: Option<Arc<Error>>,

    // one-shot observers
    notify_listen: Vec<oneshot::Sender<u16>>,
    notify_complete: Vec<oneshot::Sender<()>>,
    notify_error: Vec<oneshot::Sender<Arc<Error>>>,
    notify_stop: Vec<oneshot::Sender<()>>,

    // timers
    heartbeat_interval: Interval,
    request_interval: Interval,
    unchoke_interval: Interval,
    optimistic_interval: Interval,
    dial_interval: Interval,
    resume_interval: Interval,
    stats_interval: Interval,
}

impl Session {
    /// Build a session around a source. Nothing runs until [`Session::run`]
    /// is spawned and `start` is sent.
    pub fn new(
        config: Arc<Config>,
        source: Source,
    ) -> Result<(Session, SessionHandle), Error> {
        Self::with_parts(config, source, Blocklist::new(), None)
    }

    /// Like [`Session::new`] with a blocklist and an external DHT attached.
    pub fn with_parts(
        config: Arc<Config>,
        source: Source,
        blocklist: Blocklist,
        dht: Option<DhtHandle>,
    ) -> Result<(Session, SessionHandle), Error> {
        let (tx, rx) = mpsc::channel::<SessionMsg>(100);
        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(512);
        let (blocks_tx, blocks_rx) =
            mpsc::channel::<(SocketAddr, Block)>(128);

        let info_hash = source.info_hash();
        let ctx = Arc::new(SessionCtx {
            tx: tx.clone(),
            events: events_tx,
            blocks: blocks_tx,
            skey_hash: crate::wire::skey_hash(&info_hash),
            info_hash,
            local_id: PeerId::gen(),
            counter: Counter::new(),
        });

        let mut heartbeat_interval = interval(Duration::from_secs(1));
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut request_interval = interval(Duration::from_millis(500));
        request_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let session = Session {
            name: source.name(),
            addrs: AddrList::new(config.max_addrs),
            cache: PieceCache::new(config.piece_cache_bytes),
            resume_interval: interval(Duration::from_secs(
                config.resume_write_interval_secs.max(1),
            )),
            stats_interval: interval(Duration::from_secs(
                config.stats_write_interval_secs.max(1),
            )),
            unchoke_interval: interval(Duration::from_secs(10)),
            optimistic_interval: interval(Duration::from_secs(30)),
            dial_interval: interval(Duration::from_secs(5)),
            heartbeat_interval,
            request_interval,
            config,
            source,
            status: Status::Stopped,
            ctx: ctx.clone(),
            rx,
            events_rx,
            blocks_rx,
            info: None,
            metadata_size: None,
            pieces: Vec::new(),
            bitfield: Bitfield::new(),
            picker: None,
            storage: None,
            file_table: None,
            writer_pool: None,
            inflight_writes: 0,
            blocklist,
            peers: HashMap::new(),
            peer_pieces: HashMap::new(),
            peer_have_all: HashSet::new(),
            peer_metadata_ids: HashMap::new(),
            connected_ips: HashSet::new(),
            peer_ids: HashSet::new(),
            handshaking: HashSet::new(),
            downloaders: HashMap::new(),
            downloaders_choked: HashMap::new(),
            downloaders_snubbed: HashMap::new(),
            total_outstanding: 0,
            endgame: false,
            info_downloader: None,
            metadata_failed: HashSet::new(),
            metadata_rounds: 0,
            unchoked: Vec::new(),
            opt_unchoked: None,
            pending_reads: HashSet::new(),
            read_mutex: Arc::new(tokio::sync::Mutex::new(())),
            webseed_assigned: HashSet::new(),
            listen_port: None,
            close_tx: None,
            acceptor: None,
            announcer_triggers: Vec::new(),
            tracker_stats: HashMap::new(),
            resumer: None,
            resume_claimed: false,
            dht,
            last_error: None,
            notify_listen: Vec::new(),
            notify_complete: Vec::new(),
            notify_error: Vec::new(),
            notify_stop: Vec::new(),
        };

        Ok((session, SessionHandle { tx }))
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle { tx: self.ctx.tx.clone() }
    }

    /// The event loop. Runs until `Close` arrives or every handle is gone.
    #[tracing::instrument(name = "session", skip_all,
        fields(torrent = ?self.ctx.info_hash))]
    pub async fn run(mut self) -> Result<(), Error> {
        debug!("session loop running for {:?}", self.name);

        loop {
            select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle_msg(msg).await {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
                // the block arm leaves the wait set while the writer pool is
                // saturated; TCP then pushes back on the senders
                Some((addr, block)) = self.blocks_rx.recv(),
                    if self.status.is_running() && !self.writes_saturated() =>
                {
                    self.handle_block(addr, block).await;
                }
                _ = self.heartbeat_interval.tick(),
                    if self.status.is_active() =>
                {
                    self.heartbeat();
                }
                _ = self.request_interval.tick(),
                    if self.status == Status::Downloading =>
                {
                    self.assign_downloads();
                }
                _ = self.unchoke_interval.tick(),
                    if self.status.is_running() =>
                {
                    self.unchoke_tick();
                }
                _ = self.optimistic_interval.tick(),
                    if self.status.is_running() =>
                {
                    self.optimistic_unchoke_tick();
                }
                _ = self.dial_interval.tick(),
                    if self.status.is_active() =>
                {
                    self.dial_peers();
                }
                _ = self.resume_interval.tick(),
                    if self.status.is_active() =>
                {
                    self.write_resume().await;
                }
                _ = self.stats_interval.tick(),
                    if self.status.is_active() =>
                {
                    self.write_resume().await;
                }
            }
        }

        if self.status.is_active() {
            self.stop_internal(None).await;
        }
        Ok(())
    }

    // --- command handling ---

    /// Returns true when the session should end.
    async fn handle_msg(&mut self, msg: SessionMsg) -> bool {
        match msg {
            SessionMsg::Start => self.start().await,
            SessionMsg::Stop => self.stop_internal(None).await,
            SessionMsg::Close => {
                self.stop_internal(None).await;
                return true;
            }
            SessionMsg::Stats(reply) => {
                let _ = reply.send(self.stats_snapshot());
            }
            SessionMsg::Trackers(reply) => {
                let _ =
                    reply.send(self.tracker_stats.values().cloned().collect());
            }
            SessionMsg::Peers(reply) => {
                let _ = reply.send(self.peers_snapshot());
            }
            SessionMsg::AddPeers(addrs) => {
                self.merge_addrs(addrs, AddrSource::Manual);
                self.dial_peers();
            }
            SessionMsg::NotifyListen(reply) => {
                // fires immediately when the listener is already up
                match self.listen_port {
                    Some(port) => {
                        let _ = reply.send(port);
                    }
                    None => self.notify_listen.push(reply),
                }
            }
            SessionMsg::NotifyComplete(reply) => {
                if self.status == Status::Seeding {
                    let _ = reply.send(());
                } else {
                    self.notify_complete.push(reply);
                }
            }
            SessionMsg::NotifyError(reply) => match &self.last_error {
                Some(err) => {
                    let _ = reply.send(err.clone());
                }
                None => self.notify_error.push(reply),
            },
            SessionMsg::NotifyStop(reply) => {
                if self.status == Status::Stopped {
                    let _ = reply.send(());
                } else {
                    self.notify_stop.push(reply);
                }
            }
            SessionMsg::SetResumer(resumer) => {
                self.resumer = Some(resumer);
            }
        }
        false
    }

    async fn start(&mut self) {
        if self.status.is_active() {
            debug!("start on an active session is a no-op");
            return;
        }

        info!("starting {:?}", self.name);
        self.last_error = None;

        let (close_tx, close_rx) = watch::channel(false);
        self.close_tx = Some(close_tx);

        // the listener first; its port is what we announce
        let listener = match TcpListener::bind(("0.0.0.0", self.config.port))
            .await
        {
            Ok(l) => l,
            Err(e) => {
                self.fatal(Error::Io(e)).await;
                return;
            }
        };
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        self.listen_port = Some(port);
        for observer in self.notify_listen.drain(..) {
            let _ = observer.send(port);
        }

        self.spawn_acceptor(listener, close_rx.clone());
        self.spawn_announcers(port, close_rx.clone());

        if let Some(dht) = self.dht.take() {
            DhtAnnouncer::spawn(
                dht,
                self.ctx.clone(),
                port,
                Duration::from_secs(300),
                close_rx.clone(),
            );
        }

        // a resume snapshot can restore the metadata of a magnet torrent
        if self.info.is_none() {
            if let Some(snapshot) = self.load_resume().await {
                if let Some(blob) = snapshot.info_blob {
                    match Info::from_bencode(&blob) {
                        Ok(info)
                            if info.info_hash == self.ctx.info_hash =>
                        {
                            self.resume_claimed = snapshot
                                .bitfield
                                .iter()
                                .any(|b| *b != 0);
                            self.install_info(info);
                        }
                        _ => warn!("resume snapshot carries a bogus info"),
                    }
                }
            }
        }

        if self.info.is_none() {
            if let Some(info) = self.source.info().cloned() {
                self.install_info(info);
            }
        }

        if self.info.is_some() {
            // a restarted session tore its writer pool down on stop
            if self.writer_pool.is_none() {
                if let Some(storage) = self.storage.clone() {
                    self.writer_pool = Some(PieceWriterPool::spawn(
                        self.config.piece_writers,
                        storage,
                        self.ctx.events.clone(),
                    ));
                }
            }
            self.begin_allocation(close_rx);
        } else {
            self.status = Status::DownloadingMetadata;
        }

        self.dial_peers();
    }

    async fn stop_internal(&mut self, fatal: Option<Arc<Error>>) {
        if !self.status.is_active() {
            if let Some(err) = fatal {
                self.latch_error(err);
            }
            return;
        }

        info!("stopping {:?}", self.name);

        // terminal stopped announce, bounded so shutdown cannot hang
        let data = self.announce_data();
        for url in self.tracker_urls() {
            let announce = crate::tracker::Announce {
                info_hash: self.ctx.info_hash.clone(),
                peer_id: self.ctx.local_id.clone(),
                port: self.listen_port.unwrap_or(self.config.port),
                downloaded: data.downloaded,
                uploaded: data.uploaded,
                left: data.left,
                event: Event::Stopped,
                num_want: 0,
            };
            spawn(StopAnnouncer::announce(
                url,
                announce,
                Duration::from_secs(5),
            ));
        }

        if let Some(close) = self.close_tx.take() {
            let _ = close.send(true);
        }
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        self.announcer_triggers.clear();

        for ctx in self.peers.values() {
            ctx.send(PeerMsg::Shutdown);
        }
        self.peers.clear();
        self.peer_pieces.clear();
        self.peer_have_all.clear();
        self.peer_metadata_ids.clear();
        self.connected_ips.clear();
        self.peer_ids.clear();
        self.handshaking.clear();
        self.unchoked.clear();
        self.opt_unchoked = None;
        self.pending_reads.clear();
        self.webseed_assigned.clear();
        self.metadata_failed.clear();
        self.info_downloader = None;

        self.drop_all_downloaders();
        self.endgame = false;

        // in-flight writes complete on their own; their results land in the
        // event queue and are ignored once the pieces are reset
        self.writer_pool = None;
        self.inflight_writes = 0;
        for piece in &mut self.pieces {
            piece.writing = false;
            piece.partial = false;
            piece.assigned = 0;
            piece.availability = 0;
        }

        self.write_resume().await;

        self.listen_port = None;
        self.status = Status::Stopped;

        if let Some(err) = fatal {
            self.latch_error(err);
        }
        for observer in self.notify_stop.drain(..) {
            let _ = observer.send(());
        }
    }

    fn latch_error(&mut self, err: Arc<Error>) {
        error!("{:?} fatal: {err}", self.name);
        self.last_error = Some(err.clone());
        for observer in self.notify_error.drain(..) {
            let _ = observer.send(err.clone());
        }
    }

    async fn fatal(&mut self, err: Error) {
        Box::pin(self.stop_internal(Some(Arc::new(err)))).await;
    }

    // --- start helpers ---

    fn spawn_acceptor(
        &mut self,
        listener: TcpListener,
        mut close: watch::Receiver<bool>,
    ) {
        let events = self.ctx.events.clone();

        self.acceptor = Some(spawn(async move {
            loop {
                select! {
                    accepted = listener.accept() => {
                        let Ok((socket, addr)) = accepted else { continue };
                        trace!("incoming connection from {addr}");
                        if events
                            .send(SessionEvent::IncomingConn(socket))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ = close.changed() => {
                        if *close.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    fn spawn_announcers(&mut self, port: u16, close: watch::Receiver<bool>) {
        let config = AnnouncerConfig {
            port,
            num_want: self.config.max_peers,
            min_interval: Duration::from_secs(
                self.config.min_announce_interval_secs,
            ),
            max_interval: Duration::from_secs(
                self.config.max_announce_interval_secs,
            ),
        };

        for url in self.tracker_urls() {
            let (trigger_tx, trigger_rx) = mpsc::channel::<Event>(4);
            self.announcer_triggers.push(trigger_tx);
            self.tracker_stats
                .entry(url.clone())
                .or_insert_with(|| TrackerStats {
                    url: url.clone(),
                    ..Default::default()
                });

            Announcer::spawn(
                url,
                self.ctx.clone(),
                config,
                trigger_rx,
                close.clone(),
            );
        }
    }

    fn tracker_urls(&self) -> Vec<String> {
        let mut urls = self.source.udp_trackers();
        urls.dedup();
        urls
    }

    fn begin_allocation(&mut self, close: watch::Receiver<bool>) {
        let Some(storage) = self.storage.clone() else { return };
        self.status = Status::Allocating;
        Allocator::spawn(storage, self.ctx.events.clone(), close);
    }

    /// The metadata is known: build the piece table, the picker, storage and
    /// the writer pool, and resize peer state that predates it.
    fn install_info(&mut self, info: Info) {
        let piece_count = info.piece_count();
        info!(
            "{:?} metadata installed: {piece_count} pieces of {}",
            self.name, info.piece_length
        );

        self.metadata_size = Some(info.raw.len() as u32);
        self.pieces = (0..piece_count)
            .map(|i| Piece::new(info.piece_hash(i)))
            .collect();
        self.bitfield = Bitfield::from_piece_count(piece_count as usize);
        self.picker = Some(PiecePicker::new(
            piece_count,
            self.config.sequential_head,
            self.config.endgame_threshold,
            self.config.endgame_duplicates,
        ));

        let storage =
            Arc::new(Storage::file(&self.config.download_dir, &info));
        self.file_table = Some(FileTable::from_info(&info));
        self.writer_pool = Some(PieceWriterPool::spawn(
            self.config.piece_writers,
            storage.clone(),
            self.ctx.events.clone(),
        ));
        self.storage = Some(storage);

        // bitfields that arrived before the metadata have no length; clamp
        // them and rebuild availability
        for piece in &mut self.pieces {
            piece.availability = 0;
        }
        for (addr, bitfield) in self.peer_pieces.iter_mut() {
            bitfield.resize(piece_count as usize, false);
            if self.peer_have_all.contains(addr) {
                for i in 0..piece_count as usize {
                    bitfield.set(i, true);
                }
            }
            for i in bitfield.iter_ones() {
                self.pieces[i].availability += 1;
            }
        }

        self.info = Some(info);
    }

    /// Allocation finished; verify the disk or go straight to running.
    fn begin_verification(&mut self, needs_verification: bool) {
        let Some(close) = self.close_tx.as_ref().map(|c| c.subscribe()) else {
            return;
        };

        if needs_verification || self.resume_claimed {
            self.status = Status::Verifying;
            let info = self.info.as_ref().expect("verifying requires info");
            let hashes =
                (0..info.piece_count()).map(|i| info.piece_hash(i)).collect();
            Verifier::spawn(
                self.storage.clone().expect("storage exists with info"),
                hashes,
                self.ctx.events.clone(),
                close,
            );
        } else {
            self.enter_running();
        }
    }

    fn enter_running(&mut self) {
        let complete = !self.pieces.is_empty()
            && self.bitfield.count_ones() == self.bitfield.len();

        if complete {
            self.enter_seeding();
        } else {
            info!("{:?} downloading", self.name);
            self.status = Status::Downloading;
            self.spawn_webseeds();
        }
    }

    fn spawn_webseeds(&mut self) {
        let Some(close) = self.close_tx.as_ref().map(|c| c.subscribe()) else {
            return;
        };
        let Some(table) = self.file_table.clone() else { return };

        let mut urls = self.config.web_seeds.clone();
        urls.extend(self.source.web_seeds());
        urls.dedup();

        for url in urls {
            WebSeed::spawn(
                url,
                table.clone(),
                self.ctx.clone(),
                close.clone(),
            );
        }
    }

    fn enter_seeding(&mut self) {
        info!("{:?} complete, seeding", self.name);
        self.status = Status::Seeding;
        self.endgame = false;
        self.drop_all_downloaders();

        for ctx in self.peers.values() {
            if ctx.am_interested.load(Ordering::Relaxed) {
                ctx.send(PeerMsg::NotInterested);
            }
        }

        for observer in self.notify_complete.drain(..) {
            let _ = observer.send(());
        }
        for trigger in &self.announcer_triggers {
            let _ = trigger.try_send(Event::Completed);
        }
    }

    // --- event handling ---

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::IncomingConn(socket) => {
                self.incoming_conn(socket);
            }
            SessionEvent::HandshakeDone { addr, direction, result } => {
                self.handshake_done(addr, direction, result);
            }
            SessionEvent::PeerDisconnected { addr } => {
                self.peer_disconnected(addr);
            }
            SessionEvent::PeerSnubbed { addr } => {
                self.peer_snubbed(addr);
            }
            SessionEvent::PeerChoked { addr } => {
                self.peer_choked(addr);
            }
            SessionEvent::PeerUnchoked { addr } => {
                self.peer_unchoked(addr);
            }
            SessionEvent::PeerInterested { addr, interested } => {
                trace!("{addr} interested: {interested}");
            }
            SessionEvent::PeerBitfield { addr, bitfield } => {
                self.peer_bitfield(addr, bitfield);
            }
            SessionEvent::PeerHave { addr, piece } => {
                self.peer_have(addr, piece);
            }
            SessionEvent::PeerHaveAll { addr } => {
                // before the metadata arrives the piece count is unknown;
                // remember the peer and fill its bitfield in later
                self.peer_have_all.insert(addr);
                let len = self.pieces.len();
                let mut bitfield = Bitfield::from_piece_count(len);
                for i in 0..len {
                    bitfield.set(i, true);
                }
                self.peer_bitfield(addr, bitfield);
            }
            SessionEvent::PeerHaveNone { addr } => {
                self.peer_have_all.remove(&addr);
                let bitfield = Bitfield::from_piece_count(self.pieces.len());
                self.peer_bitfield(addr, bitfield);
            }
            SessionEvent::BlockRequested { addr, info } => {
                self.block_requested(addr, info);
            }
            SessionEvent::BlockRequestCancelled { addr, info } => {
                self.pending_reads.remove(&(addr, info));
            }
            SessionEvent::BlockRead { addr, block } => {
                self.block_read(addr, block);
            }
            SessionEvent::ExtendedHandshake { addr, ext } => {
                self.extended_handshake(addr, ext);
            }
            SessionEvent::MetadataPiece { addr, piece, payload } => {
                self.metadata_piece(addr, piece, payload).await;
            }
            SessionEvent::MetadataRequest { addr, piece } => {
                self.metadata_request(addr, piece);
            }
            SessionEvent::MetadataRejected { addr, piece } => {
                debug!("{addr} rejected metadata piece {piece}");
                self.metadata_failed.insert(addr);
                if self
                    .info_downloader
                    .as_ref()
                    .is_some_and(|d| d.addr == addr)
                {
                    self.info_downloader = None;
                    self.start_metadata_download();
                }
            }
            SessionEvent::TrackerAddrs(addrs) => {
                self.merge_addrs(addrs, AddrSource::Tracker);
                self.dial_peers();
            }
            SessionEvent::DhtAddrs(addrs) => {
                self.merge_addrs(addrs, AddrSource::Dht);
                self.dial_peers();
            }
            SessionEvent::TrackerUpdate { url, seeders, leechers, error } => {
                let entry = self
                    .tracker_stats
                    .entry(url.clone())
                    .or_insert_with(|| TrackerStats {
                        url,
                        ..Default::default()
                    });
                if error.is_none() {
                    entry.seeders = seeders;
                    entry.leechers = leechers;
                }
                entry.last_error = error;
            }
            SessionEvent::AnnounceData(reply) => {
                let _ = reply.send(self.announce_data());
            }
            SessionEvent::PieceWritten { index, result } => {
                self.piece_written(index, result).await;
            }
            SessionEvent::AllocatorProgress { file } => {
                trace!("allocated file {file}");
            }
            SessionEvent::AllocatorDone(result) => match result {
                Ok(needs_verification)
                    if self.status == Status::Allocating =>
                {
                    self.begin_verification(needs_verification);
                }
                Ok(_) => {}
                Err(e) => self.fatal(e).await,
            },
            SessionEvent::VerifierProgress { piece } => {
                trace!("verified piece {piece}");
            }
            SessionEvent::VerifierDone(result) => match result {
                Ok(bitfield) if self.status == Status::Verifying => {
                    self.adopt_verified_bitfield(bitfield);
                }
                Ok(_) => {}
                Err(e) => self.fatal(e).await,
            },
            SessionEvent::WebSeedPick(reply) => {
                let _ = reply.send(self.pick_for_webseed());
            }
            SessionEvent::WebSeedPiece { index, data } => {
                self.webseed_piece(index, data);
            }
            SessionEvent::WebSeedError { url, error } => {
                debug!("web seed {url}: {error}");
            }
        }
    }

    fn incoming_conn(&mut self, socket: tokio::net::TcpStream) {
        if !self.status.is_active() {
            return;
        }
        let Ok(addr) = socket.peer_addr() else { return };

        if self.blocklist.contains(addr.ip()) {
            debug!("{addr} is blocklisted, dropping");
            return;
        }
        if self.peers.len() + self.handshaking.len()
            >= self.config.max_peers as usize
        {
            return;
        }
        if !self.config.allow_multiple_per_ip
            && self.connected_ips.contains(&addr.ip())
        {
            return;
        }
        if !self.handshaking.insert(addr) {
            return;
        }

        let events = self.ctx.events.clone();
        let info_hash = self.ctx.info_hash.clone();
        let local_id = self.ctx.local_id.clone();
        let limit = Duration::from_secs(self.config.handshake_timeout_secs);

        spawn(async move {
            let result =
                handshaker::incoming(socket, info_hash, local_id, limit).await;
            let _ = events
                .send(SessionEvent::HandshakeDone {
                    addr,
                    direction: Direction::Inbound,
                    result,
                })
                .await;
        });
    }

    fn handshake_done(
        &mut self,
        addr: SocketAddr,
        direction: Direction,
        result: Result<handshaker::Handshaken, Error>,
    ) {
        self.handshaking.remove(&addr);

        if !self.status.is_active() {
            return;
        }

        let hs = match result {
            Ok(hs) => hs,
            Err(e) => {
                debug!("{addr} {direction:?} handshake failed: {e}");
                self.addrs.remove(&addr);
                return;
            }
        };

        if self.peers.contains_key(&addr)
            || self.peer_ids.contains(&hs.id)
            || (!self.config.allow_multiple_per_ip
                && self.connected_ips.contains(&addr.ip()))
        {
            debug!("{addr} duplicate connection, dropping");
            return;
        }

        let params = PeerParams {
            local_bitfield: self.bitfield.clone(),
            metadata_size: self.metadata_size,
            listen_port: self.listen_port.unwrap_or(self.config.port),
            snub_timeout: Duration::from_secs(self.config.snub_timeout_secs),
        };

        let ctx = Peer::spawn(hs, self.ctx.clone(), params);

        debug!("{addr} connected ({direction:?})");
        self.peer_ids.insert(ctx.id.clone());
        self.connected_ips.insert(addr.ip());
        self.peer_pieces
            .insert(addr, Bitfield::from_piece_count(self.pieces.len()));
        self.peers.insert(addr, ctx);
    }

    fn peer_disconnected(&mut self, addr: SocketAddr) {
        let Some(ctx) = self.peers.remove(&addr) else { return };
        debug!("{addr} disconnected");

        self.peer_ids.remove(&ctx.id);
        self.connected_ips.remove(&addr.ip());
        self.peer_have_all.remove(&addr);
        self.peer_metadata_ids.remove(&addr);
        self.metadata_failed.remove(&addr);
        self.unchoked.retain(|a| *a != addr);
        if self.opt_unchoked == Some(addr) {
            self.opt_unchoked = None;
        }
        self.pending_reads.retain(|(a, _)| *a != addr);

        if let Some(bitfield) = self.peer_pieces.remove(&addr) {
            for i in bitfield.iter_ones() {
                if let Some(piece) = self.pieces.get_mut(i) {
                    piece.availability = piece.availability.saturating_sub(1);
                }
            }
        }

        if self
            .info_downloader
            .as_ref()
            .is_some_and(|d| d.addr == addr)
        {
            self.info_downloader = None;
            self.start_metadata_download();
        }

        self.drop_downloader(addr);
    }

    /// Remove the peer's downloader from whichever set holds it, fixing the
    /// outstanding-request and assignment accounting.
    fn drop_downloader(&mut self, addr: SocketAddr) {
        let downloader = self
            .downloaders
            .remove(&addr)
            .inspect(|d| {
                if let Some(p) = self.pieces.get_mut(d.index as usize) {
                    p.assigned = p.assigned.saturating_sub(1);
                }
            })
            .or_else(|| self.downloaders_snubbed.remove(&addr))
            .or_else(|| self.downloaders_choked.remove(&addr));

        if let Some(d) = downloader {
            self.total_outstanding =
                self.total_outstanding.saturating_sub(d.outstanding_count());
            if let Some(piece) = self.pieces.get_mut(d.index as usize) {
                if !self.downloaders.values().any(|o| o.index == d.index) {
                    piece.partial = false;
                }
            }
        }
    }

    fn drop_all_downloaders(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .downloaders
            .keys()
            .chain(self.downloaders_snubbed.keys())
            .chain(self.downloaders_choked.keys())
            .copied()
            .collect();
        for addr in addrs {
            self.drop_downloader(addr);
        }
        self.total_outstanding = 0;
    }

    fn peer_snubbed(&mut self, addr: SocketAddr) {
        let Some(mut d) = self.downloaders.remove(&addr) else { return };
        warn!("{addr} snubbed while downloading piece {}", d.index);

        // free the piece for another peer; the snubbed downloader limps on
        // with a window of one in case the peer wakes up
        if let Some(piece) = self.pieces.get_mut(d.index as usize) {
            piece.assigned = piece.assigned.saturating_sub(1);
        }
        self.total_outstanding =
            self.total_outstanding.saturating_sub(d.outstanding_count());
        d.throttle();
        self.downloaders_snubbed.insert(addr, d);
    }

    fn peer_choked(&mut self, addr: SocketAddr) {
        let downloader = self
            .downloaders
            .remove(&addr)
            .inspect(|d| {
                if let Some(p) = self.pieces.get_mut(d.index as usize) {
                    p.assigned = p.assigned.saturating_sub(1);
                }
            })
            .or_else(|| self.downloaders_snubbed.remove(&addr));

        if let Some(mut d) = downloader {
            self.total_outstanding =
                self.total_outstanding.saturating_sub(d.outstanding_count());
            d.choke();
            self.downloaders_choked.insert(addr, d);
        }
    }

    fn peer_unchoked(&mut self, addr: SocketAddr) {
        if let Some(mut d) = self.downloaders_choked.remove(&addr) {
            let piece = self.pieces.get_mut(d.index as usize);
            match piece {
                Some(p) if p.missing() => {
                    p.assigned += 1;
                    d.unchoke();
                    self.downloaders.insert(addr, d);
                    self.top_up(addr);
                }
                // someone else finished the piece meanwhile
                _ => {}
            }
        }
    }

    fn peer_bitfield(&mut self, addr: SocketAddr, mut bitfield: Bitfield) {
        if !self.peers.contains_key(&addr) {
            return;
        }

        if !self.pieces.is_empty() {
            bitfield.resize(self.pieces.len(), false);
        }

        // swap availability from the old view to the new one
        if let Some(old) = self.peer_pieces.get(&addr) {
            for i in old.iter_ones() {
                if let Some(piece) = self.pieces.get_mut(i) {
                    piece.availability = piece.availability.saturating_sub(1);
                }
            }
        }
        for i in bitfield.iter_ones() {
            if let Some(piece) = self.pieces.get_mut(i) {
                piece.availability += 1;
            }
        }

        self.peer_pieces.insert(addr, bitfield);
        self.update_interest(addr);
    }

    fn peer_have(&mut self, addr: SocketAddr, piece: u32) {
        let Some(bitfield) = self.peer_pieces.get_mut(&addr) else { return };

        if self.pieces.is_empty() && piece as usize >= bitfield.len() {
            // before the metadata arrives the true length is unknown
            bitfield.resize(piece as usize + 1, false);
        }

        if bitfield.get(piece as usize).map(|b| *b) == Some(false) {
            bitfield.set(piece as usize, true);
            if let Some(p) = self.pieces.get_mut(piece as usize) {
                p.availability += 1;
            }
        }

        self.update_interest(addr);
    }

    /// Become interested in peers that have something we miss and drop
    /// interest once they don't.
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(ctx) = self.peers.get(&addr) else { return };
        if self.status == Status::Seeding {
            return;
        }

        let has_missing = match self.peer_pieces.get(&addr) {
            Some(remote) if !self.pieces.is_empty() => remote
                .iter_ones()
                .any(|i| self.pieces.get(i).is_some_and(|p| p.missing())),
            // without metadata any advertised piece is interesting
            Some(remote) => remote.any(),
            None => false,
        };

        let am_interested = ctx.am_interested.load(Ordering::Relaxed);
        if has_missing && !am_interested {
            ctx.send(PeerMsg::Interested);
        } else if !has_missing && am_interested {
            ctx.send(PeerMsg::NotInterested);
        }
    }

    // --- download scheduling ---

    /// Periodic pass: keep interest fresh, move into endgame when few pieces
    /// remain, give every idle unchoked peer a piece and top up windows.
    fn assign_downloads(&mut self) {
        if self.picker.is_none() {
            return;
        }

        if !self.endgame
            && self
                .picker
                .as_ref()
                .is_some_and(|p| p.in_endgame(&self.bitfield))
        {
            info!("{:?} entering endgame", self.name);
            self.endgame = true;
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr);

            let Some(ctx) = self.peers.get(&addr) else { continue };
            if ctx.peer_choking.load(Ordering::Relaxed) {
                continue;
            }

            let has_downloader = self.downloaders.contains_key(&addr)
                || self.downloaders_snubbed.contains_key(&addr)
                || self.downloaders_choked.contains_key(&addr);

            if !has_downloader {
                self.assign_piece(addr);
            }
            self.top_up(addr);
        }
    }

    /// Ask the picker for a piece and bind a downloader for it.
    fn assign_piece(&mut self, addr: SocketAddr) {
        let (Some(picker), Some(info)) = (&self.picker, &self.info) else {
            return;
        };
        let Some(remote) = self.peer_pieces.get(&addr) else { return };

        let Some(index) = picker.pick(&self.pieces, remote, self.endgame)
        else {
            return;
        };

        let downloader = PieceDownloader::new(
            addr,
            index,
            info.piece_size(index),
            self.config.request_queue_len,
        );
        self.pieces[index as usize].assigned += 1;
        trace!("{addr} assigned piece {index}");
        self.downloaders.insert(addr, downloader);
    }

    /// Fill the peer's request window, bounded by the global pending cap.
    fn top_up(&mut self, addr: SocketAddr) {
        let budget = self
            .config
            .pending_requests_cap
            .saturating_sub(self.total_outstanding);
        if budget == 0 {
            return;
        }

        let Some(d) = self.downloaders.get_mut(&addr) else { return };
        let requests = d.next_requests(budget);
        if requests.is_empty() {
            return;
        }

        self.total_outstanding += requests.len();
        if let Some(ctx) = self.peers.get(&addr) {
            ctx.send(PeerMsg::RequestBlocks(requests));
        }
    }

    async fn handle_block(&mut self, addr: SocketAddr, block: Block) {
        // a snubbed peer that resumes sending rejoins the active set
        if let Some(d) = self.downloaders_snubbed.remove(&addr) {
            if let Some(piece) = self.pieces.get_mut(d.index as usize) {
                piece.assigned += 1;
            }
            self.downloaders.insert(addr, d);
        }

        let Some(d) = self.downloaders.get_mut(&addr) else {
            trace!("{addr} sent a block nobody asked for");
            return;
        };

        let info = block.info();
        match d.block_received(&block) {
            BlockReceipt::Ignored => {}
            BlockReceipt::Accepted => {
                let index = d.index;
                self.total_outstanding =
                    self.total_outstanding.saturating_sub(1);
                if let Some(piece) = self.pieces.get_mut(index as usize) {
                    piece.partial = true;
                }
                if self.endgame {
                    self.cancel_duplicates(index, info, addr);
                }
                self.top_up(addr);
            }
            BlockReceipt::Complete => {
                let d = self
                    .downloaders
                    .remove(&addr)
                    .expect("downloader present");
                let index = d.index;
                self.total_outstanding =
                    self.total_outstanding.saturating_sub(1);

                if self.endgame {
                    self.cancel_duplicates(index, info, addr);
                }
                if let Some(piece) = self.pieces.get_mut(index as usize) {
                    piece.assigned = piece.assigned.saturating_sub(1);
                    piece.partial = false;
                }

                if self.finish_piece(addr, index, d.take_buf()) {
                    // duplicate downloaders of this piece are now pointless
                    self.evict_piece_downloaders(index, addr);
                }
                self.assign_piece(addr);
                self.top_up(addr);
            }
        }
    }

    /// In endgame the same block may be outstanding at several peers; on the
    /// first valid arrival the rest get cancels.
    fn cancel_duplicates(
        &mut self,
        index: u32,
        info: BlockInfo,
        from: SocketAddr,
    ) {
        let duplicates: Vec<SocketAddr> = self
            .downloaders
            .iter()
            .filter(|(a, d)| **a != from && d.index == index)
            .map(|(a, _)| *a)
            .collect();

        for addr in duplicates {
            if let Some(ctx) = self.peers.get(&addr) {
                ctx.send(PeerMsg::Cancel(info));
            }
        }
    }

    /// A piece buffer is fully assembled: hash it synchronously, then either
    /// hand it to the writer pool or punish the source. Returns whether the
    /// piece was accepted.
    fn finish_piece(
        &mut self,
        addr: SocketAddr,
        index: u32,
        buf: Vec<u8>,
    ) -> bool {
        let Some(piece) = self.pieces.get(index as usize) else {
            return false;
        };
        if !piece.missing() {
            // an endgame duplicate landed after the first copy
            return false;
        }

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let hash: [u8; 20] = hasher.finalize().into();

        if hash != piece.hash {
            warn!("{addr} delivered a corrupt piece {index}");
            if let Some(ctx) = self.peers.get(&addr) {
                if ctx.bump_penalty() >= PENALTY_LIMIT {
                    info!("{addr} exceeded the penalty limit, dropping");
                    ctx.send(PeerMsg::Shutdown);
                }
            }
            return false;
        }

        self.start_write(index, buf);
        true
    }

    /// Drop every other downloader bound to a piece that just completed,
    /// cancelling whatever they still await.
    fn evict_piece_downloaders(&mut self, index: u32, keep: SocketAddr) {
        let addrs: Vec<SocketAddr> = self
            .downloaders
            .iter()
            .map(|(a, d)| (*a, d.index))
            .chain(
                self.downloaders_snubbed
                    .iter()
                    .map(|(a, d)| (*a, d.index)),
            )
            .chain(
                self.downloaders_choked.iter().map(|(a, d)| (*a, d.index)),
            )
            .filter(|(a, i)| *a != keep && *i == index)
            .map(|(a, _)| a)
            .collect();

        for addr in addrs {
            if let (Some(d), Some(ctx)) =
                (self.downloaders.get(&addr), self.peers.get(&addr))
            {
                for info in d.pending() {
                    ctx.send(PeerMsg::Cancel(info));
                }
            }
            self.drop_downloader(addr);
        }
    }

    fn start_write(&mut self, index: u32, data: Vec<u8>) {
        let Some(pool) = &self.writer_pool else { return };

        if let Err(e) = pool.submit(index, data) {
            // losing the writer pool means storage is gone
            let tx = self.ctx.tx.clone();
            spawn(async move {
                let _ = tx.send(SessionMsg::Stop).await;
            });
            self.latch_error(Arc::new(e));
            return;
        }

        self.inflight_writes += 1;
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.writing = true;
        }
    }

    fn writes_saturated(&self) -> bool {
        match &self.writer_pool {
            Some(pool) => self.inflight_writes >= pool.size(),
            None => true,
        }
    }

    async fn piece_written(&mut self, index: u32, result: Result<(), Error>) {
        self.inflight_writes = self.inflight_writes.saturating_sub(1);

        let Some(piece) = self.pieces.get_mut(index as usize) else { return };
        if !piece.writing {
            // a leftover result from before a stop
            return;
        }
        piece.writing = false;

        match result {
            Ok(()) => {
                piece.have = true;
                self.bitfield.safe_set(index as usize);
                self.cache.invalidate_piece(index);

                // tell everyone who lacks it
                for (addr, ctx) in &self.peers {
                    let lacks = self
                        .peer_pieces
                        .get(addr)
                        .and_then(|b| b.get(index as usize).map(|v| !*v))
                        .unwrap_or(true);
                    if lacks {
                        ctx.send(PeerMsg::Have(index));
                    }
                }

                if self.bitfield.count_ones() == self.bitfield.len() {
                    self.enter_seeding();
                    self.write_resume().await;
                }
            }
            Err(e) => {
                error!("writing piece {index} failed: {e}");
                self.fatal(e).await;
            }
        }
    }

    // --- upload path ---

    fn block_requested(&mut self, addr: SocketAddr, info: BlockInfo) {
        let Some(ctx) = self.peers.get(&addr) else { return };

        if ctx.am_choking.load(Ordering::Relaxed) {
            // choked peers get a reject when they speak the fast extension
            if ctx.supports_fast {
                ctx.send(PeerMsg::Send(Message::Reject(info)));
            }
            return;
        }
        if self
            .bitfield
            .get(info.index as usize)
            .map(|b| !*b)
            .unwrap_or(true)
        {
            if ctx.supports_fast {
                ctx.send(PeerMsg::Send(Message::Reject(info)));
            }
            return;
        }

        if let Some(data) = self.cache.get(&info) {
            let block = Block {
                index: info.index,
                begin: info.begin,
                data: data.to_vec(),
            };
            self.send_block(addr, block);
            return;
        }

        let Some(storage) = self.storage.clone() else { return };
        if !self.pending_reads.insert((addr, info)) {
            return;
        }

        let events = self.ctx.events.clone();
        let read_mutex = self.read_mutex.clone();

        spawn(async move {
            // storage reads serialize to keep sequential disks fast
            let _guard = read_mutex.lock().await;
            match storage.read_block(&info).await {
                Ok(data) => {
                    let block =
                        Block { index: info.index, begin: info.begin, data };
                    let _ = events
                        .send(SessionEvent::BlockRead { addr, block })
                        .await;
                }
                Err(e) => {
                    debug!("upload read failed: {e}");
                }
            }
        });
    }

    fn block_read(&mut self, addr: SocketAddr, block: Block) {
        let info = block.info();
        if !self.pending_reads.remove(&(addr, info)) {
            // cancelled while the read was in flight
            return;
        }

        self.cache.put(info, block.data.clone());
        self.send_block(addr, block);
    }

    fn send_block(&mut self, addr: SocketAddr, block: Block) {
        let Some(ctx) = self.peers.get(&addr) else { return };
        if ctx.am_choking.load(Ordering::Relaxed) {
            return;
        }

        let len = block.data.len() as u64;
        ctx.counter.record_upload(len);
        self.ctx.counter.record_upload(len);
        ctx.send(PeerMsg::Send(Message::Piece(block)));
    }

    // --- metadata exchange ---

    fn extended_handshake(
        &mut self,
        addr: SocketAddr,
        ext: crate::extensions::Extension,
    ) {
        if let Some(ut_metadata) = ext.m.ut_metadata {
            self.peer_metadata_ids.insert(addr, ut_metadata);
        }
        if self.info.is_none() {
            if let Some(size) = ext.metadata_size {
                if size > 0 {
                    self.metadata_size = Some(size);
                }
            }
            self.start_metadata_download();
        }
    }

    /// Start (or restart) the single info download on the best candidate.
    fn start_metadata_download(&mut self) {
        if self.info.is_some() || self.info_downloader.is_some() {
            return;
        }
        let Some(size) = self.metadata_size else { return };

        let candidate = self
            .peer_metadata_ids
            .iter()
            .find(|(addr, _)| {
                !self.metadata_failed.contains(*addr)
                    && self.peers.contains_key(*addr)
            })
            .map(|(addr, id)| (*addr, *id));

        let Some((addr, remote_ext_id)) = candidate else {
            // every known source failed this round; forgive them and retry,
            // up to the round limit
            if !self.metadata_failed.is_empty() {
                self.metadata_rounds += 1;
                if self.metadata_rounds >= METADATA_ROUND_LIMIT {
                    let ctx = self.ctx.tx.clone();
                    spawn(async move {
                        let _ = ctx.send(SessionMsg::Stop).await;
                    });
                    self.latch_error(Arc::new(Error::MetadataInvalid));
                    return;
                }
                self.metadata_failed.clear();
            }
            return;
        };

        debug!("{addr} starts serving metadata ({size} bytes)");
        let mut downloader =
            InfoDownloader::new(addr, remote_ext_id, size, METADATA_WINDOW);
        self.request_metadata_pieces(&mut downloader);
        self.info_downloader = Some(downloader);
    }

    fn request_metadata_pieces(&self, downloader: &mut InfoDownloader) {
        let Some(ctx) = self.peers.get(&downloader.addr) else { return };

        for piece in downloader.next_requests() {
            let Ok(payload) = Metadata::request(piece).to_bencode() else {
                continue;
            };
            ctx.send(PeerMsg::Send(Message::Extended(ExtendedMessage(
                downloader.remote_ext_id,
                payload,
            ))));
        }
    }

    async fn metadata_piece(
        &mut self,
        addr: SocketAddr,
        piece: u32,
        payload: Vec<u8>,
    ) {
        let Some(downloader) = self.info_downloader.as_mut() else { return };
        if downloader.addr != addr || self.info.is_some() {
            return;
        }

        match downloader.piece_received(piece, &payload) {
            MetadataReceipt::Ignored => {}
            MetadataReceipt::Accepted => {
                let mut d = self.info_downloader.take().unwrap();
                self.request_metadata_pieces(&mut d);
                self.info_downloader = Some(d);
            }
            MetadataReceipt::Complete => {
                let downloader = self.info_downloader.take().unwrap();
                match downloader.verify(&self.ctx.info_hash) {
                    Ok(blob) => match Info::from_bencode(&blob) {
                        Ok(info) => self.metadata_complete(info),
                        Err(_) => {
                            warn!("{addr} sent undecodable metadata");
                            self.punish_metadata_source(addr);
                        }
                    },
                    Err(()) => {
                        warn!("{addr} sent metadata with a bad hash");
                        self.punish_metadata_source(addr);
                    }
                }
            }
        }
    }

    fn punish_metadata_source(&mut self, addr: SocketAddr) {
        if let Some(ctx) = self.peers.get(&addr) {
            ctx.bump_penalty();
        }
        self.metadata_failed.insert(addr);
        self.start_metadata_download();
    }

    /// The downloaded blob verified against the info hash; the torrent gains
    /// its piece table and moves on to allocation.
    fn metadata_complete(&mut self, info: Info) {
        info!("{:?} metadata complete", self.name);
        self.install_info(info);

        if let Some(close) = self.close_tx.as_ref().map(|c| c.subscribe()) {
            self.status = Status::Allocating;
            Allocator::spawn(
                self.storage.clone().expect("storage installed"),
                self.ctx.events.clone(),
                close,
            );
        }
    }

    fn metadata_request(&mut self, addr: SocketAddr, piece: u32) {
        let Some(ctx) = self.peers.get(&addr) else { return };
        let Some(remote_ext_id) =
            self.peer_metadata_ids.get(&addr).copied()
        else {
            return;
        };

        let reply = match &self.info {
            Some(info) => {
                let total = info.raw.len() as u32;
                let begin = piece * METADATA_PIECE_LEN;
                if begin >= total {
                    Metadata::reject(piece).to_bencode().ok()
                } else {
                    let end = (begin + METADATA_PIECE_LEN).min(total);
                    Metadata::data(
                        piece,
                        total,
                        &info.raw[begin as usize..end as usize],
                    )
                    .ok()
                }
            }
            None => Metadata::reject(piece).to_bencode().ok(),
        };

        if let Some(payload) = reply {
            ctx.send(PeerMsg::Send(Message::Extended(ExtendedMessage(
                remote_ext_id,
                payload,
            ))));
        }
    }

    // --- verification, web seeds ---

    fn adopt_verified_bitfield(&mut self, bitfield: Bitfield) {
        info!(
            "{:?} verified {}/{} pieces",
            self.name,
            bitfield.count_ones(),
            bitfield.len()
        );

        self.bitfield = bitfield;
        for (i, piece) in self.pieces.iter_mut().enumerate() {
            piece.have = self.bitfield.get(i).map(|b| *b).unwrap_or(false);
        }

        self.enter_running();
    }

    fn pick_for_webseed(&mut self) -> Option<u32> {
        if self.status != Status::Downloading {
            return None;
        }

        let index = self.pieces.iter().enumerate().find_map(|(i, p)| {
            let i = i as u32;
            (p.missing()
                && p.assigned == 0
                && !self.webseed_assigned.contains(&i))
            .then_some(i)
        })?;

        self.webseed_assigned.insert(index);
        Some(index)
    }

    fn webseed_piece(&mut self, index: u32, data: Vec<u8>) {
        self.webseed_assigned.remove(&index);

        let Some(piece) = self.pieces.get(index as usize) else { return };
        if !piece.missing() {
            return;
        }

        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();
        if hash != piece.hash {
            warn!("web seed delivered a corrupt piece {index}");
            return;
        }

        self.start_write(index, data);
    }

    // --- choking ---

    /// Every second: fold byte windows into the rolling rates.
    fn heartbeat(&mut self) {
        self.ctx.counter.update_rates();
        for ctx in self.peers.values() {
            ctx.counter.update_rates();
        }
    }

    /// Every ~10s: unchoke the top uploaders-to-us (download rate), or the
    /// top downloaders-from-us while seeding. Snubbed peers are demoted.
    fn unchoke_tick(&mut self) {
        debug!("{}", self.stats_snapshot());

        let seeding = self.status == Status::Seeding;

        let mut candidates: Vec<(u64, SocketAddr)> = self
            .peers
            .iter()
            .filter(|(_, ctx)| {
                ctx.peer_interested.load(Ordering::Relaxed)
                    && !ctx.snubbed.load(Ordering::Relaxed)
            })
            .map(|(addr, ctx)| {
                let rate = if seeding {
                    ctx.counter.upload_rate()
                } else {
                    ctx.counter.download_rate()
                };
                (rate, *addr)
            })
            .collect();

        candidates.sort_unstable_by(|a, b| b.cmp(a));
        let slots = self.config.unchoke_slots;
        let next: Vec<SocketAddr> =
            candidates.into_iter().take(slots).map(|(_, a)| a).collect();

        // choke peers that fell out of the set
        let current = std::mem::take(&mut self.unchoked);
        for addr in &current {
            if !next.contains(addr) && self.opt_unchoked != Some(*addr) {
                if let Some(ctx) = self.peers.get(addr) {
                    trace!("{addr} choked");
                    ctx.send(PeerMsg::Choke);
                }
            }
        }

        for addr in &next {
            if !current.contains(addr) {
                if let Some(ctx) = self.peers.get(addr) {
                    trace!("{addr} unchoked");
                    ctx.send(PeerMsg::Unchoke);
                }
            }
        }

        self.unchoked = next;
    }

    /// Every ~30s: rotate one random choked interested peer in, regardless
    /// of rate.
    fn optimistic_unchoke_tick(&mut self) {
        if let Some(old) = self.opt_unchoked.take() {
            if !self.unchoked.contains(&old) {
                if let Some(ctx) = self.peers.get(&old) {
                    ctx.send(PeerMsg::Choke);
                }
            }
        }

        let candidates: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(addr, ctx)| {
                ctx.peer_interested.load(Ordering::Relaxed)
                    && ctx.am_choking.load(Ordering::Relaxed)
                    && !self.unchoked.contains(addr)
            })
            .map(|(addr, _)| *addr)
            .collect();

        if candidates.is_empty() {
            return;
        }

        let pick =
            candidates[rand::thread_rng().gen_range(0..candidates.len())];
        debug!("{pick} optimistically unchoked");
        if let Some(ctx) = self.peers.get(&pick) {
            ctx.send(PeerMsg::Unchoke);
        }
        self.opt_unchoked = Some(pick);
    }

    // --- dialing ---

    fn merge_addrs(&mut self, addrs: Vec<SocketAddr>, source: AddrSource) {
        let filtered = addrs
            .into_iter()
            .filter(|a| !self.blocklist.contains(a.ip()))
            .filter(|a| !self.peers.contains_key(a));
        self.addrs.push(filtered, source);
    }

    fn dial_peers(&mut self) {
        if !self.status.is_active() {
            return;
        }

        while self.peers.len() + self.handshaking.len()
            < self.config.max_peers as usize
        {
            let Some(addr) = self.addrs.pop() else { break };

            if !self.config.allow_multiple_per_ip
                && self.connected_ips.contains(&addr.ip())
            {
                continue;
            }
            if !self.handshaking.insert(addr) {
                continue;
            }

            let events = self.ctx.events.clone();
            let info_hash = self.ctx.info_hash.clone();
            let local_id = self.ctx.local_id.clone();
            let limit =
                Duration::from_secs(self.config.handshake_timeout_secs);

            spawn(async move {
                let result =
                    handshaker::outgoing(addr, info_hash, local_id, limit)
                        .await;
                let _ = events
                    .send(SessionEvent::HandshakeDone {
                        addr,
                        direction: Direction::Outbound,
                        result,
                    })
                    .await;
            });
        }
    }

    // --- persistence, snapshots ---

    async fn load_resume(&mut self) -> Option<Snapshot> {
        let resumer = self.resumer.clone()?;
        match resumer.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("loading the resume snapshot failed: {e}");
                None
            }
        }
    }

    async fn write_resume(&mut self) {
        let Some(resumer) = self.resumer.clone() else { return };

        let snapshot = Snapshot {
            info_hash: self.ctx.info_hash.0,
            info_blob: self.info.as_ref().map(|i| i.raw.clone()),
            bitfield: self.bitfield.clone().into_vec(),
            downloaded: self.ctx.counter.total_download(),
            uploaded: self.ctx.counter.total_upload(),
        };

        if let Err(e) = resumer.persist(&snapshot).await {
            self.fatal(e).await;
        }
    }

    fn announce_data(&self) -> AnnounceData {
        let size = self.total_size();
        let have: u64 = self
            .info
            .as_ref()
            .map(|info| {
                self.bitfield
                    .iter_ones()
                    .map(|i| info.piece_size(i as u32) as u64)
                    .sum()
            })
            .unwrap_or(0);

        AnnounceData {
            downloaded: self.ctx.counter.total_download(),
            uploaded: self.ctx.counter.total_upload(),
            left: size.saturating_sub(have),
        }
    }

    fn total_size(&self) -> u64 {
        self.info.as_ref().map(|i| i.total_size()).unwrap_or(0)
    }

    fn stats_snapshot(&self) -> SessionStats {
        SessionStats {
            name: self.name.clone(),
            info_hash: self.ctx.info_hash.clone(),
            status: self.status.into(),
            size: self.total_size(),
            piece_count: self.pieces.len() as u32,
            have_pieces: self.bitfield.count_ones() as u32,
            downloaded: self.ctx.counter.total_download(),
            uploaded: self.ctx.counter.total_upload(),
            download_rate: self.ctx.counter.download_rate(),
            upload_rate: self.ctx.counter.upload_rate(),
            connected_peers: self.peers.len(),
            idle_addrs: self.addrs.len(),
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    fn peers_snapshot(&self) -> Vec<PeerStats> {
        self.peers
            .iter()
            .map(|(addr, ctx)| PeerStats {
                addr: *addr,
                id: ctx.id.clone(),
                direction: ctx.direction,
                download_rate: ctx.counter.download_rate(),
                upload_rate: ctx.counter.upload_rate(),
                am_choking: ctx.am_choking.load(Ordering::Relaxed),
                am_interested: ctx.am_interested.load(Ordering::Relaxed),
                peer_choking: ctx.peer_choking.load(Ordering::Relaxed),
                peer_interested: ctx.peer_interested.load(Ordering::Relaxed),
                snubbed: ctx.snubbed.load(Ordering::Relaxed),
                penalty: ctx.penalty.load(Ordering::Relaxed),
            })
            .collect()
    }
}
