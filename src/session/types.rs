use std::{fmt::Display, net::SocketAddr, ops::Deref, sync::Arc};

use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};

use crate::{
    bitfield::Bitfield,
    counter::Counter,
    error::Error,
    extensions::Extension,
    handshaker::Handshaken,
    magnet::Magnet,
    metainfo::{Info, MetaInfo},
    peer::{Direction, PeerId},
    resumer::Resumer,
    utils::to_human_readable,
    wire::{Block, BlockInfo},
};

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the first 10 hex chars identify a torrent well enough in logs
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("An info hash has exactly 20 bytes");
        }
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&value);
        Ok(InfoHash(buf))
    }
}

/// Where the torrent came from. Magnet starts know only the info hash until
/// the metadata extension fills the rest in.
#[derive(Debug, Clone)]
pub enum Source {
    Magnet(Magnet),
    MetaInfo(Box<MetaInfo>),
}

impl Source {
    pub fn magnet(link: &str) -> Result<Self, Error> {
        Ok(Self::Magnet(Magnet::new(link)?))
    }

    pub fn metainfo(meta: MetaInfo) -> Self {
        Self::MetaInfo(Box::new(meta))
    }

    pub fn info_hash(&self) -> InfoHash {
        match self {
            Self::Magnet(m) => m.info_hash(),
            Self::MetaInfo(m) => m.info.info_hash.clone(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Magnet(m) => m.name(),
            Self::MetaInfo(m) => m.info.name.clone(),
        }
    }

    pub fn udp_trackers(&self) -> Vec<String> {
        match self {
            Self::Magnet(m) => m.udp_trackers(),
            Self::MetaInfo(m) => m.udp_trackers(),
        }
    }

    pub fn info(&self) -> Option<&Info> {
        match self {
            Self::Magnet(_) => None,
            Self::MetaInfo(m) => Some(&m.info),
        }
    }

    pub fn web_seeds(&self) -> Vec<String> {
        match self {
            Self::Magnet(_) => Vec::new(),
            Self::MetaInfo(m) => m.web_seeds(),
        }
    }
}

/// The torrent state machine. Any unrecoverable error moves the session to
/// Stopped with `last_error` latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Stopped,
    /// Magnet start: waiting for the info dictionary from peers.
    DownloadingMetadata,
    /// Creating and preallocating files.
    Allocating,
    /// Hash checking what is already on disk.
    Verifying,
    Downloading,
    Seeding,
}

impl Status {
    /// Anything but Stopped.
    pub fn is_active(&self) -> bool {
        !matches!(self, Status::Stopped)
    }

    /// Peers may exchange payload in these states.
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Downloading | Status::Seeding)
    }
}

impl From<Status> for &'static str {
    fn from(val: Status) -> Self {
        use Status::*;
        match val {
            Stopped => "Stopped",
            DownloadingMetadata => "Downloading metadata",
            Allocating => "Allocating",
            Verifying => "Verifying",
            Downloading => "Downloading",
            Seeding => "Seeding",
        }
    }
}

/// Operations the embedding code can invoke on a running session. Each
/// carries its reply channel where a value returns.
#[derive(Debug)]
pub enum SessionMsg {
    /// Idempotent: a no-op when already started.
    Start,
    /// Idempotent: a no-op when already stopped.
    Stop,
    Stats(oneshot::Sender<SessionStats>),
    Trackers(oneshot::Sender<Vec<TrackerStats>>),
    Peers(oneshot::Sender<Vec<PeerStats>>),
    AddPeers(Vec<SocketAddr>),
    NotifyListen(oneshot::Sender<u16>),
    NotifyComplete(oneshot::Sender<()>),
    NotifyError(oneshot::Sender<Arc<Error>>),
    NotifyStop(oneshot::Sender<()>),
    SetResumer(Resumer),
    /// Stop if needed and end the session task.
    Close,
}

/// Everything workers report back into the session loop. Workers never touch
/// session state directly; these events are the only way in.
#[derive(Debug)]
pub enum SessionEvent {
    IncomingConn(TcpStream),
    HandshakeDone {
        addr: SocketAddr,
        direction: Direction,
        result: Result<Handshaken, Error>,
    },

    PeerDisconnected { addr: SocketAddr },
    PeerSnubbed { addr: SocketAddr },
    PeerChoked { addr: SocketAddr },
    PeerUnchoked { addr: SocketAddr },
    PeerInterested { addr: SocketAddr, interested: bool },
    PeerBitfield { addr: SocketAddr, bitfield: Bitfield },
    PeerHave { addr: SocketAddr, piece: u32 },
    PeerHaveAll { addr: SocketAddr },
    PeerHaveNone { addr: SocketAddr },

    /// The remote asked for a block (upload path).
    BlockRequested { addr: SocketAddr, info: BlockInfo },
    BlockRequestCancelled { addr: SocketAddr, info: BlockInfo },
    /// A disk read for the upload path finished.
    BlockRead { addr: SocketAddr, block: Block },

    ExtendedHandshake { addr: SocketAddr, ext: Extension },
    MetadataPiece { addr: SocketAddr, piece: u32, payload: Vec<u8> },
    MetadataRequest { addr: SocketAddr, piece: u32 },
    MetadataRejected { addr: SocketAddr, piece: u32 },

    TrackerAddrs(Vec<SocketAddr>),
    DhtAddrs(Vec<SocketAddr>),
    TrackerUpdate {
        url: String,
        seeders: u32,
        leechers: u32,
        error: Option<String>,
    },
    /// An announcer asks for the current byte counts.
    AnnounceData(oneshot::Sender<AnnounceData>),

    PieceWritten { index: u32, result: Result<(), Error> },

    AllocatorProgress { file: usize },
    /// Ok(true) when any file already held data, which forces a verify pass.
    AllocatorDone(Result<bool, Error>),
    VerifierProgress { piece: u32 },
    VerifierDone(Result<Bitfield, Error>),

    /// A web seed asks which piece to fetch next.
    WebSeedPick(oneshot::Sender<Option<u32>>),
    WebSeedPiece { index: u32, data: Vec<u8> },
    WebSeedError { url: String, error: String },
}

/// Byte counts reported to trackers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceData {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

/// Context shared with every worker the session spawns.
#[derive(Debug)]
pub struct SessionCtx {
    pub tx: mpsc::Sender<SessionMsg>,
    pub events: mpsc::Sender<SessionEvent>,
    /// Piece blocks travel on their own channel so the session can stop
    /// draining them while the writer pool is saturated.
    pub blocks: mpsc::Sender<(SocketAddr, Block)>,
    pub info_hash: InfoHash,
    pub local_id: PeerId,
    /// SHA1("req2" || info_hash), the value Message Stream Encryption peers
    /// identify a torrent by. Computed so encrypted handshakes can be
    /// recognized; the negotiation itself is not performed.
    pub skey_hash: [u8; 20],
    /// Torrent-level byte counters.
    pub counter: Counter,
}

/// Point-in-time snapshot of the torrent, built inside the loop so callers
/// need no locking.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub name: String,
    pub info_hash: InfoHash,
    pub status: &'static str,
    pub size: u64,
    pub piece_count: u32,
    pub have_pieces: u32,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub connected_peers: usize,
    pub idle_addrs: usize,
    pub last_error: Option<String>,
}

impl Display for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}/{} pieces, d: {} ({}/s) u: {} ({}/s), {} peers",
            self.name,
            self.status,
            self.have_pieces,
            self.piece_count,
            to_human_readable(self.downloaded as f64),
            to_human_readable(self.download_rate as f64),
            to_human_readable(self.uploaded as f64),
            to_human_readable(self.upload_rate as f64),
            self.connected_peers,
        )
    }
}

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub id: PeerId,
    pub direction: Direction,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub snubbed: bool,
    /// Strikes accumulated from hash failures and bad metadata.
    pub penalty: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TrackerStats {
    pub url: String,
    pub seeders: u32,
    pub leechers: u32,
    pub last_error: Option<String>,
}

/// The DHT lives outside this crate; the session talks to it through a pair
/// of channels. Announces go out, peer addresses come back.
#[derive(Debug)]
pub struct DhtHandle {
    pub announce: mpsc::Sender<(InfoHash, u16)>,
    pub peers: mpsc::Receiver<Vec<SocketAddr>>,
}
