use std::{
    fmt::Display,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex,
    },
};

use hashbrown::HashSet;
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    counter::Counter,
    wire::{BlockInfo, Message},
};

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generate a peer id in Azureus style: client tag and version, then
    /// random alphanumerics.
    pub fn gen() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-SQ0010-");
        for b in peer_id.iter_mut().skip(8) {
            *b = rand::thread_rng().sample(Alphanumeric);
        }
        PeerId(peer_id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("A peer id has exactly 20 bytes");
        }
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&value);
        Ok(PeerId(buf))
    }
}

/// Who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The local client dialed the peer.
    Outbound,
    /// The peer dialed the local client.
    Inbound,
}

/// Messages the session sends to a peer task.
#[derive(Debug)]
pub enum PeerMsg {
    /// Forward a raw message to the wire.
    Send(Message),

    /// Put these block requests on the wire and track them as outstanding.
    RequestBlocks(Vec<BlockInfo>),

    /// Announce a verified piece. The peer task deduplicates haves.
    Have(u32),

    /// Withdraw an earlier request.
    Cancel(BlockInfo),

    Choke,
    Unchoke,
    Interested,
    NotInterested,

    /// Leave the swarm cleanly.
    Shutdown,
}

/// State shared between the peer task and the session. The session reads the
/// atomics when ranking peers for unchoking; the peer task keeps them
/// current as wire messages arrive.
#[derive(Debug)]
pub struct PeerCtx {
    pub tx: mpsc::Sender<PeerMsg>,

    /// Id the remote sent in its handshake.
    pub id: PeerId,

    pub remote_addr: SocketAddr,

    pub direction: Direction,

    /// Negotiated during the handshake.
    pub supports_fast: bool,
    pub supports_extension_protocol: bool,

    /// We forbid the peer to download.
    pub am_choking: AtomicBool,
    /// We want pieces the peer has.
    pub am_interested: AtomicBool,
    /// The peer forbids us to download.
    pub peer_choking: AtomicBool,
    /// The peer wants pieces we have.
    pub peer_interested: AtomicBool,

    /// The peer has an outstanding request and went silent past the timeout.
    pub snubbed: AtomicBool,

    /// Strikes against the peer: hash failures, bogus metadata.
    pub penalty: AtomicU32,

    pub counter: Counter,

    /// Cancels that could not be queued; the peer task consults this before
    /// putting a request on the wire, so a cancel supersedes its request
    /// even when the outbox was full.
    pub(crate) cancelled: Mutex<HashSet<BlockInfo>>,
}

impl PeerCtx {
    pub(crate) fn new(
        tx: mpsc::Sender<PeerMsg>,
        id: PeerId,
        remote_addr: SocketAddr,
        direction: Direction,
        supports_fast: bool,
        supports_extension_protocol: bool,
    ) -> Self {
        Self {
            tx,
            id,
            remote_addr,
            direction,
            supports_fast,
            supports_extension_protocol,
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            snubbed: AtomicBool::new(false),
            penalty: AtomicU32::new(0),
            counter: Counter::new(),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    /// Queue a message for the peer without ever blocking the caller. When
    /// the outbox is backed up, messages are shed by type: requests coalesce
    /// (the next window fill re-issues them), haves deduplicate on the peer
    /// side, cancels supersede their queued request through the cancel set.
    pub fn send(&self, msg: PeerMsg) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => match msg {
                PeerMsg::Cancel(info) => {
                    self.cancelled.lock().unwrap().insert(info);
                }
                PeerMsg::RequestBlocks(_)
                | PeerMsg::Have(_)
                | PeerMsg::Send(Message::KeepAlive) => {}
                // control messages matter; the channel is sized so that this
                // retry has room once the reader drains a slot
                other => {
                    let _ = self.tx.try_send(other);
                }
            },
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn bump_penalty(&self) -> u32 {
        self.penalty.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix() {
        let id = PeerId::gen();
        assert_eq!(&id.0[..8], b"-SQ0010-");
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(PeerId::gen(), PeerId::gen());
    }

    #[tokio::test]
    async fn full_outbox_sheds_by_type() {
        let (tx, mut rx) = mpsc::channel(1);
        let ctx = PeerCtx::new(
            tx,
            PeerId::gen(),
            "127.0.0.1:6881".parse().unwrap(),
            Direction::Outbound,
            true,
            true,
        );

        ctx.send(PeerMsg::Have(1));
        // the channel is full now; a have is dropped, a cancel is remembered
        ctx.send(PeerMsg::Have(2));
        let info = BlockInfo { index: 0, begin: 0, len: 16384 };
        ctx.send(PeerMsg::Cancel(info));

        assert!(ctx.cancelled.lock().unwrap().contains(&info));
        assert!(matches!(rx.recv().await, Some(PeerMsg::Have(1))));
        assert!(rx.try_recv().is_err());
    }
}
