use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    peer::PeerMsg,
    session::{SessionEvent, SessionMsg},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error when reading magnet link")]
    MagnetError(#[from] magnet_url::MagnetError),

    #[error("The magnet link does not carry an info hash")]
    MagnetNoInfoHash,

    #[error("The torrent has no usable tracker")]
    NoTracker,

    #[error("String is not UTF-8")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("Failed to decode or encode a bencode buffer")]
    BencodeError,

    #[error("Error when serializing or deserializing a packet")]
    SpeedyError(#[from] speedy::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took too long to send the handshake")]
    HandshakeTimeout,

    #[error("The handshake carries a different info hash")]
    HandshakeInfoHashMismatch,

    #[error("The peer closed the connection")]
    PeerClosedSocket,

    #[error("The peer sent a message that violates the protocol")]
    ProtocolViolation,

    #[error("The peer went silent with requests outstanding")]
    PeerIdle,

    #[error("The downloaded piece does not match its expected hash")]
    PieceInvalid,

    #[error("The downloaded metadata does not match the info hash")]
    MetadataInvalid,

    #[error("The tracker sent an invalid response")]
    TrackerResponse,

    #[error("The tracker's compact peer list is malformed")]
    TrackerCompactPeerList,

    #[error("Could not reach the tracker's UDP socket")]
    TrackerSocketConnect,

    #[error("Could not connect to any tracker")]
    TrackerNoHosts,

    #[error(
        "Could not open the file `{0}`. Make sure the program has permission \
         to access it"
    )]
    FileOpen(String),

    #[error("A block offset falls outside every file of the torrent")]
    OffsetOutOfBounds,

    #[error("The storage backend is unusable: {0}")]
    StorageUnusable(String),

    #[error("Failed to persist the resume snapshot: {0}")]
    ResumeWrite(String),

    #[error("Web seed request failed: {0}")]
    WebSeed(String),

    #[error("The session is shutting down")]
    SessionClosed,

    #[error("Could not send a message to the session")]
    SendErrorSession(#[from] mpsc::error::SendError<SessionMsg>),

    #[error("Could not send an event to the session")]
    SendErrorEvent(#[from] Box<mpsc::error::SendError<SessionEvent>>),

    #[error("Could not send a message to a peer")]
    SendErrorPeer(#[from] mpsc::error::SendError<PeerMsg>),

    #[error("Could not receive a reply from a oneshot channel")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}

impl From<bendy::decoding::Error> for Error {
    fn from(_: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}
