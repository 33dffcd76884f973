//! Performs the peer handshake in both directions and hands back a framed
//! connection ready for the message protocol.
use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::{
    bitfield::Reserved,
    error::Error,
    peer::{Direction, PeerId},
    session::InfoHash,
    wire::{Handshake, HandshakeCodec, MessageCodec},
};

/// The product of a successful handshake: the socket reframed for the
/// message protocol plus everything negotiated on the way.
#[derive(Debug)]
pub struct Handshaken {
    pub socket: Framed<TcpStream, MessageCodec>,
    pub addr: SocketAddr,
    pub id: PeerId,
    pub reserved: Reserved,
    pub direction: Direction,
}

/// Dial a peer and run the outgoing handshake: ours first, then theirs.
pub async fn outgoing(
    addr: SocketAddr,
    info_hash: InfoHash,
    local_id: PeerId,
    limit: Duration,
) -> Result<Handshaken, Error> {
    timeout(limit, async move {
        let socket = TcpStream::connect(addr).await?;
        handshake(socket, addr, info_hash, local_id, Direction::Outbound).await
    })
    .await
    .map_err(|_| Error::HandshakeTimeout)?
}

/// Run the incoming handshake on an accepted connection: read theirs first,
/// match the info hash against the torrent, then answer.
pub async fn incoming(
    socket: TcpStream,
    info_hash: InfoHash,
    local_id: PeerId,
    limit: Duration,
) -> Result<Handshaken, Error> {
    let addr = socket.peer_addr()?;
    timeout(limit, async move {
        handshake(socket, addr, info_hash, local_id, Direction::Inbound).await
    })
    .await
    .map_err(|_| Error::HandshakeTimeout)?
}

async fn handshake(
    socket: TcpStream,
    addr: SocketAddr,
    info_hash: InfoHash,
    local_id: PeerId,
    direction: Direction,
) -> Result<Handshaken, Error> {
    let mut socket = Framed::new(socket, HandshakeCodec);
    let ours = Handshake::new(info_hash.clone(), local_id.clone());

    if direction == Direction::Outbound {
        debug!("{addr} sending the first handshake");
        socket.send(ours.clone()).await?;
    }

    let Some(Ok(theirs)) = socket.next().await else {
        warn!("{addr} did not send a handshake");
        return Err(Error::HandshakeInvalid);
    };

    if !theirs.validate(&info_hash) {
        warn!("{addr} handshake is invalid or for another torrent");
        return Err(if theirs.info_hash != info_hash {
            Error::HandshakeInfoHashMismatch
        } else {
            Error::HandshakeInvalid
        });
    }

    // a connection to ourselves is useless
    if theirs.peer_id == local_id {
        return Err(Error::HandshakeInvalid);
    }

    if direction == Direction::Inbound {
        debug!("{addr} answering the inbound handshake");
        socket.send(ours).await?;
    }

    let reserved = theirs.reserved_bits();

    // switch codecs without dropping bytes already buffered
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let socket = Framed::from_parts(new_parts);

    Ok(Handshaken { socket, addr, id: theirs.peer_id, reserved, direction })
}
