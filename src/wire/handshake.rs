//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Handshakes are only sent once at
//! the beginning of a connection, preceding all other messages; afterwards
//! the codec is switched to [`super::MessageCodec`], taking care not to
//! discard the underlying receive and send buffers.
use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::Reserved, peer::PeerId, session::InfoHash};

pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// Reserved bit advertising the extension protocol (BEP 10).
pub const RESERVED_EXTENSION_BIT: usize = 43;

/// Reserved bit advertising the fast extension (BEP 6).
pub const RESERVED_FAST_BIT: usize = 61;

/// The very first message exchanged. If the peer's protocol string or the
/// info hash differs from ours, the connection is severed.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = Reserved::ZERO;
        reserved.set(RESERVED_EXTENSION_BIT, true);
        reserved.set(RESERVED_FAST_BIT, true);

        Self {
            pstr_len: 19,
            pstr: PSTR,
            reserved: reserved.into_inner(),
            info_hash,
            peer_id,
        }
    }

    pub fn reserved_bits(&self) -> Reserved {
        Reserved::from(self.reserved)
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved_bits()[RESERVED_EXTENSION_BIT]
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved_bits()[RESERVED_FAST_BIT]
    }

    pub fn validate(&self, expected_info_hash: &InfoHash) -> bool {
        self.pstr_len == 19
            && self.pstr == PSTR
            && self.info_hash == *expected_info_hash
    }
}

/// The obfuscation key hash used by Message Stream Encryption to identify a
/// torrent during an encrypted handshake: SHA1("req2" || info_hash). The
/// value is computed so encrypted peers can be recognized; the negotiation
/// itself is not performed.
pub fn skey_hash(info_hash: &InfoHash) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(b"req2");
    hasher.update(&info_hash.0);
    hasher.finalize().into()
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        debug_assert_eq!(pstr_len, 19);
        debug_assert_eq!(pstr, PSTR);

        buf.put_u8(pstr.len() as u8);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the length prefix without advancing, the rest of the
        // handshake may not have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Handshake must start with \"BitTorrent protocol\"",
            ));
        }

        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: pstr.len() as u8,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}
