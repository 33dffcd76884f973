//! The peer wire protocol: message types and the length-prefixed codec.
//!
//! Covers the BEP 3 message set, the BEP 6 fast-extension messages and the
//! BEP 10 extended message frame. The handshake has its own codec in
//! [`handshake`] because it is the only unframed exchange on the wire.
pub mod handshake;

pub use handshake::{skey_hash, Handshake, HandshakeCodec};

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::Bitfield, error::Error};

/// Blocks are the transfer unit between peers. All but the trailing block of
/// a piece have this size.
pub const BLOCK_LEN: u32 = 16384;

/// Identifies a block within a torrent: piece index, offset within the piece
/// and length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub len: u32,
}

impl BlockInfo {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}

/// A block carrying its payload, the body of a `Piece` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index,
            begin: self.begin,
            len: self.data.len() as u32,
        }
    }
}

/// An extended-protocol frame: the remote extension id and the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Port(u16),
    // BEP 6 fast extension
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    AllowedFast(u32),
    // BEP 10 extension protocol
    Extended(ExtendedMessage),
}

/// The wire IDs of the [`Message`] variants.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Piece as u8 => Ok(Piece),
            k if k == Cancel as u8 => Ok(Cancel),
            k if k == Port as u8 => Ok(Port),
            k if k == Suggest as u8 => Ok(Suggest),
            k if k == HaveAll as u8 => Ok(HaveAll),
            k if k == HaveNone as u8 => Ok(HaveNone),
            k if k == Reject as u8 => Ok(Reject),
            k if k == AllowedFast as u8 => Ok(AllowedFast),
            k if k == Extended as u8 => Ok(Extended),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Unknown message id",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                block.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                buf.put_u32(1 + 8 + block.data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.put(&block.data[..]);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                block.encode(buf);
            }
            // <len=0003><id=9><listen-port>
            Message::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Suggest(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Suggest as u8);
                buf.put_u32(piece);
            }
            Message::HaveAll => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveAll as u8);
            }
            Message::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveNone as u8);
            }
            Message::Reject(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Reject as u8);
                block.encode(buf);
            }
            Message::AllowedFast(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::AllowedFast as u8);
                buf.put_u32(piece);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Message::Extended(ExtendedMessage(ext_id, payload)) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the length header must be present before anything can be framed
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length without consuming it, the whole message may not
        // have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let msg_len = tmp_buf.get_u32() as usize;

        if buf.remaining() < 4 + msg_len {
            return Ok(None);
        }
        buf.advance(4);

        // a zero length frame is a keep alive
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg_id = MessageId::try_from(buf.get_u8())?;

        // the length prefix comes straight off the wire; a frame too short
        // for its own payload must error out before any buffer math runs
        let len_ok = match msg_id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested
            | MessageId::HaveAll
            | MessageId::HaveNone => msg_len == 1,
            MessageId::Have
            | MessageId::Suggest
            | MessageId::AllowedFast => msg_len == 5,
            MessageId::Request | MessageId::Cancel | MessageId::Reject => {
                msg_len == 13
            }
            MessageId::Port => msg_len == 3,
            MessageId::Bitfield => msg_len >= 1,
            MessageId::Piece => msg_len >= 9,
            MessageId::Extended => msg_len >= 2,
        };
        if !len_ok {
            return Err(Error::ProtocolViolation);
        }

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have(buf.get_u32()),
            MessageId::Bitfield => {
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo { index, begin, len })
            }
            MessageId::Piece => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let mut data = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut data);
                Message::Piece(Block { index, begin, data })
            }
            MessageId::Cancel => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo { index, begin, len })
            }
            MessageId::Port => Message::Port(buf.get_u16()),
            MessageId::Suggest => Message::Suggest(buf.get_u32()),
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Reject => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Reject(BlockInfo { index, begin, len })
            }
            MessageId::AllowedFast => Message::AllowedFast(buf.get_u32()),
            MessageId::Extended => {
                let ext_id = buf.get_u8();
                let mut payload = vec![0u8; msg_len - 2];
                buf.copy_to_slice(&mut payload);
                Message::Extended(ExtendedMessage(ext_id, payload))
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::BitfieldExt;
    use bytes::{Buf, BufMut, BytesMut};

    fn roundtrip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        MessageCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn request() {
        let info = BlockInfo { index: 3, begin: BLOCK_LEN, len: BLOCK_LEN };
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Request(info), &mut buf).unwrap();

        assert_eq!(buf.len(), 17);
        assert_eq!(buf.get_u32(), 13);
        assert_eq!(buf.get_u8(), MessageId::Request as u8);
        assert_eq!(buf.get_u32(), 3);
        assert_eq!(buf.get_u32(), BLOCK_LEN);
        assert_eq!(buf.get_u32(), BLOCK_LEN);

        assert_eq!(roundtrip(Message::Request(info)), Message::Request(info));
    }

    #[test]
    fn piece() {
        let block = Block { index: 0, begin: 0, data: vec![7; 5] };
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Piece(block.clone()), &mut buf).unwrap();

        assert_eq!(buf.get_u32(), 9 + 5);
        assert_eq!(buf.get_u8(), MessageId::Piece as u8);

        match roundtrip(Message::Piece(block.clone())) {
            Message::Piece(b) => assert_eq!(b, block),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn bitfield() {
        let mut original = Bitfield::from_piece_count(10);
        original.set(8, true);
        original.set(9, true);

        match roundtrip(Message::Bitfield(original.clone())) {
            Message::Bitfield(mut b) => {
                // the wire form pads to a whole byte
                b.truncate(original.len());
                assert_eq!(b, original);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn fast_extension_messages() {
        assert_eq!(roundtrip(Message::HaveAll), Message::HaveAll);
        assert_eq!(roundtrip(Message::HaveNone), Message::HaveNone);
        assert_eq!(roundtrip(Message::Suggest(9)), Message::Suggest(9));
        assert_eq!(roundtrip(Message::AllowedFast(1)), Message::AllowedFast(1));

        let info = BlockInfo { index: 1, begin: 0, len: 100 };
        assert_eq!(roundtrip(Message::Reject(info)), Message::Reject(info));
    }

    #[test]
    fn extended() {
        let msg = Message::Extended(ExtendedMessage(0, vec![b'd', b'e']));
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(buf.get_u32(), 4);
        assert_eq!(buf.get_u8(), MessageId::Extended as u8);
        assert_eq!(buf.get_u8(), 0);

        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn keep_alive_and_partial_frames() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        );

        // a partial frame decodes to None and consumes nothing
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Have(7), &mut buf).unwrap();
        let mut partial = buf.split_to(6);
        assert!(MessageCodec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 6);
    }

    #[test]
    fn bogus_length_prefixes_error_instead_of_panicking() {
        // a Piece frame whose length cannot hold index and begin
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(MessageId::Piece as u8);
        assert!(MessageCodec.decode(&mut buf).is_err());

        // an Extended frame with no room for the extension id
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(MessageId::Extended as u8);
        assert!(MessageCodec.decode(&mut buf).is_err());

        // a Have frame with a truncated payload
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(MessageId::Have as u8);
        assert!(MessageCodec.decode(&mut buf).is_err());

        // a Request frame padded past its fixed layout
        let mut buf = BytesMut::new();
        buf.put_u32(14);
        buf.put_u8(MessageId::Request as u8);
        buf.extend_from_slice(&[0u8; 13]);
        assert!(MessageCodec.decode(&mut buf).is_err());
    }
}
