use speedy::{BigEndian, Readable, Writable};

use crate::error::Error;

use super::action::Action;

#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    pub protocol_id: u64,
    pub action: Action,
    pub transaction_id: u32,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub(crate) const LENGTH: usize = 16;
    const MAGIC: u64 = 0x41727101980;

    pub fn new() -> Self {
        Self {
            protocol_id: Self::MAGIC,
            action: Action::Connect,
            transaction_id: rand::random::<u32>(),
        }
    }

    pub fn serialize(&self) -> [u8; Self::LENGTH] {
        let mut buf = [0u8; Self::LENGTH];
        buf[..8].copy_from_slice(&Self::MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&(self.action as u32).to_be_bytes());
        buf[12..16].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf
    }
}

#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Response {
    pub(crate) const LENGTH: usize = 16;

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LENGTH {
            return Err(Error::TrackerResponse);
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LENGTH])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let req = Request::new();
        let buf = req.serialize();

        assert_eq!(&buf[..8], &Request::MAGIC.to_be_bytes());
        assert_eq!(&buf[8..12], &0u32.to_be_bytes());
        assert_eq!(&buf[12..16], &req.transaction_id.to_be_bytes());
    }

    #[test]
    fn response_roundtrip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&77u32.to_be_bytes());
        buf.extend_from_slice(&0xdead_beefu64.to_be_bytes());

        let res = Response::deserialize(&buf).unwrap();
        assert_eq!(res.action, 0);
        assert_eq!(res.transaction_id, 77);
        assert_eq!(res.connection_id, 0xdead_beef);
    }
}
