use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use speedy::{BigEndian, Readable, Writable};

use crate::{error::Error, peer::PeerId, session::InfoHash};

use super::{action::Action, event::Event};

/// The announce packet of BEP 15. 98 bytes on the wire.
#[derive(Debug, Clone)]
pub struct Request {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: Event,
    pub ip_address: u32,
    pub key: u32,
    pub num_want: u32,
    pub port: u16,
}

impl Request {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(98);
        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&(Action::Announce as u32).to_be_bytes());
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf.extend_from_slice(&self.info_hash.0);
        buf.extend_from_slice(&self.peer_id.0);
        buf.extend_from_slice(&self.downloaded.to_be_bytes());
        buf.extend_from_slice(&self.left.to_be_bytes());
        buf.extend_from_slice(&self.uploaded.to_be_bytes());
        buf.extend_from_slice(&(self.event as u32).to_be_bytes());
        buf.extend_from_slice(&self.ip_address.to_be_bytes());
        buf.extend_from_slice(&self.key.to_be_bytes());
        buf.extend_from_slice(&self.num_want.to_be_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }
}

#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

impl Response {
    pub(crate) const MIN_LEN: usize = 20;

    /// Split the fixed header from the compact peer list that trails it.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Self::MIN_LEN {
            return Err(Error::TrackerResponse);
        }

        let res =
            Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::MIN_LEN])?;

        Ok((res, &buf[Self::MIN_LEN..]))
    }
}

/// Parse a BEP 23 compact peer list: 6 bytes per peer for v4, 18 for v6.
pub fn parse_compact_peer_list(
    buf: &[u8],
    is_ipv6: bool,
) -> Result<Vec<SocketAddr>, Error> {
    let stride = if is_ipv6 { 18 } else { 6 };

    let chunks = buf.chunks_exact(stride);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    let mut peers = Vec::new();
    for hostport in chunks {
        let (ip, port) = hostport.split_at(stride - 2);
        let ip = if is_ipv6 {
            let octets: [u8; 16] =
                ip.try_into().expect("chunk bounds are checked");
            IpAddr::from(Ipv6Addr::from(octets))
        } else {
            IpAddr::from(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
        };
        let port = u16::from_be_bytes(
            port.try_into().expect("chunk bounds are checked"),
        );
        peers.push((ip, port).into());
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_98_bytes() {
        let req = Request {
            connection_id: 1,
            transaction_id: 2,
            info_hash: InfoHash([3u8; 20]),
            peer_id: PeerId([4u8; 20]),
            downloaded: 5,
            left: 6,
            uploaded: 7,
            event: Event::Started,
            ip_address: 0,
            key: 8,
            num_want: 50,
            port: 6881,
        };
        let buf = req.serialize();

        assert_eq!(buf.len(), 98);
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[80..84], &(Event::Started as u32).to_be_bytes());
        assert_eq!(&buf[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn compact_v4_list() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[127, 0, 0, 1]);
        buf.extend_from_slice(&6881u16.to_be_bytes());
        buf.extend_from_slice(&[10, 0, 0, 2]);
        buf.extend_from_slice(&51413u16.to_be_bytes());

        let peers = parse_compact_peer_list(&buf, false).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:51413".parse().unwrap(),
            ]
        );

        // a truncated list is an error
        buf.pop();
        assert!(parse_compact_peer_list(&buf, false).is_err());
    }

    #[test]
    fn response_header_splits_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&9u32.to_be_bytes());
        buf.extend_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&12u32.to_be_bytes());
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);

        let (res, payload) = Response::deserialize(&buf).unwrap();
        assert_eq!(res.interval, 1800);
        assert_eq!(res.seeders, 12);
        assert_eq!(payload.len(), 6);
    }
}
