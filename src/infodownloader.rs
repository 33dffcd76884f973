//! Metadata download state machine for magnet starts (BEP 9).
use std::net::SocketAddr;

use hashbrown::HashSet;
use sha1::{Digest, Sha1};

use crate::{extensions::METADATA_PIECE_LEN, session::InfoHash};

/// What a received metadata piece did to the download.
#[derive(Debug, PartialEq)]
pub enum MetadataReceipt {
    Accepted,
    Ignored,
    /// Every piece arrived; verify with [`InfoDownloader::verify`].
    Complete,
}

/// Fetches the info dictionary from a single peer in 16 KiB pieces with
/// sequential indices. The session keeps at most one of these per peer.
#[derive(Debug)]
pub struct InfoDownloader {
    pub addr: SocketAddr,
    /// The extension id the remote registered for `ut_metadata`.
    pub remote_ext_id: u8,

    total_size: u32,
    buf: Vec<u8>,
    received: Vec<bool>,
    cursor: u32,
    outstanding: HashSet<u32>,
    window: usize,
}

impl InfoDownloader {
    pub fn new(
        addr: SocketAddr,
        remote_ext_id: u8,
        total_size: u32,
        window: usize,
    ) -> Self {
        let pieces = total_size.div_ceil(METADATA_PIECE_LEN).max(1);
        Self {
            addr,
            remote_ext_id,
            total_size,
            buf: vec![0u8; total_size as usize],
            received: vec![false; pieces as usize],
            cursor: 0,
            outstanding: HashSet::new(),
            window,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Metadata piece indices to request next, in order, bounded by the
    /// window.
    pub fn next_requests(&mut self) -> Vec<u32> {
        let room = self.window.saturating_sub(self.outstanding.len());
        let mut out = Vec::with_capacity(room);

        while out.len() < room && self.cursor < self.piece_count() {
            let piece = self.cursor;
            self.cursor += 1;
            if self.received[piece as usize] {
                continue;
            }
            self.outstanding.insert(piece);
            out.push(piece);
        }

        out
    }

    /// The expected length of a metadata piece; the last one may be shorter.
    fn piece_len(&self, piece: u32) -> u32 {
        if piece == self.piece_count() - 1 {
            let rem = self.total_size % METADATA_PIECE_LEN;
            if rem == 0 {
                METADATA_PIECE_LEN
            } else {
                rem
            }
        } else {
            METADATA_PIECE_LEN
        }
    }

    pub fn piece_received(&mut self, piece: u32, data: &[u8]) -> MetadataReceipt {
        let Some(received) = self.received.get(piece as usize).copied() else {
            return MetadataReceipt::Ignored;
        };
        if received || data.len() as u32 != self.piece_len(piece) {
            return MetadataReceipt::Ignored;
        }

        let begin = (piece * METADATA_PIECE_LEN) as usize;
        self.buf[begin..begin + data.len()].copy_from_slice(data);
        self.received[piece as usize] = true;
        self.outstanding.remove(&piece);

        if self.received.iter().all(|r| *r) {
            MetadataReceipt::Complete
        } else {
            MetadataReceipt::Accepted
        }
    }

    /// SHA1 of the assembled dictionary must equal the torrent's info hash.
    /// On success the blob is returned; a mismatch returns the downloader's
    /// buffer to the caller for logging and discards nothing silently.
    pub fn verify(self, info_hash: &InfoHash) -> Result<Vec<u8>, ()> {
        let mut hasher = Sha1::new();
        hasher.update(&self.buf);
        let hash: [u8; 20] = hasher.finalize().into();

        if hash == info_hash.0 {
            Ok(self.buf)
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn sequential_requests_under_window() {
        let mut d =
            InfoDownloader::new(addr(), 2, METADATA_PIECE_LEN * 3 + 5, 2);
        assert_eq!(d.piece_count(), 4);

        assert_eq!(d.next_requests(), vec![0, 1]);
        assert_eq!(d.next_requests(), Vec::<u32>::new());

        let r = d.piece_received(0, &vec![0; METADATA_PIECE_LEN as usize]);
        assert_eq!(r, MetadataReceipt::Accepted);
        assert_eq!(d.next_requests(), vec![2]);
    }

    #[test]
    fn short_last_piece() {
        let mut d = InfoDownloader::new(addr(), 2, METADATA_PIECE_LEN + 7, 10);
        d.next_requests();

        // last piece must be exactly 7 bytes
        assert_eq!(
            d.piece_received(1, &vec![0; METADATA_PIECE_LEN as usize]),
            MetadataReceipt::Ignored
        );
        assert_eq!(d.piece_received(1, &[1; 7]), MetadataReceipt::Accepted);
        assert_eq!(
            d.piece_received(0, &vec![0; METADATA_PIECE_LEN as usize]),
            MetadataReceipt::Complete
        );
    }

    #[test]
    fn verify_rejects_wrong_blob() {
        let blob = b"d4:name5:hello12:piece lengthi16384ee".to_vec();
        let info_hash = {
            let mut hasher = Sha1::new();
            hasher.update(&blob);
            InfoHash(hasher.finalize().into())
        };

        let mut d = InfoDownloader::new(addr(), 2, blob.len() as u32, 10);
        d.next_requests();
        assert_eq!(d.piece_received(0, &blob), MetadataReceipt::Complete);
        assert!(d.verify(&info_hash).is_ok());

        let mut d = InfoDownloader::new(addr(), 2, blob.len() as u32, 10);
        d.next_requests();
        d.piece_received(0, &vec![9; blob.len()]);
        assert!(d.verify(&info_hash).is_err());
    }

    #[test]
    fn out_of_range_piece_is_ignored() {
        let mut d = InfoDownloader::new(addr(), 2, 100, 10);
        assert_eq!(d.piece_received(5, &[0; 10]), MetadataReceipt::Ignored);
    }
}
