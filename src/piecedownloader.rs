//! The request pipeline binding one peer to one piece.
use std::net::SocketAddr;

use hashbrown::HashSet;

use crate::wire::{Block, BlockInfo, BLOCK_LEN};

/// What a received block did to the download.
#[derive(Debug, PartialEq)]
pub enum BlockReceipt {
    /// The block filled a gap; the piece is still incomplete.
    Accepted,
    /// The block was a duplicate or not part of this piece.
    Ignored,
    /// Every block arrived; take the buffer with [`PieceDownloader::take_buf`].
    Complete,
}

/// Downloads exactly one piece from exactly one peer, keeping a sliding
/// window of outstanding block requests and reassembling the piece buffer
/// as blocks arrive.
#[derive(Debug)]
pub struct PieceDownloader {
    pub addr: SocketAddr,
    pub index: u32,
    pub choked: bool,

    buf: Vec<u8>,
    blocks: Vec<BlockInfo>,
    received: Vec<bool>,
    /// Next entry of `blocks` that was never requested.
    cursor: usize,
    outstanding: HashSet<u32>,
    window: usize,
}

impl PieceDownloader {
    pub fn new(
        addr: SocketAddr,
        index: u32,
        piece_size: u32,
        window: usize,
    ) -> Self {
        let num_blocks = piece_size.div_ceil(BLOCK_LEN);
        let mut blocks = Vec::with_capacity(num_blocks as usize);
        for b in 0..num_blocks {
            let begin = b * BLOCK_LEN;
            let len = if b == num_blocks - 1 {
                piece_size - begin
            } else {
                BLOCK_LEN
            };
            blocks.push(BlockInfo { index, begin, len });
        }

        Self {
            addr,
            index,
            choked: false,
            buf: vec![0u8; piece_size as usize],
            received: vec![false; blocks.len()],
            blocks,
            cursor: 0,
            outstanding: HashSet::new(),
            window,
        }
    }

    /// Shrink the window, used when the peer snubbed us but is kept around.
    pub fn throttle(&mut self) {
        self.window = 1;
    }

    pub fn received_count(&self) -> usize {
        self.received.iter().filter(|r| **r).count()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_partial(&self) -> bool {
        self.received_count() > 0
    }

    /// Requests needed to fill the window, bounded by `budget`. The returned
    /// blocks are recorded as outstanding.
    pub fn next_requests(&mut self, budget: usize) -> Vec<BlockInfo> {
        if self.choked {
            return Vec::new();
        }

        let room = self
            .window
            .saturating_sub(self.outstanding.len())
            .min(budget);
        let mut out = Vec::with_capacity(room);

        while out.len() < room && self.cursor < self.blocks.len() {
            let block = self.blocks[self.cursor];
            self.cursor += 1;
            if self.received[(block.begin / BLOCK_LEN) as usize] {
                continue;
            }
            self.outstanding.insert(block.begin);
            out.push(block);
        }

        out
    }

    /// Record a received block, copying it into the piece buffer.
    pub fn block_received(&mut self, block: &Block) -> BlockReceipt {
        if block.index != self.index {
            return BlockReceipt::Ignored;
        }
        let slot = (block.begin / BLOCK_LEN) as usize;
        let Some(expected) = self.blocks.get(slot) else {
            return BlockReceipt::Ignored;
        };
        if expected.begin != block.begin
            || expected.len as usize != block.data.len()
            || self.received[slot]
        {
            return BlockReceipt::Ignored;
        }

        let begin = block.begin as usize;
        self.buf[begin..begin + block.data.len()].copy_from_slice(&block.data);
        self.received[slot] = true;
        self.outstanding.remove(&block.begin);

        if self.received.iter().all(|r| *r) {
            BlockReceipt::Complete
        } else {
            BlockReceipt::Accepted
        }
    }

    /// Blocks still awaited: outstanding requests plus everything never
    /// requested. Used to re-request after an unchoke and to hand the piece
    /// to another peer.
    pub fn pending(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.received[*i])
            .map(|(_, b)| *b)
            .collect()
    }

    /// Mark the peer as choking us. Outstanding requests are dropped; the
    /// remote will not answer them while choked (absent the fast extension).
    pub fn choke(&mut self) {
        self.choked = true;
        self.outstanding.clear();
        self.cursor = 0;
    }

    /// The peer unchoked us; the window refills from the pending blocks on
    /// the next `next_requests`.
    pub fn unchoke(&mut self) {
        self.choked = false;
    }

    /// The whole piece, once complete.
    pub fn take_buf(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn block(index: u32, begin: u32, len: u32) -> Block {
        Block { index, begin, data: vec![(begin % 251) as u8; len as usize] }
    }

    #[test]
    fn window_fills_and_slides() {
        // 5 blocks, window of 2
        let mut d = PieceDownloader::new(addr(), 0, BLOCK_LEN * 5, 2);

        let first = d.next_requests(usize::MAX);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].begin, 0);
        assert_eq!(first[1].begin, BLOCK_LEN);

        // full window, nothing more to request
        assert!(d.next_requests(usize::MAX).is_empty());

        assert_eq!(d.block_received(&block(0, 0, BLOCK_LEN)), BlockReceipt::Accepted);
        let refill = d.next_requests(usize::MAX);
        assert_eq!(refill.len(), 1);
        assert_eq!(refill[0].begin, 2 * BLOCK_LEN);
    }

    #[test]
    fn short_last_block_is_not_over_requested() {
        // 16384 + 100 bytes: the second block must be 100 bytes long
        let mut d = PieceDownloader::new(addr(), 3, BLOCK_LEN + 100, 10);

        let reqs = d.next_requests(usize::MAX);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1], BlockInfo { index: 3, begin: BLOCK_LEN, len: 100 });

        // a block of the wrong size is ignored
        assert_eq!(
            d.block_received(&block(3, BLOCK_LEN, 200)),
            BlockReceipt::Ignored
        );

        assert_eq!(d.block_received(&block(3, 0, BLOCK_LEN)), BlockReceipt::Accepted);
        assert_eq!(
            d.block_received(&block(3, BLOCK_LEN, 100)),
            BlockReceipt::Complete
        );
        assert_eq!(d.take_buf().len(), BLOCK_LEN as usize + 100);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut d = PieceDownloader::new(addr(), 0, BLOCK_LEN * 2, 10);
        d.next_requests(usize::MAX);

        assert_eq!(d.block_received(&block(0, 0, BLOCK_LEN)), BlockReceipt::Accepted);
        assert_eq!(d.block_received(&block(0, 0, BLOCK_LEN)), BlockReceipt::Ignored);
        // wrong piece index
        assert_eq!(d.block_received(&block(1, 0, BLOCK_LEN)), BlockReceipt::Ignored);
    }

    #[test]
    fn choke_then_unchoke_rerequests_pending() {
        let mut d = PieceDownloader::new(addr(), 0, BLOCK_LEN * 3, 3);
        d.next_requests(usize::MAX);
        d.block_received(&block(0, 0, BLOCK_LEN));

        d.choke();
        assert!(d.next_requests(usize::MAX).is_empty());
        assert_eq!(d.outstanding_count(), 0);

        d.unchoke();
        let reqs = d.next_requests(usize::MAX);
        // the received block is not requested again
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.begin != 0));
    }

    #[test]
    fn budget_caps_requests() {
        let mut d = PieceDownloader::new(addr(), 0, BLOCK_LEN * 5, 5);
        assert_eq!(d.next_requests(2).len(), 2);
        assert_eq!(d.next_requests(0).len(), 0);
    }

    #[test]
    fn assembled_buffer_matches_blocks() {
        let mut d = PieceDownloader::new(addr(), 0, 10, 10);
        d.next_requests(usize::MAX);
        let b = Block { index: 0, begin: 0, data: (0..10).collect() };
        assert_eq!(d.block_received(&b), BlockReceipt::Complete);
        assert_eq!(d.take_buf(), (0..10).collect::<Vec<u8>>());
    }
}
