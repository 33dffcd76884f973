//! Decides which piece a given peer should download next.
use rand::seq::SliceRandom;

use crate::{bitfield::Bitfield, piece::Piece};

/// Piece selection policy, consulted inside the session loop. The picker
/// owns no piece state of its own, only the selection parameters and a
/// random permutation fixed at construction that breaks availability ties
/// the same way for the whole session.
#[derive(Debug)]
pub struct PiecePicker {
    /// The first pieces of the torrent are downloaded in order, to cut
    /// startup latency for consumers that read the file head first.
    sequential_head: u32,

    /// Below this many missing pieces, endgame mode begins.
    endgame_threshold: u32,

    /// How many peers may download the same piece during endgame.
    endgame_duplicates: u32,

    /// tie_break[piece] = position of the piece in the fixed permutation.
    tie_break: Vec<u32>,
}

impl PiecePicker {
    pub fn new(
        piece_count: u32,
        sequential_head: u32,
        endgame_threshold: u32,
        endgame_duplicates: u32,
    ) -> Self {
        let mut order: Vec<u32> = (0..piece_count).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut tie_break = vec![0u32; piece_count as usize];
        for (pos, &p) in order.iter().enumerate() {
            tie_break[p as usize] = pos as u32;
        }

        Self {
            sequential_head,
            endgame_threshold,
            endgame_duplicates,
            tie_break,
        }
    }

    /// Whether few enough pieces remain for duplicate requests.
    pub fn in_endgame(&self, local: &Bitfield) -> bool {
        let missing = local.len() - local.count_ones();
        (missing as u32) < self.endgame_threshold
    }

    pub fn endgame_duplicates(&self) -> u32 {
        self.endgame_duplicates
    }

    /// Pick the next piece for a peer, or None if the peer has nothing this
    /// client wants right now.
    ///
    /// Order of precedence: the sequential head in index order, then partial
    /// pieces, then rarest first. Pieces the peer lacks, pieces being
    /// written, and pieces at their assignment limit are skipped.
    pub fn pick(
        &self,
        pieces: &[Piece],
        remote: &Bitfield,
        endgame: bool,
    ) -> Option<u32> {
        let max_assigned = if endgame { self.endgame_duplicates } else { 1 };

        let mut best: Option<(u32, u32, u32)> = None; // (availability, tie, index)
        let mut best_partial: Option<(u32, u32, u32)> = None;
        let mut head: Option<u32> = None;

        for (i, piece) in pieces.iter().enumerate() {
            let i = i as u32;

            if !piece.missing()
                || piece.assigned >= max_assigned
                || remote.get(i as usize).map(|b| *b) != Some(true)
            {
                continue;
            }

            if i < self.sequential_head {
                head = match head {
                    Some(h) if h < i => Some(h),
                    _ => Some(i),
                };
                continue;
            }

            let key = (piece.availability, self.tie_break[i as usize], i);
            if piece.partial {
                if best_partial.map_or(true, |b| key < b) {
                    best_partial = Some(key);
                }
            } else if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }

        head.or(best_partial.map(|(_, _, i)| i))
            .or(best.map(|(_, _, i)| i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::BitfieldExt;

    fn pieces(availabilities: &[u32]) -> Vec<Piece> {
        availabilities
            .iter()
            .map(|&a| {
                let mut p = Piece::new([0u8; 20]);
                p.availability = a;
                p
            })
            .collect()
    }

    fn full_remote(n: usize) -> Bitfield {
        let mut b = Bitfield::from_piece_count(n);
        for i in 0..n {
            b.set(i, true);
        }
        b
    }

    #[test]
    fn picks_rarest_first() {
        let picker = PiecePicker::new(4, 0, 0, 3);
        let table = pieces(&[5, 2, 9, 2]);
        let remote = full_remote(4);

        let picked = picker.pick(&table, &remote, false).unwrap();
        // both rarity-2 pieces are valid, the permutation breaks the tie
        assert!(picked == 1 || picked == 3);

        // the same call picks the same piece: the permutation is stable
        assert_eq!(picker.pick(&table, &remote, false), Some(picked));
    }

    #[test]
    fn partial_pieces_win_over_rarer_ones() {
        let picker = PiecePicker::new(3, 0, 0, 3);
        let mut table = pieces(&[1, 9, 9]);
        table[2].partial = true;
        let remote = full_remote(3);

        assert_eq!(picker.pick(&table, &remote, false), Some(2));
    }

    #[test]
    fn sequential_head_goes_in_order() {
        let picker = PiecePicker::new(5, 2, 0, 3);
        let table = pieces(&[9, 9, 1, 1, 1]);
        let remote = full_remote(5);

        assert_eq!(picker.pick(&table, &remote, false), Some(0));
    }

    #[test]
    fn respects_constraints() {
        let picker = PiecePicker::new(3, 0, 0, 2);
        let mut table = pieces(&[1, 1, 1]);
        table[0].have = true;
        table[1].writing = true;
        let remote = full_remote(3);

        assert_eq!(picker.pick(&table, &remote, false), Some(2));

        table[2].assigned = 1;
        assert_eq!(picker.pick(&table, &remote, false), None);

        // endgame lifts the assignment limit up to the duplicate cap
        assert_eq!(picker.pick(&table, &remote, true), Some(2));
        table[2].assigned = 2;
        assert_eq!(picker.pick(&table, &remote, true), None);
    }

    #[test]
    fn skips_pieces_the_peer_lacks() {
        let picker = PiecePicker::new(2, 0, 0, 3);
        let table = pieces(&[1, 1]);
        let mut remote = Bitfield::from_piece_count(2);
        remote.set(1, true);

        assert_eq!(picker.pick(&table, &remote, false), Some(1));
    }

    #[test]
    fn endgame_threshold() {
        let picker = PiecePicker::new(10, 0, 3, 3);
        let mut local = Bitfield::from_piece_count(10);
        for i in 0..8 {
            local.set(i, true);
        }
        assert!(picker.in_endgame(&local));

        let mut local = Bitfield::from_piece_count(10);
        for i in 0..5 {
            local.set(i, true);
        }
        assert!(!picker.in_endgame(&local));
    }
}
