//! Wrapper types around bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during the handshake.
pub type Reserved = BitArray<[u8; 8], Msb0>;

pub trait BitfieldExt {
    /// A zeroed bitfield with one bit per piece.
    fn from_piece_count(pieces: usize) -> Bitfield;

    /// Set a bit without panicking when the index is out of bounds.
    fn safe_set(&mut self, index: usize);
}

impl BitfieldExt for Bitfield {
    fn from_piece_count(pieces: usize) -> Bitfield {
        let mut b = Bitfield::from_vec(vec![0u8; pieces.div_ceil(8)]);
        b.truncate(pieces);
        b
    }

    fn safe_set(&mut self, index: usize) {
        if index < self.len() {
            self.set(index, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece_count_len() {
        let b = Bitfield::from_piece_count(10);
        assert_eq!(b.len(), 10);
        assert_eq!(b.count_ones(), 0);

        let b = Bitfield::from_piece_count(8);
        assert_eq!(b.len(), 8);
    }

    #[test]
    fn safe_set_ignores_out_of_bounds() {
        let mut b = Bitfield::from_piece_count(3);
        b.safe_set(2);
        b.safe_set(9);
        assert_eq!(b.count_ones(), 1);
        assert!(b[2]);
    }

    #[test]
    fn wire_roundtrip_keeps_high_bits() {
        // the wire form pads to a whole byte, piece 0 is the MSB of byte 0
        let mut b = Bitfield::from_piece_count(10);
        b.set(0, true);
        b.set(9, true);

        let v = b.clone().into_vec();
        assert_eq!(v, vec![0b1000_0000, 0b0100_0000]);

        let mut back = Bitfield::from_vec(v);
        back.truncate(10);
        assert_eq!(back, b);
    }
}
