use bitvec::prelude::*;

/* Piece sets are fixed-length bitsets over the torrent's pieces, bit i
corresponding to piece i. The high bit in the first byte is piece 0, matching
the wire order of the peer protocol bitfield message. */

pub type Bitfield = BitVec<u8, Msb0>;

#[derive(Clone, PartialEq, Eq)]
pub struct PieceSet {
    bits: Bitfield,
}

impl PieceSet {

    pub fn new(num_pieces: usize) -> Self {
        Self { bits: Bitfield::repeat(false, num_pieces) }
    }

    pub fn full(num_pieces: usize) -> Self {
        let mut bits = Bitfield::repeat(true, num_pieces);
        bits.set_uninitialized(false);
        Self { bits }
    }

    // Builds a set from MSB-first bytes, as found in a bitfield message.
    // Spare bits past num_pieces are discarded.
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Self {
        assert!(
            bytes.len() * 8 >= num_pieces,
            "bitstring too short for {} pieces", num_pieces,
        );
        let mut bits = Bitfield::from_vec(bytes.to_vec());
        bits.truncate(num_pieces);
        bits.set_uninitialized(false);
        Self { bits }
    }

    pub fn from_bitfield(mut bits: Bitfield) -> Self {
        bits.set_uninitialized(false);
        Self { bits }
    }

    // MSB-first bytes, spare bits in the last byte zeroed.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.as_raw_slice().to_vec()
    }

    // Number of pieces the set ranges over, not the number contained.
    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn contains(&self, piece: usize) -> bool {
        piece < self.bits.len() && self.bits[piece]
    }

    pub fn insert(&mut self, piece: usize) {
        assert!(piece < self.bits.len(), "piece {} out of range", piece);
        self.bits.set(piece, true);
    }

    pub fn remove(&mut self, piece: usize) {
        assert!(piece < self.bits.len(), "piece {} out of range", piece);
        self.bits.set(piece, false);
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn union(&self, other: &PieceSet) -> PieceSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    // Set operations work a byte at a time. Both operands must range over the
    // same number of pieces; spare bits are zero on both sides.
    pub fn union_with(&mut self, other: &PieceSet) {
        self.check_len(other);
        for (a, b) in self.bits.as_raw_mut_slice().iter_mut().zip(other.bits.as_raw_slice()) {
            *a |= b;
        }
    }

    pub fn intersection(&self, other: &PieceSet) -> PieceSet {
        self.check_len(other);
        let mut out = self.clone();
        for (a, b) in out.bits.as_raw_mut_slice().iter_mut().zip(other.bits.as_raw_slice()) {
            *a &= b;
        }
        out
    }

    // Pieces in self but not in other.
    pub fn difference(&self, other: &PieceSet) -> PieceSet {
        self.check_len(other);
        let mut out = self.clone();
        for (a, b) in out.bits.as_raw_mut_slice().iter_mut().zip(other.bits.as_raw_slice()) {
            *a &= !b;
        }
        out
    }

    pub fn is_subset(&self, other: &PieceSet) -> bool {
        self.check_len(other);
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .all(|(a, b)| a & !b == 0)
    }

    fn check_len(&self, other: &PieceSet) {
        assert_eq!(
            self.bits.len(),
            other.bits.len(),
            "piece set length mismatch",
        );
    }
}

impl std::fmt::Debug for PieceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PieceSet {{ {}/{} }}", self.count(), self.capacity())
    }
}

// Pieces covering any byte of [from, from + size), as a set over all
// ceil(total_len / piece_len) pieces of the torrent. A file ending mid-piece
// claims that piece; the next file claims it again, so boundary pieces belong
// to both.
pub fn byte_mask(from: u64, size: u64, piece_len: u64, total_len: u64) -> PieceSet {

    assert!(piece_len >= 1, "piece length must be positive");
    assert!(piece_len <= total_len, "piece length exceeds torrent length");
    assert!(from + size <= total_len, "byte range exceeds torrent length");

    let num_pieces = ((total_len + piece_len - 1) / piece_len) as usize;
    let mut mask = PieceSet::new(num_pieces);
    if size == 0 {
        return mask;
    }

    let before = (from / piece_len) as usize;
    let to = from + size;

    // Bytes in the partial pieces at either end. For a range inside a single
    // piece, left and right overlap and middle goes one whole piece negative.
    let left = (piece_len - from % piece_len) % piece_len;
    let right = to % piece_len;
    let middle = size as i64 - left as i64 - right as i64;
    assert_eq!(
        middle % piece_len as i64, 0,
        "interior of byte range not piece aligned",
    );

    let spanned = (middle / piece_len as i64
        + i64::from(left > 0)
        + i64::from(right > 0)) as usize;
    assert!(before + spanned <= num_pieces, "mask spans past the last piece");

    mask.bits[before..before + spanned].fill(true);
    mask
}
