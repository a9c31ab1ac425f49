// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod disk;
pub mod error;
mod ledger;
pub mod metainfo;
mod peer;
mod pipeline;
pub mod resume;
mod storage_info;
pub mod torrent;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;
pub use tracker::SwarmStats;

/// The index of a piece within the torrent.
///
/// The wire carries piece indices as 4 byte big endian integers; in memory
/// they are `usize` like any other Rust index.
pub type PieceIndex = usize;

/// The index of a file within the torrent's declared file list.
pub type FileIndex = usize;

/// The 20 byte identifier a client presents in handshakes and announces.
///
/// Conventions for picking one: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A 20 byte SHA-1 digest.
pub type Sha1Hash = [u8; 20];

/// Which pieces a peer (or we) can offer, one bit per piece.
///
/// Bits run from the most significant bit of the first byte: bit 0 of the
/// torrent is the high bit of byte 0, so `0b1100_0001` in a one byte field
/// marks pieces 0, 1 and 7 as present. This matches the wire encoding of
/// the bitfield message, hence the `Msb0` ordering.
pub type Bitfield = BitVec<Msb0, u8>;

/// The block size used for requests: the customary 16 KiB. Only a piece's
/// tail block may be shorter.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// Identifies one block, the request granularity of the peer protocol.
/// A piece is transferred as a run of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The piece this block belongs to.
    pub piece_index: PieceIndex,
    /// Where the block starts within its piece, in bytes.
    pub offset: u32,
    /// The block's length in bytes: `BLOCK_LEN`, or less for a tail block.
    pub len: u32,
}

/// Returns the length of the block at the given index within a piece.
///
/// Every block is `BLOCK_LEN` long except a piece's tail block, which only
/// covers whatever remains of the piece.
///
/// # Panics
///
/// Panics if the block offset implied by the index lies at or past the end
/// of the piece.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // round up so that a short tail still counts as a block of its own
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // a piece that divides evenly into whole blocks
    const EVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // a piece with a short tail left over after two whole blocks
    const TAIL_LEN: u32 = 234;
    const RAGGED_PIECE_LEN: u32 = 2 * BLOCK_LEN + TAIL_LEN;

    #[test]
    fn block_len_shortens_only_the_tail_block() {
        assert_eq!(block_len(EVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(EVEN_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(RAGGED_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(RAGGED_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(RAGGED_PIECE_LEN, 2), TAIL_LEN);
    }

    #[test]
    #[should_panic]
    fn block_len_rejects_index_past_piece_end() {
        block_len(EVEN_PIECE_LEN, 2);
    }

    #[test]
    fn block_count_rounds_the_tail_up() {
        assert_eq!(block_count(EVEN_PIECE_LEN), 2);
        assert_eq!(block_count(RAGGED_PIECE_LEN), 3);
        assert_eq!(block_count(TAIL_LEN), 1);
    }
}
