//! The block/piece bookkeeping that the download coordinator drives: each
//! piece is split into fixed-size blocks, blocks are requested one at a
//! time, and a piece is verified against its expected SHA-1 hash once all
//! its blocks have arrived.

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash};

/// The state of a single block within a piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    Missing,
    Pending,
    Retrieved,
}

/// A fixed size chunk of a piece, along with its current download status and,
/// once retrieved, its data.
#[derive(Clone, Debug)]
pub(crate) struct Block {
    pub info: BlockInfo,
    pub status: BlockStatus,
    pub data: Vec<u8>,
}

impl Block {
    fn new(info: BlockInfo) -> Self {
        Self {
            info,
            status: BlockStatus::Missing,
            data: Vec::new(),
        }
    }
}

/// A piece of the torrent: an ordered list of blocks and the expected SHA-1
/// hash of their concatenation.
#[derive(Clone, Debug)]
pub(crate) struct Piece {
    pub index: PieceIndex,
    pub blocks: Vec<Block>,
    pub expected_hash: Sha1Hash,
}

impl Piece {
    /// Marks every block in the piece as missing again, discarding any data
    /// received so far. Used when a completed piece fails hash verification.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.status = BlockStatus::Missing;
            block.data.clear();
        }
    }

    /// Returns the info of the first missing block, marking it pending, or
    /// `None` if there is no missing block left to request.
    pub fn next_request(&mut self) -> Option<BlockInfo> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Missing)?;
        block.status = BlockStatus::Pending;
        Some(block.info)
    }

    /// Records a block's data as retrieved. Blocks for offsets that don't
    /// exist in this piece are silently ignored.
    pub fn block_received(&mut self, offset: u32, data: Vec<u8>) {
        if let Some(block) = self.blocks.iter_mut().find(|b| b.info.offset == offset) {
            block.status = BlockStatus::Retrieved;
            block.data = data;
        } else {
            log::warn!(
                "received block at offset {} that doesn't belong to piece {}",
                offset,
                self.index
            );
        }
    }

    /// Returns true iff every block in the piece has been retrieved.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.status == BlockStatus::Retrieved)
    }

    /// Concatenates the piece's block data in offset order.
    pub fn data(&self) -> Vec<u8> {
        let mut blocks: Vec<&Block> = self.blocks.iter().collect();
        blocks.sort_by_key(|b| b.info.offset);
        blocks.into_iter().flat_map(|b| b.data.clone()).collect()
    }

    /// Returns true iff the concatenated block data's SHA-1 digest matches
    /// the expected hash from the metainfo.
    ///
    /// # Panics
    ///
    /// Panics if called before the piece is complete.
    pub fn is_valid(&self) -> bool {
        debug_assert!(self.is_complete());
        let digest = Sha1::digest(&self.data());
        digest.as_slice() == self.expected_hash
    }
}

/// Builds the full list of a torrent's pieces, splitting each into blocks of
/// [`crate::BLOCK_LEN`] bytes (the last block of the last piece may be
/// shorter).
pub(crate) fn make_pieces(
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
    hash_at: impl Fn(PieceIndex) -> Sha1Hash,
) -> Vec<Piece> {
    (0..piece_count)
        .map(|index| {
            let len = if index == piece_count - 1 {
                last_piece_len
            } else {
                piece_len
            };
            let blocks = (0..block_count(len))
                .map(|block_index| {
                    let offset = block_index as u32 * crate::BLOCK_LEN;
                    Block::new(BlockInfo {
                        piece_index: index,
                        offset,
                        len: block_len(len, block_index),
                    })
                })
                .collect();
            Piece {
                index,
                blocks,
                expected_hash: hash_at(index),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use super::*;

    fn info(piece_index: PieceIndex, offset: u32, len: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len,
        }
    }

    #[test]
    fn next_request_walks_blocks_in_order_then_stops() {
        let mut piece = Piece {
            index: 0,
            blocks: vec![
                Block::new(info(0, 0, 16384)),
                Block::new(info(0, 16384, 16384)),
            ],
            expected_hash: [0; 20],
        };

        assert_eq!(piece.next_request(), Some(info(0, 0, 16384)));
        assert_eq!(piece.next_request(), Some(info(0, 16384, 16384)));
        assert_eq!(piece.next_request(), None);
    }

    #[test]
    fn completes_and_validates_against_expected_hash() {
        let data = b"hello world, this is piece data".to_vec();
        let expected_hash: Sha1Hash = Sha1::digest(&data).as_slice().try_into().unwrap();

        let mut piece = Piece {
            index: 0,
            blocks: vec![Block::new(info(0, 0, data.len() as u32))],
            expected_hash,
        };

        assert!(!piece.is_complete());
        piece.next_request();
        piece.block_received(0, data);
        assert!(piece.is_complete());
        assert!(piece.is_valid());
    }

    #[test]
    fn reset_discards_progress_after_hash_mismatch() {
        let mut piece = Piece {
            index: 0,
            blocks: vec![Block::new(info(0, 0, 4))],
            expected_hash: [0xff; 20],
        };
        piece.next_request();
        piece.block_received(0, vec![1, 2, 3, 4]);
        assert!(piece.is_complete());
        assert!(!piece.is_valid());

        piece.reset();
        assert!(!piece.is_complete());
        assert_eq!(piece.next_request(), Some(info(0, 0, 4)));
    }

    #[test]
    fn make_pieces_shortens_last_piece_and_its_last_block() {
        // piece_len = 32768 (2 blocks of 16384), last piece is 20000 bytes
        // (1 full block of 16384 + a short block of 3616).
        let pieces = make_pieces(2, 32768, 20000, |_| [0; 20]);
        assert_eq!(pieces.len(), 2);

        assert_eq!(pieces[0].blocks.len(), 2);
        assert_eq!(pieces[0].blocks[0].info.len, 16384);
        assert_eq!(pieces[0].blocks[1].info.len, 16384);

        assert_eq!(pieces[1].blocks.len(), 2);
        assert_eq!(pieces[1].blocks[0].info.len, 16384);
        assert_eq!(pieces[1].blocks[1].info.len, 3616);
    }
}
