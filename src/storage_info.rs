//! Storage-related details about a torrent's single output file, derived
//! from its metainfo.

use std::path::PathBuf;

use crate::{metainfo::Metainfo, PieceIndex};

/// Information about a torrent's storage details: piece count and length,
/// download length, and where the output file lives.
///
/// Single file torrents only: unlike the teacher's `FsStructure` enum, there
/// is no archive/multi-file variant here (§1 Non-goals).
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than `piece_len`
    /// if the download length isn't an exact multiple of it.
    pub last_piece_len: u32,
    /// The length of the torrent's single file.
    pub download_len: u64,
    /// The path of the output file.
    pub path: PathBuf,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.download_len();
        let piece_len = metainfo.info.piece_length as u32;
        let remainder = download_len % piece_len as u64;
        let last_piece_len = if remainder == 0 {
            piece_len
        } else {
            remainder as u32
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            path: download_dir.join(&metainfo.info.name),
        }
    }

    /// Returns the length of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        assert!(
            index < self.piece_count,
            "piece index {} out of bounds",
            index
        );
        if index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }
}
