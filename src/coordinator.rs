//! The download coordinator: the single source of truth for which pieces
//! are missing, in progress, or done, and for where downloaded data is
//! written on disk.
//!
//! There is one coordinator per torrent, shared by all peer sessions behind
//! an `Arc<RwLock<_>>`. Peer sessions never write to disk or track piece
//! state themselves; they only ask the coordinator what to request next and
//! hand it whatever blocks arrive.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    time::{Duration, Instant},
};

use crate::{
    error::{DiskError, Result},
    metainfo::Metainfo,
    piece::{self, Piece},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex,
};

/// Identifies a peer session to the coordinator. Assigned by
/// [`Coordinator::add_peer`] and unrelated to the BitTorrent wire peer id.
pub type SessionId = u64;

/// A block request the coordinator has handed out to a peer, along with when
/// it was issued, so that it can be re-issued if it never completes.
struct PendingRequest {
    session: SessionId,
    info: BlockInfo,
    requested_at: Instant,
}

struct Peer {
    bitfield: Bitfield,
}

/// Owns a torrent's download state and its output file.
pub struct Coordinator {
    storage: StorageInfo,
    file: File,
    missing_pieces: Vec<Piece>,
    ongoing_pieces: Vec<Piece>,
    have_piece_count: usize,
    pending_blocks: Vec<PendingRequest>,
    peers: std::collections::HashMap<SessionId, Peer>,
    next_session_id: SessionId,
    max_pending_request_time: Duration,
}

impl Coordinator {
    /// Builds the full piece list from the torrent's metainfo and opens (or
    /// creates) the output file at `storage.path`.
    pub fn new(
        metainfo: &Metainfo,
        storage: StorageInfo,
        max_pending_request_time: Duration,
    ) -> Result<Self> {
        if let Some(parent) = storage.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_output_file(&storage.path)?;
        file.set_len(storage.download_len)?;

        let missing_pieces = piece::make_pieces(
            storage.piece_count,
            storage.piece_len,
            storage.last_piece_len,
            |index| metainfo.piece_hash(index),
        );

        Ok(Self {
            storage,
            file,
            missing_pieces,
            ongoing_pieces: Vec::new(),
            have_piece_count: 0,
            pending_blocks: Vec::new(),
            peers: std::collections::HashMap::new(),
            next_session_id: 0,
            max_pending_request_time,
        })
    }

    /// Registers a new peer session along with the bitfield it announced
    /// (or an all-zero bitfield if it sent none), returning the session id
    /// the caller should use for subsequent calls.
    pub fn add_peer(&mut self, bitfield: Bitfield) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.peers.insert(id, Peer { bitfield });
        id
    }

    /// Updates a single bit of a peer's bitfield in response to a `Have`
    /// message.
    pub fn update_peer_piece(&mut self, session: SessionId, index: PieceIndex) {
        if let Some(peer) = self.peers.get_mut(&session) {
            if index < peer.bitfield.len() {
                peer.bitfield.set(index, true);
            }
        }
    }

    /// Returns true once every piece has been downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.have_piece_count == self.storage.piece_count
    }

    /// The number of bytes downloaded and verified so far.
    pub fn bytes_downloaded(&self) -> u64 {
        if self.have_piece_count == 0 {
            return 0;
        }
        if self.have_piece_count == self.storage.piece_count {
            return self.storage.download_len;
        }
        self.have_piece_count as u64 * self.storage.piece_len as u64
    }

    /// We never seed, so nothing is ever uploaded.
    pub fn bytes_uploaded(&self) -> u64 {
        0
    }

    /// Bytes remaining to satisfy a tracker announce's `left` parameter.
    pub fn bytes_left(&self) -> u64 {
        self.storage.download_len - self.bytes_downloaded()
    }

    /// Returns the next block to request on behalf of `session`, or `None`
    /// if there is currently nothing this peer can usefully be asked for.
    ///
    /// Tries, in order: re-issuing a request that has been pending longer
    /// than `max_pending_request_time`, requesting the next block of a
    /// piece that is already in progress, and finally starting a new piece.
    pub fn next_request(&mut self, session: SessionId) -> Option<BlockInfo> {
        if !self.peers.contains_key(&session) {
            return None;
        }
        self.next_expired_request(session)
            .or_else(|| self.next_ongoing_request(session))
            .or_else(|| self.next_missing_request(session))
    }

    fn peer_has(&self, session: SessionId, index: PieceIndex) -> bool {
        self.peers
            .get(&session)
            .map(|peer| peer.bitfield.get(index).map(|b| *b).unwrap_or(false))
            .unwrap_or(false)
    }

    fn next_expired_request(&mut self, session: SessionId) -> Option<BlockInfo> {
        let now = Instant::now();
        let max_age = self.max_pending_request_time;

        let mut position = None;
        for (i, request) in self.pending_blocks.iter().enumerate() {
            if self.peer_has(session, request.info.piece_index)
                && now.duration_since(request.requested_at) > max_age
            {
                position = Some(i);
                break;
            }
        }
        let position = position?;

        let request = &mut self.pending_blocks[position];
        log::info!(
            "re-requesting block {:?} (pending too long)",
            request.info
        );
        request.session = session;
        request.requested_at = now;
        Some(request.info)
    }

    fn next_ongoing_request(&mut self, session: SessionId) -> Option<BlockInfo> {
        for piece in &mut self.ongoing_pieces {
            if self.peers.get(&session).map(|p| p.bitfield.get(piece.index).map(|b| *b).unwrap_or(false)).unwrap_or(false) {
                if let Some(info) = piece.next_request() {
                    self.pending_blocks.push(PendingRequest {
                        session,
                        info,
                        requested_at: Instant::now(),
                    });
                    return Some(info);
                }
            }
        }
        None
    }

    fn next_missing_request(&mut self, session: SessionId) -> Option<BlockInfo> {
        let position = self
            .missing_pieces
            .iter()
            .position(|piece| self.peer_has(session, piece.index))?;
        let mut piece = self.missing_pieces.remove(position);
        let info = piece.next_request();
        self.ongoing_pieces.push(piece);
        if let Some(info) = info {
            self.pending_blocks.push(PendingRequest {
                session,
                info,
                requested_at: Instant::now(),
            });
        }
        info
    }

    /// Records a received block, completing and verifying its piece if this
    /// was the last missing block. On successful verification the piece is
    /// written to disk; on a hash mismatch it is reset back to missing.
    pub fn on_block_complete(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!("received block piece={} offset={}", piece_index, offset);
        self.pending_blocks
            .retain(|r| !(r.info.piece_index == piece_index && r.info.offset == offset));

        let position = match self
            .ongoing_pieces
            .iter()
            .position(|p| p.index == piece_index)
        {
            Some(position) => position,
            None => {
                log::debug!("piece {} isn't ongoing, dropping block", piece_index);
                return Ok(());
            }
        };

        self.ongoing_pieces[position].block_received(offset, data);
        if !self.ongoing_pieces[position].is_complete() {
            return Ok(());
        }

        let piece = self.ongoing_pieces.remove(position);
        if piece.is_valid() {
            self.write_piece(&piece)?;
            self.have_piece_count += 1;
            log::info!(
                "piece {} complete ({}/{})",
                piece.index,
                self.have_piece_count,
                self.storage.piece_count
            );
        } else {
            log::warn!("piece {} failed hash check, discarding", piece.index);
            let mut piece = piece;
            piece.reset();
            self.ongoing_pieces.push(piece);
        }
        Ok(())
    }

    fn write_piece(&self, piece: &Piece) -> Result<()> {
        if piece.index >= self.storage.piece_count {
            return Err(DiskError::InvalidPieceIndex(piece.index).into());
        }
        let offset = piece.index as u64 * self.storage.piece_len as u64;
        self.file
            .write_at(&piece.data(), offset)
            .map_err(DiskError::from)?;
        Ok(())
    }

    /// Flushes the output file to disk.
    pub fn close(&self) -> Result<()> {
        self.file.sync_all().map_err(DiskError::from)?;
        Ok(())
    }
}

fn open_output_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use super::*;
    use bitvec::prelude::{BitVec, Msb0};

    fn bitfield(piece_count: usize, has: &[usize]) -> Bitfield {
        let mut bits: BitVec<Msb0, u8> = BitVec::repeat(false, piece_count);
        for &i in has {
            bits.set(i, true);
        }
        bits
    }

    fn test_coordinator(dir: &Path) -> Coordinator {
        // two pieces, 4 bytes each, no short last piece, single byte hashes
        // of all-zero data don't matter here since tests don't validate the
        // full pipeline through metainfo.
        let storage = StorageInfo {
            piece_count: 2,
            piece_len: 4,
            last_piece_len: 4,
            download_len: 8,
            path: dir.join("out.bin"),
        };
        let pieces = piece::make_pieces(2, 4, 4, |_| [0u8; 20]);
        let file = open_output_file(&storage.path).unwrap();
        file.set_len(storage.download_len).unwrap();
        Coordinator {
            storage,
            file,
            missing_pieces: pieces,
            ongoing_pieces: Vec::new(),
            have_piece_count: 0,
            pending_blocks: Vec::new(),
            peers: std::collections::HashMap::new(),
            next_session_id: 0,
            max_pending_request_time: Duration::from_secs(300),
        }
    }

    #[test]
    fn next_request_prefers_ongoing_piece_before_starting_a_new_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = test_coordinator(dir.path());
        let session = coordinator.add_peer(bitfield(2, &[0, 1]));

        let first = coordinator.next_request(session).unwrap();
        assert_eq!(first.piece_index, 0);
        assert_eq!(coordinator.ongoing_pieces.len(), 1);
        assert_eq!(coordinator.missing_pieces.len(), 1);

        // piece 0 only has one block (4 bytes == one block), so the next
        // request must come from starting piece 1, not piece 0 again.
        let second = coordinator.next_request(session).unwrap();
        assert_eq!(second.piece_index, 1);
    }

    #[test]
    fn next_request_returns_none_if_peer_has_nothing_useful() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = test_coordinator(dir.path());
        let session = coordinator.add_peer(bitfield(2, &[]));
        assert_eq!(coordinator.next_request(session), None);
    }

    #[test]
    fn on_block_complete_writes_piece_and_tracks_completion() {
        use sha1::{Digest, Sha1};

        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = test_coordinator(dir.path());
        let data = vec![1u8, 2, 3, 4];
        let hash: crate::Sha1Hash = Sha1::digest(&data).as_slice().try_into().unwrap();
        coordinator.missing_pieces[0].expected_hash = hash;

        let session = coordinator.add_peer(bitfield(2, &[0]));
        let block = coordinator.next_request(session).unwrap();
        assert_eq!(block.piece_index, 0);

        coordinator
            .on_block_complete(0, block.offset, data.clone())
            .unwrap();

        assert!(!coordinator.is_complete());
        assert_eq!(coordinator.bytes_downloaded(), 4);

        let mut on_disk = vec![0u8; 4];
        coordinator.file.read_at(&mut on_disk, 0).unwrap();
        assert_eq!(on_disk, data);
    }

    #[test]
    fn on_block_complete_resets_piece_on_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = test_coordinator(dir.path());
        coordinator.missing_pieces[0].expected_hash = [0xffu8; 20];

        let session = coordinator.add_peer(bitfield(2, &[0]));
        let block = coordinator.next_request(session).unwrap();
        coordinator
            .on_block_complete(0, block.offset, vec![1, 2, 3, 4])
            .unwrap();

        assert_eq!(coordinator.have_piece_count, 0);
        assert_eq!(coordinator.ongoing_pieces.len(), 1);
        assert!(!coordinator.ongoing_pieces[0].is_complete());
    }
}
