//! The piece ledger: the single shared authority on which pieces are
//! verified, which are in flight, and what reaches the disk.
//!
//! The ledger's in-memory maps are guarded by one mutex that is only held
//! while the maps are mutated. Hashing a piece and writing it to disk are
//! long running operations and happen outside the critical section, on the
//! blocking thread pool, so they never stall other sessions.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};

use crate::{
    disk, error::*, storage_info::StorageInfo, Bitfield, PieceIndex, Sha1Hash,
};

pub(crate) type AlertSender = mpsc::UnboundedSender<LedgerAlert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<LedgerAlert>;

/// The alerts the ledger sends to the supervisor.
#[derive(Debug)]
pub(crate) enum LedgerAlert {
    /// A piece was verified and written to disk.
    PieceCompleted {
        index: PieceIndex,
        downloaded: usize,
        total: usize,
    },
    /// Every piece of the torrent is verified and on disk.
    DownloadComplete,
    /// A piece could not be written to disk. Fatal to the download.
    WriteFailure(String),
}

/// The result of committing an assembled piece.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum CommitOutcome {
    /// The piece hashed correctly and is on disk.
    Verified,
    /// The piece's digest did not match the metainfo. The claim was dropped
    /// so the piece may be claimed again, by any session.
    HashMismatch,
}

struct LedgerState {
    /// One bit per piece; a set bit means the piece is verified and on disk.
    verified: Bitfield,
    /// Pieces currently being fetched by some session. Disjoint from the
    /// verified set at every stable point, and never persisted.
    claimed: HashSet<PieceIndex>,
    /// Always equals the number of set bits in `verified`.
    downloaded: usize,
}

pub(crate) struct PieceLedger {
    storage: Arc<StorageInfo>,
    /// The expected digest of each piece, in piece order.
    piece_hashes: Vec<Sha1Hash>,
    state: Mutex<LedgerState>,
    alert_chan: AlertSender,
}

impl PieceLedger {
    pub fn new(
        storage: Arc<StorageInfo>,
        piece_hashes: Vec<Sha1Hash>,
        alert_chan: AlertSender,
    ) -> Self {
        debug_assert_eq!(piece_hashes.len(), storage.piece_count);
        let piece_count = storage.piece_count;
        Self {
            storage,
            piece_hashes,
            state: Mutex::new(LedgerState {
                verified: Bitfield::repeat(false, piece_count),
                claimed: HashSet::new(),
                downloaded: 0,
            }),
            alert_chan,
        }
    }

    /// Seeds the ledger from a previous session's snapshot. Only called
    /// before any worker is started.
    pub fn restore(&self, verified_pieces: &[bool]) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.claimed.is_empty());
        for (index, verified) in verified_pieces
            .iter()
            .enumerate()
            .take(self.storage.piece_count)
        {
            if *verified && !state.verified[index] {
                state.verified.set(index, true);
                state.downloaded += 1;
            }
        }
    }

    /// Atomically claims up to `max` pieces that the peer has and that are
    /// neither verified nor already in flight, in ascending index order.
    ///
    /// Two concurrent callers can never be handed the same index; a claimed
    /// index stays unavailable until it is committed or released.
    pub fn claim_batch(
        &self,
        available: &Bitfield,
        max: usize,
    ) -> Vec<PieceIndex> {
        let mut state = self.state.lock().unwrap();
        let mut batch = Vec::new();
        for index in 0..self.storage.piece_count.min(available.len()) {
            if batch.len() == max {
                break;
            }
            if available[index]
                && !state.verified[index]
                && !state.claimed.contains(&index)
            {
                state.claimed.insert(index);
                batch.push(index);
            }
        }
        batch
    }

    /// Verifies an assembled piece against its expected digest and, on a
    /// match, writes it into the file layout and marks it verified.
    ///
    /// Whatever the outcome, the piece's claim is settled: a mismatching or
    /// unwritable piece becomes claimable again. A disk failure is also
    /// reported to the supervisor, as it is fatal to the download.
    pub async fn commit(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<CommitOutcome> {
        if index >= self.storage.piece_count {
            return Err(Error::InvalidPieceIndex);
        }
        let expected_hash = self.piece_hashes[index];
        let storage = Arc::clone(&self.storage);

        // hash and write off the executor; the ledger lock is not held here
        let write_result = task::spawn_blocking(move || -> Result<CommitOutcome> {
            let digest = Sha1::digest(&data);
            if digest.as_slice() != expected_hash {
                log::warn!("Piece {} is NOT valid", index);
                return Ok(CommitOutcome::HashMismatch);
            }
            disk::write_piece(&storage, index, &data)?;
            Ok(CommitOutcome::Verified)
        })
        .await
        .expect("disk IO write task panicked");

        match write_result {
            Ok(CommitOutcome::Verified) => {
                let (downloaded, total) = {
                    let mut state = self.state.lock().unwrap();
                    state.claimed.remove(&index);
                    debug_assert!(!state.verified[index]);
                    state.verified.set(index, true);
                    state.downloaded += 1;
                    (state.downloaded, self.storage.piece_count)
                };
                self.alert_chan
                    .send(LedgerAlert::PieceCompleted {
                        index,
                        downloaded,
                        total,
                    })
                    .map_err(|_| Error::ChannelClosed)?;
                if downloaded == total {
                    self.alert_chan
                        .send(LedgerAlert::DownloadComplete)
                        .map_err(|_| Error::ChannelClosed)?;
                }
                Ok(CommitOutcome::Verified)
            }
            Ok(CommitOutcome::HashMismatch) => {
                self.state.lock().unwrap().claimed.remove(&index);
                Ok(CommitOutcome::HashMismatch)
            }
            Err(e) => {
                self.state.lock().unwrap().claimed.remove(&index);
                let _ = self
                    .alert_chan
                    .send(LedgerAlert::WriteFailure(e.to_string()));
                Err(e)
            }
        }
    }

    /// Returns the given claims without committing them, making the pieces
    /// claimable again. Used when a session dies or is choked mid-batch.
    pub fn release(&self, indices: &[PieceIndex]) {
        if indices.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for index in indices {
            state.claimed.remove(index);
        }
    }

    /// Returns whether the peer advertising this availability has any piece
    /// that is not yet verified.
    pub fn has_needed(&self, available: &Bitfield) -> bool {
        let state = self.state.lock().unwrap();
        (0..self.storage.piece_count.min(available.len()))
            .any(|index| available[index] && !state.verified[index])
    }

    /// The number of verified pieces and the total piece count.
    pub fn progress(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.downloaded, self.storage.piece_count)
    }

    pub fn is_complete(&self) -> bool {
        let (downloaded, total) = self.progress();
        downloaded == total
    }

    /// The number of payload bytes verified so far, accounting for a short
    /// last piece.
    pub fn downloaded_bytes(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let mut bytes = state.downloaded as u64 * self.storage.piece_len as u64;
        let last = self.storage.piece_count - 1;
        if state.verified[last] {
            bytes = bytes - self.storage.piece_len as u64
                + self.storage.last_piece_len as u64;
        }
        bytes
    }

    /// The number of payload bytes still missing, as reported to trackers.
    pub fn left_bytes(&self) -> u64 {
        self.storage.download_len - self.downloaded_bytes()
    }

    /// A copy of the verified flags and their count, for the resume store.
    pub fn snapshot(&self) -> (Vec<bool>, usize) {
        let state = self.state.lock().unwrap();
        let verified =
            (0..self.storage.piece_count).map(|i| state.verified[i]).collect();
        (verified, state.downloaded)
    }
}

/// The claims a download batch still holds. Settled claims are removed one
/// by one; whatever remains when the guard is dropped is released, so a
/// failed, choked or cancelled session can never strand a claim.
pub(crate) struct ClaimGuard {
    ledger: Arc<PieceLedger>,
    pending: Vec<PieceIndex>,
}

impl ClaimGuard {
    pub fn new(ledger: Arc<PieceLedger>, pending: Vec<PieceIndex>) -> Self {
        Self { ledger, pending }
    }

    /// The next unsettled claim, in the order they were made.
    pub fn first(&self) -> Option<PieceIndex> {
        self.pending.first().copied()
    }

    /// Marks a claim as settled by the ledger (committed or rejected), so
    /// that dropping the guard no longer releases it.
    pub fn settle(&mut self, index: PieceIndex) {
        self.pending.retain(|pending| *pending != index);
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.ledger.release(&self.pending);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::FileInfo;

    fn test_ledger(
        download_dir: PathBuf,
        content: &[u8],
        piece_len: u32,
    ) -> (Arc<PieceLedger>, AlertReceiver) {
        let piece_count = (content.len() + piece_len as usize - 1)
            / piece_len as usize;
        let piece_hashes: Vec<Sha1Hash> = content
            .chunks(piece_len as usize)
            .map(|piece| {
                let digest = Sha1::digest(piece);
                let mut hash = [0; 20];
                hash.copy_from_slice(&digest);
                hash
            })
            .collect();
        let storage = Arc::new(StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: (content.len()
                - piece_len as usize * (piece_count - 1))
                as u32,
            download_len: content.len() as u64,
            download_dir: download_dir.clone(),
            files: vec![FileInfo {
                path: download_dir.join("payload.bin"),
                len: content.len() as u64,
                torrent_offset: 0,
            }],
        });
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        (
            Arc::new(PieceLedger::new(storage, piece_hashes, alert_chan)),
            alert_port,
        )
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 239) as u8).collect()
    }

    fn all_available(piece_count: usize) -> Bitfield {
        Bitfield::repeat(true, piece_count)
    }

    #[test]
    fn test_claims_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(10 * 1024);
        let (ledger, _alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);
        let available = all_available(10);

        let first = ledger.claim_batch(&available, 4);
        let second = ledger.claim_batch(&available, 30);
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(second, vec![4, 5, 6, 7, 8, 9]);
        // everything is claimed now
        assert!(ledger.claim_batch(&available, 30).is_empty());
    }

    #[test]
    fn test_concurrent_claimers_never_share_a_piece() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(64 * 1024);
        let (ledger, _alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);
        let piece_count = 64;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                let available = all_available(piece_count);
                let mut claimed = Vec::new();
                loop {
                    let batch = ledger.claim_batch(&available, 3);
                    if batch.is_empty() {
                        return claimed;
                    }
                    claimed.extend(batch);
                }
            }));
        }

        let mut all: Vec<PieceIndex> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<PieceIndex> = (0..piece_count).collect();
        assert_eq!(all, expected, "a piece was claimed twice");
    }

    #[test]
    fn test_release_makes_pieces_claimable_again() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(4 * 1024);
        let (ledger, _alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);
        let available = all_available(4);

        let batch = ledger.claim_batch(&available, 2);
        ledger.release(&batch);
        assert_eq!(ledger.claim_batch(&available, 4), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_commit_verifies_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(2500);
        let (ledger, mut alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);
        let available = all_available(3);

        let batch = ledger.claim_batch(&available, 3);
        assert_eq!(batch.len(), 3);
        // the last piece is short: 2500 - 2048 bytes
        for index in batch {
            let start = index * 1024;
            let end = (start + 1024).min(content.len());
            let outcome = ledger
                .commit(index, content[start..end].to_vec())
                .await
                .unwrap();
            assert_eq!(outcome, CommitOutcome::Verified);
        }

        assert_eq!(ledger.progress(), (3, 3));
        assert!(ledger.is_complete());
        assert_eq!(ledger.downloaded_bytes(), 2500);
        assert_eq!(ledger.left_bytes(), 0);
        assert_eq!(
            std::fs::read(dir.path().join("payload.bin")).unwrap(),
            content
        );

        // three per-piece alerts followed by the completion alert
        for _ in 0..3 {
            match alerts.recv().await.unwrap() {
                LedgerAlert::PieceCompleted { total, .. } => {
                    assert_eq!(total, 3)
                }
                alert => panic!("unexpected alert: {:?}", alert),
            }
        }
        assert!(matches!(
            alerts.recv().await.unwrap(),
            LedgerAlert::DownloadComplete
        ));
    }

    #[tokio::test]
    async fn test_commit_rejects_wrong_hash() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(2048);
        let (ledger, _alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);
        let available = all_available(2);

        let batch = ledger.claim_batch(&available, 1);
        assert_eq!(batch, vec![0]);
        let outcome =
            ledger.commit(0, vec![0xff; 1024]).await.unwrap();
        assert_eq!(outcome, CommitOutcome::HashMismatch);
        assert_eq!(ledger.progress().0, 0);

        // the piece is claimable again and commits fine with correct bytes,
        // as if fetched from another peer
        let batch = ledger.claim_batch(&available, 1);
        assert_eq!(batch, vec![0]);
        let outcome = ledger
            .commit(0, content[..1024].to_vec())
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Verified);
        assert_eq!(ledger.progress().0, 1);
    }

    #[tokio::test]
    async fn test_downloaded_count_matches_verified_popcount() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(4096);
        let (ledger, _alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);
        let available = all_available(4);

        ledger.claim_batch(&available, 4);
        for index in &[2usize, 0] {
            ledger
                .commit(*index, content[index * 1024..][..1024].to_vec())
                .await
                .unwrap();
        }

        let (verified, downloaded) = ledger.snapshot();
        assert_eq!(downloaded, 2);
        assert_eq!(
            verified.iter().filter(|bit| **bit).count(),
            downloaded
        );
        assert_eq!(verified, vec![true, false, true, false]);
    }

    #[test]
    fn test_restore_seeds_verified_set() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(4096);
        let (ledger, _alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);

        ledger.restore(&[true, false, true, false]);
        assert_eq!(ledger.progress(), (2, 4));
        // verified pieces are not claimable
        assert_eq!(ledger.claim_batch(&all_available(4), 30), vec![1, 3]);
    }

    #[test]
    fn test_claim_guard_releases_unsettled_claims() {
        let dir = tempfile::tempdir().unwrap();
        let content = content(4096);
        let (ledger, _alerts) =
            test_ledger(dir.path().to_path_buf(), &content, 1024);
        let available = all_available(4);

        let batch = ledger.claim_batch(&available, 4);
        let mut guard = ClaimGuard::new(Arc::clone(&ledger), batch);
        guard.settle(0);
        guard.settle(1);
        drop(guard);

        // 0 and 1 were settled by their commits (simulated), 2 and 3 went
        // back to the pool
        assert_eq!(ledger.claim_batch(&available, 4), vec![2, 3]);
    }
}
