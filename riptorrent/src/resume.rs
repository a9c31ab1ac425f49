//! Persistence of download progress between runs.
//!
//! The snapshot lives as a small JSON file next to the payload, in the
//! torrent's own download directory. It records which pieces are verified;
//! in-flight claims are deliberately ephemeral and never persisted.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};

use crate::{error::*, storage_info::StorageInfo, Sha1Hash};

/// The name of the snapshot file inside the torrent's download directory.
pub const RESUME_FILE_NAME: &str = "resume.json";

/// A snapshot of a download, enough to resume it without re-hashing what is
/// already on disk.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResumeRecord {
    /// Hex encoded info hash identifying the torrent this record belongs to.
    pub info_hash: String,
    pub piece_length: u32,
    pub total_pieces: usize,
    /// The number of verified pieces.
    pub downloaded: usize,
    /// The declared length of each file, in declared order.
    pub file_sizes: Vec<u64>,
    /// Unix timestamp of when the snapshot was taken.
    pub mtime: i64,
    /// One flag per piece, in piece order.
    pub verified_pieces: Vec<bool>,
    /// ISO-8601 UTC timestamp of the last activity.
    pub last_active: String,
}

impl ResumeRecord {
    /// Snapshots the current ledger state for the given torrent.
    pub(crate) fn new(
        info_hash: &Sha1Hash,
        storage: &StorageInfo,
        verified_pieces: Vec<bool>,
        downloaded: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            info_hash: hex::encode(info_hash),
            piece_length: storage.piece_len,
            total_pieces: storage.piece_count,
            downloaded,
            file_sizes: storage.files.iter().map(|file| file.len).collect(),
            mtime: now.timestamp(),
            verified_pieces,
            last_active: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

fn resume_file_path(download_dir: &Path) -> PathBuf {
    download_dir.join(RESUME_FILE_NAME)
}

/// Loads the resume record for the torrent, if one exists.
///
/// Returns `Ok(None)` both when there is no resume file and when the file
/// belongs to a different torrent. A file that exists but cannot be parsed
/// is an error, surfaced at startup.
pub(crate) fn load(
    download_dir: &Path,
    info_hash: &Sha1Hash,
) -> Result<Option<ResumeRecord>> {
    let path = resume_file_path(download_dir);
    let contents = match fs::read(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record: ResumeRecord = serde_json::from_slice(&contents)?;
    if record.info_hash != hex::encode(info_hash) {
        log::warn!(
            "Resume file {:?} belongs to a different torrent",
            path
        );
        return Ok(None);
    }
    Ok(Some(record))
}

/// Persists the record atomically: it is written to a temporary file first
/// and then renamed over the previous snapshot, so a crash mid-write can
/// never leave a truncated resume file behind.
pub(crate) fn persist(
    download_dir: &Path,
    record: &ResumeRecord,
) -> Result<()> {
    fs::create_dir_all(download_dir)?;
    let path = resume_file_path(download_dir);
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, serde_json::to_vec_pretty(record)?)?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileInfo;
    use pretty_assertions::assert_eq;

    fn test_storage(download_dir: PathBuf) -> StorageInfo {
        StorageInfo {
            piece_count: 3,
            piece_len: 16384,
            last_piece_len: 7232,
            download_len: 40000,
            download_dir: download_dir.clone(),
            files: vec![FileInfo {
                path: download_dir.join("payload.bin"),
                len: 40000,
                torrent_offset: 0,
            }],
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(dir.path().to_path_buf());
        let info_hash = [0x5a; 20];

        let record = ResumeRecord::new(
            &info_hash,
            &storage,
            vec![true, false, true],
            2,
        );
        persist(dir.path(), &record).unwrap();

        let loaded = load(dir.path(), &info_hash).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.verified_pieces, vec![true, false, true]);
        assert_eq!(loaded.downloaded, 2);
        assert_eq!(loaded.file_sizes, vec![40000]);
        // no stray temporary file is left behind
        assert!(!dir.path().join("resume.json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), &[0; 20]).unwrap().is_none());
    }

    #[test]
    fn test_other_torrents_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(dir.path().to_path_buf());
        let record =
            ResumeRecord::new(&[1; 20], &storage, vec![false; 3], 0);
        persist(dir.path(), &record).unwrap();

        assert!(load(dir.path(), &[2; 20]).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(resume_file_path(dir.path()), b"{not json").unwrap();
        assert!(matches!(
            load(dir.path(), &[0; 20]),
            Err(Error::ResumeCorrupt(_))
        ));
    }

    #[test]
    fn test_persist_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = test_storage(dir.path().to_path_buf());
        let info_hash = [0x5a; 20];

        let first =
            ResumeRecord::new(&info_hash, &storage, vec![false; 3], 0);
        persist(dir.path(), &first).unwrap();
        let second = ResumeRecord::new(
            &info_hash,
            &storage,
            vec![true, true, false],
            2,
        );
        persist(dir.path(), &second).unwrap();

        let loaded = load(dir.path(), &info_hash).unwrap().unwrap();
        assert_eq!(loaded.downloaded, 2);
        assert_eq!(loaded.verified_pieces, vec![true, true, false]);
    }
}
