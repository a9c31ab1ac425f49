//! Decoding of the `.torrent` container and the immutable metadata view the
//! rest of the engine works with.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{error::*, storage_info::FileInfo, Sha1Hash};

/// The raw `.torrent` file contents, as decoded from bencode.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// The torrent's identity on the wire: the SHA-1 digest of the re-encoded
    /// info dictionary.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
}

/// The validated, immutable view of a torrent's metadata that all engine
/// components share.
#[derive(Clone, Debug)]
pub struct TorrentInfo {
    /// The name of the torrent: the file name of a single file torrent, the
    /// directory name of an archive.
    pub name: String,
    pub info_hash: Sha1Hash,
    /// The nominal piece length; the last piece may be shorter.
    pub piece_len: u32,
    /// The sum of all file lengths.
    pub total_len: u64,
    pub piece_count: usize,
    /// One 20 byte digest per piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The torrent's files with paths relative to the download directory and
    /// cumulative byte offsets. A single file torrent has exactly one entry
    /// at offset 0.
    pub files: Vec<FileInfo>,
    /// Whether the torrent is a (possibly nested) archive of files rather
    /// than a single file.
    pub is_archive: bool,
    /// Announce URLs in tier order: the `announce` field first, then the
    /// `announce-list` tiers, with duplicates removed.
    pub trackers: Vec<Vec<String>>,
}

impl TorrentInfo {
    pub fn from_metainfo(metainfo: &Metainfo) -> Result<Self> {
        let info = &metainfo.info;
        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length must be positive"));
        }

        let is_archive = info.files.is_some();
        let files = match &info.files {
            Some(files) => {
                if files.is_empty() {
                    return Err(Error::InvalidMetainfo("empty file list"));
                }
                let mut entries = Vec::with_capacity(files.len());
                let mut torrent_offset = 0;
                for file in files {
                    if file.path.is_empty() {
                        return Err(Error::InvalidMetainfo(
                            "file with empty path",
                        ));
                    }
                    entries.push(FileInfo {
                        path: file.path.iter().collect::<PathBuf>(),
                        len: file.length,
                        torrent_offset,
                    });
                    torrent_offset += file.length;
                }
                entries
            }
            None => {
                let len = info
                    .length
                    .ok_or(Error::InvalidMetainfo("missing file length"))?;
                vec![FileInfo {
                    path: PathBuf::from(&info.name),
                    len,
                    torrent_offset: 0,
                }]
            }
        };

        let total_len: u64 = files.iter().map(|f| f.len).sum();
        if total_len == 0 {
            return Err(Error::InvalidMetainfo("torrent is empty"));
        }

        let piece_len = info.piece_length;
        let piece_count =
            ((total_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        if info.pieces.len() != piece_count * 20 {
            return Err(Error::InvalidMetainfo(
                "piece hash count does not match piece count",
            ));
        }
        let piece_hashes = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(Self {
            name: info.name.clone(),
            info_hash: metainfo.create_info_hash()?,
            piece_len,
            total_len,
            piece_count,
            piece_hashes,
            files,
            is_archive,
            trackers: tracker_tiers(metainfo),
        })
    }
}

/// Collects announce URLs into tiers: the single `announce` URL forms the
/// first tier, followed by the `announce-list` tiers in order. A URL seen in
/// an earlier tier is not repeated.
fn tracker_tiers(metainfo: &Metainfo) -> Vec<Vec<String>> {
    let mut seen: Vec<String> = Vec::new();
    let mut tiers = Vec::new();
    let announce_tier =
        metainfo.announce.as_ref().map(|url| vec![url.clone()]);
    let announce_list = metainfo.announce_list.as_deref().unwrap_or(&[]);
    for tier in announce_tier.iter().chain(announce_list.iter()) {
        let tier: Vec<String> = tier
            .iter()
            .filter(|url| !seen.contains(*url))
            .cloned()
            .collect();
        if tier.is_empty() {
            continue;
        }
        seen.extend(tier.iter().cloned());
        tiers.push(tier);
    }
    tiers
}
