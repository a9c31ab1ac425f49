use std::{
    ops::Range,
    path::{Path, PathBuf},
};

use crate::{error::*, metainfo::TorrentInfo, FileIndex, PieceIndex};

/// One file of the torrent and its place in the torrent's byte space.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Where the file lives: relative to the download directory in
    /// [`TorrentInfo`], absolute once resolved into [`StorageInfo`].
    pub path: PathBuf,
    /// The declared length of the file, in bytes.
    pub len: u64,
    /// Offset of the file's first byte when all files of the torrent are
    /// viewed as one contiguous byte string. 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// The half-open range of torrent offsets this file covers.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// One past the torrent offset of the file's last byte.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Maps a torrent byte range onto this file.
    ///
    /// The returned slice starts where `torrent_offset` lands inside the
    /// file and runs for `len` bytes, or up to the end of the file if that
    /// comes first.
    ///
    /// # Panics
    ///
    /// `torrent_offset` must land inside the file: an offset before the
    /// file's first byte or at/past its end panics.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        if torrent_offset < self.torrent_offset {
            panic!("torrent offset must be larger than file offset");
        }

        let torrent_end_offset = self.torrent_end_offset();
        if torrent_offset >= torrent_end_offset {
            panic!("torrent offset must be smaller than file end offset");
        }

        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(torrent_end_offset - torrent_offset),
        }
    }
}

/// A byte range within a single file, in file-relative coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    /// Offset of the range from the start of the file.
    pub offset: u64,
    /// How many bytes the range covers.
    pub len: u64,
}

/// The piece geometry of a torrent and its resolved on-disk layout.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The effective length of the final piece: whatever of the torrent is
    /// left over once all the full-length pieces are accounted for.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The torrent's own directory under the user supplied destination:
    /// `<dest>/<name>` for archives and `<dest>/<name stem>` for single file
    /// torrents, so that the payload and the resume file always have a
    /// directory to themselves.
    pub download_dir: PathBuf,
    /// All files in the torrent, in declared order, with paths resolved
    /// against `download_dir`.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Derives the piece geometry and the resolved file paths of a
    /// download from the torrent metadata and the destination directory.
    pub fn new(info: &TorrentInfo, dest_dir: impl Into<PathBuf>) -> Self {
        let dir_name = if info.is_archive {
            PathBuf::from(&info.name)
        } else {
            Path::new(&info.name)
                .file_stem()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&info.name))
        };
        let download_dir = dest_dir.into().join(dir_name);

        let files = info
            .files
            .iter()
            .map(|f| FileInfo {
                path: download_dir.join(&f.path),
                len: f.len,
                torrent_offset: f.torrent_offset,
            })
            .collect();

        let last_piece_len = info.total_len
            - info.piece_len as u64 * (info.piece_count as u64 - 1);

        Self {
            piece_count: info.piece_count,
            piece_len: info.piece_len,
            last_piece_len: last_piece_len as u32,
            download_len: info.total_len,
            download_dir,
            files,
        }
    }

    /// The effective length of a piece: the nominal piece length for all
    /// but the final piece, which may be shorter.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// The indices of the files a piece's bytes fall into.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Returns the contiguous run of file indices whose bytes overlap the
    /// given half-open range of torrent offsets, or an empty range if no
    /// file does.
    pub fn files_intersecting_bytes(
        &self,
        byte_range: Range<u64>,
    ) -> Range<FileIndex> {
        // find the file containing the first byte of the range; all other
        // intersecting files, if any, follow it contiguously
        let first = match self
            .files
            .iter()
            .position(|file| file.byte_range().contains(&byte_range.start))
        {
            Some(index) => index,
            None => return 0..0,
        };

        let mut end = first + 1;
        for (index, file) in self.files.iter().enumerate().skip(end) {
            // stop at the first file starting at or past the range's end
            if !byte_range.contains(&file.torrent_offset) {
                break;
            }
            end = index + 1;
        }

        first..end
    }
}
