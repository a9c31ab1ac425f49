//! Writing assembled pieces into the torrent's on-disk file layout.

use std::{
    fs::{self, OpenOptions},
    io::{Seek, SeekFrom, Write},
};

use crate::{error::*, storage_info::StorageInfo, PieceIndex};

/// Writes a verified piece into every file its byte range overlaps.
///
/// For each overlapping file the writer opens the file (creating the
/// directory tree and sparse pre-sizing the file to its declared length on
/// first touch), seeks to the piece's offset within the file and writes the
/// corresponding slice of the piece. No descriptors are kept open across
/// pieces; the open/close overhead is amortized against the piece size.
///
/// # Important
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
pub(crate) fn write_piece(
    storage: &StorageInfo,
    index: PieceIndex,
    data: &[u8],
) -> Result<()> {
    let piece_offset = index as u64 * storage.piece_len as u64;
    let piece_end = piece_offset + data.len() as u64;
    let files = storage.files_intersecting_bytes(piece_offset..piece_end);

    let mut torrent_offset = piece_offset;
    let mut rest = data;
    for file in &storage.files[files] {
        let slice = file.get_slice(torrent_offset, rest.len() as u64);
        // an empty file slice would mean the piece was thought to span more
        // files than it actually does
        debug_assert!(slice.len > 0);

        if let Some(parent) = file.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut handle = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&file.path)?;
        // pre-size to the declared length so that out of order piece writes
        // land in a sparse file instead of growing it piecemeal
        if handle.metadata()?.len() < file.len {
            handle.set_len(file.len)?;
        }

        handle.seek(SeekFrom::Start(slice.offset))?;
        let (chunk, tail) = rest.split_at(slice.len as usize);
        handle.write_all(chunk)?;

        torrent_offset += slice.len;
        rest = tail;
    }
    // all of the piece's bytes must have found a home
    debug_assert!(rest.is_empty());

    Ok(())
}
