use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Parser;

use riptorrent::{
    conf::Conf,
    metainfo::{Metainfo, TorrentInfo},
    torrent::Torrent,
};

/// Download a torrent's payload into a destination directory.
#[derive(Parser)]
#[command(name = "riptorrent", version)]
struct Args {
    /// Path to the .torrent metadata file.
    torrent: PathBuf,
    /// Directory under which the torrent's own download directory is
    /// created.
    dest: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let contents = fs::read(&args.torrent).with_context(|| {
        format!("cannot read torrent file {:?}", args.torrent)
    })?;
    let metainfo =
        Metainfo::from_bytes(&contents).context("cannot decode metainfo")?;
    let info =
        TorrentInfo::from_metainfo(&metainfo).context("invalid metainfo")?;

    // fail early on an unwritable destination
    fs::create_dir_all(&args.dest).with_context(|| {
        format!("cannot create destination directory {:?}", args.dest)
    })?;

    log::info!(
        "Downloading {} ({} pieces) into {:?}",
        info.name,
        info.piece_count,
        args.dest
    );
    let conf = Conf::new(&args.dest);
    Torrent::new(info, conf).start().await?;
    Ok(())
}
