//! The supervisor that wires the engine together for a single torrent:
//! ledger, tracker client, pipeline, progress reporting and shutdown.

use std::{
    sync::Arc,
    time::Instant,
};

use futures::{FutureExt, StreamExt};
use tokio::{signal, sync::mpsc, task, time};

use crate::{
    conf::Conf,
    error::*,
    ledger::{AlertReceiver, LedgerAlert, PieceLedger},
    metainfo::TorrentInfo,
    pipeline::Pipeline,
    resume::{self, ResumeRecord},
    storage_info::StorageInfo,
    tracker::{TrackerClient, TrackerCommand},
    PeerId, Sha1Hash,
};

/// Read-only state shared by every session and worker of the torrent.
pub(crate) struct TorrentContext {
    pub conf: Conf,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: Arc<StorageInfo>,
    pub ledger: Arc<PieceLedger>,
}

/// How a supervised download came to an end.
enum Outcome {
    /// Every piece is verified and on disk.
    Complete,
    /// The user interrupted the process; progress was persisted.
    Interrupted,
    /// A piece could not be written; the download cannot continue.
    DiskFailure(String),
}

/// The supervisor of a single torrent download.
pub struct Torrent {
    conf: Conf,
    info: TorrentInfo,
}

impl Torrent {
    pub fn new(info: TorrentInfo, conf: Conf) -> Self {
        Self { conf, info }
    }

    /// Runs the download until it completes, the process is interrupted or
    /// a fatal error occurs.
    ///
    /// Returns `Ok` both on a finished download and on an interrupt
    /// triggered shutdown; in either case the resume snapshot was persisted
    /// first, so a later invocation picks up where this one left off.
    pub async fn start(self) -> Result<()> {
        let storage = Arc::new(StorageInfo::new(
            &self.info,
            self.conf.download_dir.clone(),
        ));
        log::info!(
            "Torrent {}: {} pieces, {} bytes into {:?}",
            self.info.name,
            storage.piece_count,
            storage.download_len,
            storage.download_dir,
        );

        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let ledger = Arc::new(PieceLedger::new(
            Arc::clone(&storage),
            self.info.piece_hashes.clone(),
            alert_chan,
        ));

        // restore a previous session's progress, if any
        if let Some(record) =
            resume::load(&storage.download_dir, &self.info.info_hash)?
        {
            log::info!(
                "Resuming: {}/{} pieces already verified",
                record.downloaded,
                storage.piece_count
            );
            ledger.restore(&record.verified_pieces);
        }

        let ctx = Arc::new(TorrentContext {
            conf: self.conf.clone(),
            info_hash: self.info.info_hash,
            client_id: self.conf.client_id,
            storage: Arc::clone(&storage),
            ledger: Arc::clone(&ledger),
        });

        let pipeline = Pipeline::spawn(Arc::clone(&ctx));
        let (tracker_client, tracker_chan) = TrackerClient::new(
            &self.conf,
            &self.info,
            Arc::clone(&ledger),
            pipeline.peer_chan.clone(),
        )?;
        let tracker_task = task::spawn(tracker_client.run());

        let start_time = Instant::now();
        let outcome = self.supervise(&ledger, alert_port, start_time).await;

        // persist before tearing anything down, so that an interrupt can
        // never lose verified pieces
        let (verified_pieces, downloaded) = ledger.snapshot();
        resume::persist(
            &storage.download_dir,
            &ResumeRecord::new(
                &self.info.info_hash,
                &storage,
                verified_pieces,
                downloaded,
            ),
        )?;

        match outcome {
            Outcome::Complete => {
                // let the tracker deliver the completed announce before the
                // runtime is torn down; its cycle is bounded by timeouts
                if tracker_chan
                    .send(TrackerCommand::DownloadCompleted)
                    .is_ok()
                {
                    let _ = tracker_task.await;
                }
                log::info!(
                    "Download of {} complete in {:?}",
                    self.info.name,
                    start_time.elapsed()
                );
                Ok(())
            }
            Outcome::Interrupted => {
                let _ = tracker_chan.send(TrackerCommand::Shutdown);
                log::info!("Interrupted; resume data saved");
                Ok(())
            }
            Outcome::DiskFailure(reason) => {
                let _ = tracker_chan.send(TrackerCommand::Shutdown);
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    reason,
                )))
            }
        }
        // dropping the pipeline closes the peer queue, which winds down the
        // worker pools; in-flight claims are released by their guards
    }

    /// The supervision loop: ledger alerts, the periodic progress line and
    /// the interrupt signal.
    async fn supervise(
        &self,
        ledger: &PieceLedger,
        alert_port: AlertReceiver,
        start_time: Instant,
    ) -> Outcome {
        // a fully resumed torrent has nothing left to download
        if ledger.is_complete() {
            return Outcome::Complete;
        }

        let mut alerts = alert_port.fuse();
        let mut progress = time::interval(self.conf.progress_interval).fuse();
        let mut ctrl_c = Box::pin(signal::ctrl_c()).fuse();

        loop {
            futures::select! {
                alert = alerts.select_next_some() => match alert {
                    LedgerAlert::PieceCompleted { index, downloaded, total } => {
                        log::debug!(
                            "Piece {} verified ({}/{})",
                            index,
                            downloaded,
                            total
                        );
                    }
                    LedgerAlert::DownloadComplete => return Outcome::Complete,
                    LedgerAlert::WriteFailure(reason) => {
                        log::error!("Disk write failed: {}", reason);
                        return Outcome::DiskFailure(reason);
                    }
                },
                _ = progress.select_next_some() => {
                    let (downloaded, total) = ledger.progress();
                    log::info!(
                        "Progress: {}/{} pieces, elapsed {:?}",
                        downloaded,
                        total,
                        start_time.elapsed()
                    );
                },
                res = ctrl_c => {
                    if let Err(e) = res {
                        log::warn!("Cannot listen for interrupt: {}", e);
                    }
                    log::info!("Interrupt received, shutting down");
                    return Outcome::Interrupted;
                },
            }
        }
    }
}
