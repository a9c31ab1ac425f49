//! The three stage download pipeline.
//!
//! Peer addresses flow through three unbounded queues drained by fixed
//! worker pools: connect workers open the TCP connection and exchange
//! handshakes, control workers run the availability/interest exchange, and
//! download workers fetch pieces. Each worker pulls one item, runs its
//! stage to completion or error, and loops; concurrency per stage is
//! bounded by the pool size, never by spawning a task per peer.
//!
//! A session error is logged and ends that session only; the other workers
//! keep going. Workers exit when their queue closes.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    sync::{mpsc, Mutex},
    task::{self, JoinHandle},
};

use crate::{peer::PeerSession, torrent::TorrentContext};

/// A queue drained by a pool of workers. The lock is held only while
/// waiting for the next item, so each item is handed to exactly one worker.
type Queue<T> = Arc<Mutex<mpsc::UnboundedReceiver<T>>>;

async fn next_item<T>(queue: &Queue<T>) -> Option<T> {
    queue.lock().await.recv().await
}

pub(crate) struct Pipeline {
    /// The entry point of the first stage; the tracker client feeds fresh
    /// peer addresses into it. Dropping the pipeline closes it, which winds
    /// down the worker pools stage by stage.
    pub peer_chan: mpsc::UnboundedSender<SocketAddr>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns the three worker pools with the pool sizes from the
    /// configuration.
    pub fn spawn(ctx: Arc<TorrentContext>) -> Self {
        let (peer_chan, peer_port) = mpsc::unbounded_channel();
        let (control_chan, control_port) = mpsc::unbounded_channel();
        let (download_chan, download_port) = mpsc::unbounded_channel();

        let peer_port: Queue<SocketAddr> = Arc::new(Mutex::new(peer_port));
        let control_port: Queue<PeerSession> =
            Arc::new(Mutex::new(control_port));
        let download_port: Queue<PeerSession> =
            Arc::new(Mutex::new(download_port));

        let mut workers = Vec::new();
        for _ in 0..ctx.conf.connect_task_count {
            workers.push(task::spawn(connect_worker(
                Arc::clone(&ctx),
                Arc::clone(&peer_port),
                control_chan.clone(),
            )));
        }
        for _ in 0..ctx.conf.control_task_count {
            workers.push(task::spawn(control_worker(
                Arc::clone(&control_port),
                download_chan.clone(),
            )));
        }
        for _ in 0..ctx.conf.download_task_count {
            workers.push(task::spawn(download_worker(Arc::clone(
                &download_port,
            ))));
        }

        Self { peer_chan, workers }
    }
}

/// Stage one: TCP connect and handshake exchange.
///
/// Addresses are taken as they come; the tracker may hand out the same
/// address in consecutive refreshes, which costs no more than a wasted
/// connection attempt.
async fn connect_worker(
    ctx: Arc<TorrentContext>,
    queue: Queue<SocketAddr>,
    next_stage: mpsc::UnboundedSender<PeerSession>,
) {
    while let Some(addr) = next_item(&queue).await {
        match PeerSession::connect(addr, Arc::clone(&ctx)).await {
            Ok(session) => {
                if next_stage.send(session).is_err() {
                    break;
                }
            }
            Err(e) => log::debug!("Peer {} connect failed: {}", addr, e),
        }
    }
    log::debug!("Connect worker exiting");
}

/// Stage two: availability exchange, interest, unchoke wait.
async fn control_worker(
    queue: Queue<PeerSession>,
    next_stage: mpsc::UnboundedSender<PeerSession>,
) {
    while let Some(mut session) = next_item(&queue).await {
        match session.exchange_control().await {
            Ok(()) => {
                if next_stage.send(session).is_err() {
                    break;
                }
            }
            Err(e) => log::debug!(
                "Peer {} control exchange failed: {}",
                session.addr(),
                e
            ),
        }
    }
    log::debug!("Control worker exiting");
}

/// Stage three: piece download against the shared ledger.
async fn download_worker(queue: Queue<PeerSession>) {
    while let Some(mut session) = next_item(&queue).await {
        match session.download().await {
            Ok(()) => {
                log::debug!("Peer {} session finished", session.addr())
            }
            Err(e) => log::debug!(
                "Peer {} download ended: {}",
                session.addr(),
                e
            ),
        }
    }
    log::debug!("Download worker exiting");
}
