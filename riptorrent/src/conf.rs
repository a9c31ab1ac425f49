//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The ASCII prefix of the client id announced to trackers and peers. The
/// remaining 12 bytes are randomized once at startup.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RT0001-";

/// Generates the client id used for the lifetime of the process: the fixed
/// ASCII prefix followed by 12 random bytes.
pub fn generate_client_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    rand::thread_rng().fill(&mut id[CLIENT_ID_PREFIX.len()..]);
    id
}

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The directory in which the torrent's own download directory is
    /// created.
    pub download_dir: PathBuf,

    /// The port advertised to trackers. The engine is download-only and does
    /// not actually accept inbound connections on it.
    pub listen_port: u16,

    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// The number of workers establishing TCP connections and exchanging
    /// handshakes.
    pub connect_task_count: usize,
    /// The number of workers driving the availability/interest exchange.
    pub control_task_count: usize,
    /// The number of workers downloading pieces.
    pub download_task_count: usize,

    /// The most pieces a single session may hold claimed at once.
    pub max_claim_per_peer: usize,

    /// Timeout for establishing the TCP connection to a peer.
    pub connect_timeout: Duration,
    /// Timeout for the peer's side of the handshake to arrive.
    pub handshake_timeout: Duration,
    /// Timeout for the peer to unchoke us after we declared interest.
    pub unchoke_timeout: Duration,
    /// Timeout for each message read while downloading blocks.
    pub block_timeout: Duration,

    /// Timeout for a single tracker request. There is no per-message retry;
    /// on timeout the refresh cycle moves to the next tracker.
    pub tracker_timeout: Duration,
    /// How long to wait before re-trying the tracker list after a refresh
    /// cycle in which every tracker failed.
    pub announce_fallback_interval: Duration,

    /// How often the supervisor logs download progress.
    pub progress_interval: Duration,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            listen_port: 6881,
            client_id: generate_client_id(),
            connect_task_count: 4,
            control_task_count: 2,
            download_task_count: 8,
            max_claim_per_peer: 30,
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            unchoke_timeout: Duration::from_secs(10),
            block_timeout: Duration::from_secs(10),
            tracker_timeout: Duration::from_secs(1),
            announce_fallback_interval: Duration::from_secs(30),
            progress_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_prefix_and_length() {
        let id = generate_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert_eq!(id.len(), 20);
    }
}
