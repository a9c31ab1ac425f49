//! BEP 15 UDP tracker client: the connect/announce exchange with a single
//! tracker, and the periodic refresh task that feeds peer addresses into
//! the download pipeline.

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Buf, BufMut, BytesMut};
use futures::{stream::Fuse, FutureExt, StreamExt};
use rand::random;
use tokio::{net::UdpSocket, sync::mpsc, time};
use url::Url;

use crate::{
    conf::Conf, ledger::PieceLedger, metainfo::TorrentInfo, PeerId, Sha1Hash,
};

/// The magic constant identifying the UDP tracker protocol.
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Enough for the fixed announce header plus a few hundred peer entries.
const MAX_ANNOUNCE_RESP_LEN: usize = 2048;

pub(crate) type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// The possible errors that may occur when contacting a tracker. All of
/// them are recovered from by moving on to the next tracker in the list.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// The announce URL could not be parsed.
    InvalidUrl,
    /// The announce URL uses a scheme other than udp.
    UnsupportedScheme,
    /// The announce URL's host did not resolve to an IPv4 address.
    Dns,
    /// The metainfo lists no usable udp:// tracker at all.
    NoUsableTracker,
    /// The tracker did not reply in time.
    Timeout,
    /// The reply was shorter than the protocol minimum or malformed.
    InvalidResponse(&'static str),
    /// The reply carried a different transaction id than the request.
    TransactionIdMismatch,
    /// A socket error while talking to the tracker.
    Io(std::io::Error),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidUrl => write!(f, "invalid announce URL"),
            Self::UnsupportedScheme => {
                write!(f, "only udp trackers are supported")
            }
            Self::Dns => write!(f, "tracker host did not resolve"),
            Self::NoUsableTracker => {
                write!(f, "metainfo lists no usable udp tracker")
            }
            Self::Timeout => write!(f, "tracker timed out"),
            Self::InvalidResponse(what) => {
                write!(f, "invalid tracker response: {}", what)
            }
            Self::TransactionIdMismatch => {
                write!(f, "tracker response transaction id mismatch")
            }
            Self::Io(e) => e.fmt(f),
        }
    }
}

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// Sent once the download of the final piece was verified.
    Completed = 1,
    /// The first announce of a session must carry this value.
    Started = 2,
}

fn event_code(event: Option<Event>) -> u32 {
    match event {
        None => 0,
        Some(event) => event as u32,
    }
}

/// Parameters for announcing to a tracker.
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which we are nominally listening.
    pub port: u16,
    /// Number of payload bytes downloaded and verified so far.
    pub downloaded: u64,
    /// Number of payload bytes still missing.
    pub left: u64,
    /// Number of bytes uploaded so far; always 0 in this download-only
    /// engine.
    pub uploaded: u64,
    /// Only set for the special started/completed announces.
    pub event: Option<Event>,
}

/// The tracker's reply to an announce.
#[derive(Debug, PartialEq)]
pub(crate) struct AnnounceResponse {
    /// Seconds the tracker wants us to wait before re-announcing.
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// Swarm statistics as of the most recent successful announce.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SwarmStats {
    pub interval_seconds: u32,
    pub seeders: u32,
    pub leechers: u32,
}

fn build_connect_request(txn_id: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(txn_id);
    buf
}

fn parse_connect_response(mut resp: &[u8], txn_id: u32) -> Result<u64> {
    if resp.len() < 16 {
        return Err(TrackerError::InvalidResponse(
            "connect response shorter than 16 bytes",
        ));
    }
    let action = resp.get_u32();
    if resp.get_u32() != txn_id {
        return Err(TrackerError::TransactionIdMismatch);
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::InvalidResponse(
            "connect response action mismatch",
        ));
    }
    Ok(resp.get_u64())
}

fn build_announce_request(
    connection_id: u64,
    txn_id: u32,
    key: u32,
    params: &Announce,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(txn_id);
    buf.put_slice(&params.info_hash);
    buf.put_slice(&params.peer_id);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_u32(event_code(params.event));
    // IP address 0 tells the tracker to use the request's source address
    buf.put_u32(0);
    buf.put_u32(key);
    // num_want -1 asks for as many peers as the tracker will give
    buf.put_i32(-1);
    buf.put_u16(params.port);
    buf
}

fn parse_announce_response(
    mut resp: &[u8],
    txn_id: u32,
) -> Result<AnnounceResponse> {
    if resp.len() < 20 {
        return Err(TrackerError::InvalidResponse(
            "announce response shorter than 20 bytes",
        ));
    }
    let action = resp.get_u32();
    if resp.get_u32() != txn_id {
        return Err(TrackerError::TransactionIdMismatch);
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::InvalidResponse(
            "announce response action mismatch",
        ));
    }
    let interval = resp.get_u32();
    let leechers = resp.get_u32();
    let seeders = resp.get_u32();

    // whatever follows is 6 byte peer entries: IPv4 address + port
    let mut peers = Vec::with_capacity(resp.remaining() / 6);
    while resp.remaining() >= 6 {
        let ip = std::net::Ipv4Addr::from(resp.get_u32());
        let port = resp.get_u16();
        peers.push(SocketAddr::from((ip, port)));
    }

    Ok(AnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}

/// A single UDP tracker endpoint.
pub(crate) struct Tracker {
    url: Url,
    timeout: Duration,
}

impl Tracker {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| TrackerError::InvalidUrl)?;
        if url.scheme() != "udp" {
            return Err(TrackerError::UnsupportedScheme);
        }
        Ok(Self { url, timeout })
    }

    /// Performs the connect/announce exchange with this tracker.
    ///
    /// A single attempt is made per message; a timeout is returned to the
    /// caller, which moves on to the next tracker.
    pub async fn announce(
        &self,
        params: &Announce,
    ) -> Result<AnnounceResponse> {
        let addr = self.resolve()?;
        let mut socket =
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
                .await
                .map_err(TrackerError::Io)?;

        // obtain a connection id for the announce
        let txn_id = random::<u32>();
        let req = build_connect_request(txn_id);
        socket
            .send_to(&req, &addr)
            .await
            .map_err(TrackerError::Io)?;
        let mut buf = [0; MAX_ANNOUNCE_RESP_LEN];
        let len = self.recv(&mut socket, &mut buf).await?;
        let connection_id = parse_connect_response(&buf[..len], txn_id)?;

        // the announce proper
        let txn_id = random::<u32>();
        let key = random::<u32>();
        let req = build_announce_request(connection_id, txn_id, key, params);
        socket
            .send_to(&req, &addr)
            .await
            .map_err(TrackerError::Io)?;
        let len = self.recv(&mut socket, &mut buf).await?;
        parse_announce_response(&buf[..len], txn_id)
    }

    async fn recv(
        &self,
        socket: &mut UdpSocket,
        buf: &mut [u8],
    ) -> Result<usize> {
        match time::timeout(self.timeout, socket.recv_from(buf)).await {
            Ok(Ok((len, _))) => Ok(len),
            Ok(Err(e)) => Err(TrackerError::Io(e)),
            Err(_) => Err(TrackerError::Timeout),
        }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let addrs = self
            .url
            .socket_addrs(|| None)
            .map_err(|_| TrackerError::Dns)?;
        addrs
            .into_iter()
            .find(|addr| addr.is_ipv4())
            .ok_or(TrackerError::Dns)
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}'", self.url)
    }
}

/// The commands the supervisor can send to the announce task.
#[derive(Debug)]
pub(crate) enum TrackerCommand {
    /// The final piece was verified; announce completion and stop.
    DownloadCompleted,
    /// The engine is shutting down; stop without further announces.
    Shutdown,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<TrackerCommand>;
type CommandReceiver = mpsc::UnboundedReceiver<TrackerCommand>;

/// Drives the periodic announce cycle: asks the trackers for peers, feeds
/// the addresses into the connect queue and keeps the swarm statistics of
/// the most recent successful announce.
pub(crate) struct TrackerClient {
    /// Tracker endpoints in tier order. URLs that are not valid udp
    /// trackers are dropped at construction.
    trackers: Vec<Tracker>,
    info_hash: Sha1Hash,
    client_id: PeerId,
    port: u16,
    fallback_interval: Duration,
    ledger: Arc<PieceLedger>,
    peer_chan: mpsc::UnboundedSender<SocketAddr>,
    cmd_port: Fuse<CommandReceiver>,
    stats: SwarmStats,
    /// Set after the first successful announce; later cycles carry no
    /// event.
    started_sent: bool,
}

impl TrackerClient {
    pub fn new(
        conf: &Conf,
        info: &TorrentInfo,
        ledger: Arc<PieceLedger>,
        peer_chan: mpsc::UnboundedSender<SocketAddr>,
    ) -> Result<(Self, CommandSender)> {
        let mut trackers = Vec::new();
        for url in info.trackers.iter().flatten() {
            match Tracker::new(url, conf.tracker_timeout) {
                Ok(tracker) => trackers.push(tracker),
                Err(e) => {
                    log::warn!("Skipping tracker {}: {}", url, e);
                }
            }
        }
        if trackers.is_empty() {
            return Err(TrackerError::NoUsableTracker);
        }

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                trackers,
                info_hash: info.info_hash,
                client_id: conf.client_id,
                port: conf.listen_port,
                fallback_interval: conf.announce_fallback_interval,
                ledger,
                peer_chan,
                cmd_port: cmd_port.fuse(),
                stats: SwarmStats::default(),
                started_sent: false,
            },
            cmd_chan,
        ))
    }

    /// The stats of the most recent successful announce.
    pub fn swarm_stats(&self) -> SwarmStats {
        self.stats
    }

    /// Runs announce cycles until the supervisor tells us the download
    /// completed or the engine is shutting down.
    pub async fn run(mut self) {
        loop {
            let event = if self.started_sent {
                None
            } else {
                Some(Event::Started)
            };
            let reannounce = match self.announce_cycle(event).await {
                Some(interval) => {
                    self.started_sent = true;
                    // re-announce one second after the tracker's interval
                    Duration::from_secs(u64::from(interval) + 1)
                }
                None => self.fallback_interval,
            };

            let mut delay = time::delay_for(reannounce).fuse();
            futures::select! {
                _ = delay => {}
                cmd = self.cmd_port.select_next_some() => match cmd {
                    TrackerCommand::DownloadCompleted => {
                        self.announce_cycle(Some(Event::Completed)).await;
                        return;
                    }
                    TrackerCommand::Shutdown => return,
                },
            }
        }
    }

    /// Tries the trackers in tier order until one replies; publishes its
    /// peer list into the connect queue and replaces the swarm stats.
    ///
    /// Returns the reply's re-announce interval in seconds, or `None` if
    /// every tracker failed this cycle.
    async fn announce_cycle(&mut self, event: Option<Event>) -> Option<u32> {
        let params = Announce {
            info_hash: self.info_hash,
            peer_id: self.client_id,
            port: self.port,
            downloaded: self.ledger.downloaded_bytes(),
            left: self.ledger.left_bytes(),
            uploaded: 0,
            event,
        };

        for tracker in &self.trackers {
            match tracker.announce(&params).await {
                Ok(resp) => {
                    log::info!(
                        "Tracker {} returned {} peers \
                        ({} seeders, {} leechers, interval {}s)",
                        tracker,
                        resp.peers.len(),
                        resp.seeders,
                        resp.leechers,
                        resp.interval,
                    );
                    self.stats = SwarmStats {
                        interval_seconds: resp.interval,
                        seeders: resp.seeders,
                        leechers: resp.leechers,
                    };
                    // the completed announce is a farewell, its peer list is
                    // of no further use
                    if event != Some(Event::Completed) {
                        for addr in resp.peers {
                            if self.peer_chan.send(addr).is_err() {
                                // pipeline is gone, the engine is shutting
                                // down
                                return None;
                            }
                        }
                    }
                    return Some(resp.interval);
                }
                Err(e) => {
                    log::warn!("Tracker {} announce failed: {}", tracker, e);
                }
            }
        }
        log::warn!("Every tracker failed this announce cycle, backing off");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_connect_request_wire_format() {
        let req = build_connect_request(0xdead_beef);
        assert_eq!(req.len(), 16);
        assert_eq!(&req[..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&req[8..12], &[0, 0, 0, 0]);
        assert_eq!(&req[12..], &0xdead_beef_u32.to_be_bytes());
    }

    #[test]
    fn test_connect_response_validation() {
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_CONNECT);
        resp.put_u32(7);
        resp.put_u64(0x1122_3344_5566_7788);

        assert_eq!(
            parse_connect_response(&resp, 7).unwrap(),
            0x1122_3344_5566_7788
        );
        assert!(matches!(
            parse_connect_response(&resp, 8),
            Err(TrackerError::TransactionIdMismatch)
        ));
        assert!(matches!(
            parse_connect_response(&resp[..12], 7),
            Err(TrackerError::InvalidResponse(_))
        ));

        // an announce action in a connect reply is invalid
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_ANNOUNCE);
        resp.put_u32(7);
        resp.put_u64(1);
        assert!(matches!(
            parse_connect_response(&resp, 7),
            Err(TrackerError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_announce_request_wire_format() {
        let params = Announce {
            info_hash: [0xaa; 20],
            peer_id: [0xbb; 20],
            port: 6881,
            downloaded: 1000,
            left: 2000,
            uploaded: 0,
            event: Some(Event::Started),
        };
        let req = build_announce_request(42, 77, 99, &params);

        assert_eq!(req.len(), 98);
        assert_eq!(&req[..8], &42u64.to_be_bytes());
        assert_eq!(&req[8..12], &1u32.to_be_bytes());
        assert_eq!(&req[12..16], &77u32.to_be_bytes());
        assert_eq!(&req[16..36], &[0xaa; 20]);
        assert_eq!(&req[36..56], &[0xbb; 20]);
        assert_eq!(&req[56..64], &1000u64.to_be_bytes());
        assert_eq!(&req[64..72], &2000u64.to_be_bytes());
        assert_eq!(&req[72..80], &0u64.to_be_bytes());
        // event 2 is "started"
        assert_eq!(&req[80..84], &2u32.to_be_bytes());
        assert_eq!(&req[84..88], &[0; 4]);
        assert_eq!(&req[88..92], &99u32.to_be_bytes());
        assert_eq!(&req[92..96], &(-1i32).to_be_bytes());
        assert_eq!(&req[96..], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_announce_response_peer_list() {
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_ANNOUNCE);
        resp.put_u32(9);
        resp.put_u32(1800); // interval
        resp.put_u32(3); // leechers
        resp.put_u32(17); // seeders
        for octet in &[1u8, 2, 3] {
            resp.put_slice(&[10, 0, 0, *octet]);
            resp.put_u16(6881 + u16::from(*octet));
        }

        let parsed = parse_announce_response(&resp, 9).unwrap();
        assert_eq!(parsed.interval, 1800);
        assert_eq!(parsed.leechers, 3);
        assert_eq!(parsed.seeders, 17);
        assert_eq!(
            parsed.peers,
            vec![
                "10.0.0.1:6882".parse().unwrap(),
                "10.0.0.2:6883".parse().unwrap(),
                "10.0.0.3:6884".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_announce_response_too_short() {
        let mut resp = BytesMut::new();
        resp.put_u32(ACTION_ANNOUNCE);
        resp.put_u32(9);
        resp.put_u32(1800);
        assert!(matches!(
            parse_announce_response(&resp, 9),
            Err(TrackerError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_non_udp_scheme_is_rejected() {
        assert!(matches!(
            Tracker::new(
                "http://tracker.example.org/announce",
                Duration::from_secs(1)
            ),
            Err(TrackerError::UnsupportedScheme)
        ));
    }

    /// A refresh cycle with a dead first tracker: the second one answers,
    /// its peers are published and its stats replace the old ones.
    #[tokio::test]
    async fn test_refresh_cycle_moves_past_dead_tracker() {
        use std::path::PathBuf;

        use crate::{
            metainfo::TorrentInfo, storage_info::StorageInfo, FileInfo,
        };

        // bound but mute; the client must time out on it
        let dead = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let dead_addr = dead.local_addr().unwrap();

        let mut live =
            UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap();
        let live_addr = live.local_addr().unwrap();
        tokio::task::spawn(async move {
            let mut buf = [0u8; 1024];

            // connect request
            let (len, peer) = live.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            assert_eq!(&buf[..8], &PROTOCOL_ID.to_be_bytes());
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_CONNECT);
            reply.put_slice(&buf[12..16]);
            reply.put_u64(0xfeed);
            live.send_to(&reply, &peer).await.unwrap();

            // announce request, answered with three peers
            let (len, peer) = live.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 98);
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_ANNOUNCE);
            reply.put_slice(&buf[12..16]);
            reply.put_u32(1800);
            reply.put_u32(3);
            reply.put_u32(17);
            for octet in 1u8..=3 {
                reply.put_slice(&[10, 0, 0, octet]);
                reply.put_u16(6880 + u16::from(octet));
            }
            live.send_to(&reply, &peer).await.unwrap();
        });

        let mut conf = crate::conf::Conf::new("/tmp");
        conf.tracker_timeout = Duration::from_millis(200);
        let info = TorrentInfo {
            name: "payload.bin".into(),
            info_hash: [0x42; 20],
            piece_len: 16384,
            total_len: 16384,
            piece_count: 1,
            piece_hashes: vec![[0; 20]],
            files: vec![FileInfo {
                path: PathBuf::from("payload.bin"),
                len: 16384,
                torrent_offset: 0,
            }],
            is_archive: false,
            trackers: vec![vec![
                format!("udp://{}", dead_addr),
                format!("udp://{}", live_addr),
            ]],
        };
        let storage = Arc::new(StorageInfo::new(&info, "/tmp"));
        let (alert_chan, _alert_port) = mpsc::unbounded_channel();
        let ledger = Arc::new(crate::ledger::PieceLedger::new(
            storage,
            info.piece_hashes.clone(),
            alert_chan,
        ));
        let (peer_chan, mut peer_port) = mpsc::unbounded_channel();

        let (mut client, _cmd_chan) =
            TrackerClient::new(&conf, &info, ledger, peer_chan).unwrap();
        let interval =
            client.announce_cycle(Some(Event::Started)).await;

        assert_eq!(interval, Some(1800));
        assert_eq!(
            client.swarm_stats(),
            SwarmStats {
                interval_seconds: 1800,
                seeders: 17,
                leechers: 3,
            }
        );
        // exactly the three announced addresses were published
        for octet in 1u8..=3 {
            let addr = peer_port.recv().await.unwrap();
            assert_eq!(
                addr,
                SocketAddr::from(([10, 0, 0, octet], 6880 + u16::from(octet)))
            );
        }
        assert!(peer_port.try_recv().is_err());

        drop(dead);
    }
}
