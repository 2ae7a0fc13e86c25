//! Download manager module
//!
//! Runs one worker per peer against a shared work queue and assembles
//! verified pieces into the output buffer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::cli::Config;
use crate::error::TorrentError;
use crate::peer::{PeerConnection, PeerStats};
use crate::storage::piece::{AssembledOutput, PieceTask};
use crate::storage::queue::WorkQueue;
use crate::torrent::TorrentInfo;

/// How long idle workers get to report before being aborted
const WORKER_GRACE: Duration = Duration::from_secs(2);

/// Download statistics reported after every verified piece
#[derive(Debug, Clone)]
pub struct DownloadStats {
    /// Verified pieces so far
    pub pieces_done: usize,
    /// Pieces in this download
    pub pieces_total: usize,
    /// Verified bytes so far
    pub bytes_done: u64,
    /// Bytes in this download
    pub bytes_total: u64,
    /// Workers started
    pub peers: usize,
    started: Instant,
}

impl DownloadStats {
    pub fn new(pieces_total: usize, bytes_total: u64, peers: usize) -> Self {
        Self {
            pieces_done: 0,
            pieces_total,
            bytes_done: 0,
            bytes_total,
            peers,
            started: Instant::now(),
        }
    }

    fn record_piece(&mut self, bytes: usize) {
        self.pieces_done += 1;
        self.bytes_done += bytes as u64;
    }

    /// Download progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.bytes_total == 0 {
            return 1.0;
        }
        self.bytes_done as f64 / self.bytes_total as f64
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average download speed in bytes per second
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / secs
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_done == self.pieces_total
    }
}

/// A verified piece handed from a worker to the collector
#[derive(Debug)]
struct PieceResult {
    index: u32,
    data: Vec<u8>,
    peer: SocketAddr,
}

/// Coordinates piece downloads across peers
pub struct DownloadManager {
    info: Arc<TorrentInfo>,
    config: Arc<Config>,
}

impl DownloadManager {
    pub fn new(info: TorrentInfo, config: Config) -> Self {
        Self {
            info: Arc::new(info),
            config: Arc::new(config),
        }
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    /// Download every piece and return the file contents in index order
    pub async fn download<F>(&self, peers: &[SocketAddr], on_progress: F) -> Result<Vec<u8>>
    where
        F: FnMut(&DownloadStats),
    {
        let tasks = PieceTask::plan(&self.info)?;
        info!(
            "Downloading {} ({} bytes, {} pieces) from {} peers",
            self.info.name,
            self.info.length,
            tasks.len(),
            peers.len()
        );

        self.run(tasks, peers, on_progress).await?.into_bytes()
    }

    /// Download and verify a single piece
    pub async fn download_piece(&self, peers: &[SocketAddr], index: usize) -> Result<Vec<u8>> {
        let task = PieceTask::for_piece(&self.info, index)?;
        info!("Downloading piece {} ({} bytes)", task.index, task.size);

        let mut output = self.run(vec![task], peers, |_| {}).await?;
        output.take(task.index).ok_or_else(|| {
            TorrentError::integrity_error_for_piece("Piece missing after download", task.index).into()
        })
    }

    async fn run<F>(&self, tasks: Vec<PieceTask>, peers: &[SocketAddr], on_progress: F) -> Result<AssembledOutput>
    where
        F: FnMut(&DownloadStats),
    {
        let bytes_total = tasks.iter().map(|t| u64::from(t.size)).sum();
        self.run_queue(Arc::new(WorkQueue::new(tasks)), bytes_total, peers, on_progress)
            .await
    }

    /// Spawn the workers, collect their pieces and join them.
    ///
    /// Returns once every task is verified, the deadline passes, or every
    /// worker has exited.
    async fn run_queue<F>(
        &self,
        queue: Arc<WorkQueue>,
        bytes_total: u64,
        peers: &[SocketAddr],
        mut on_progress: F,
    ) -> Result<AssembledOutput>
    where
        F: FnMut(&DownloadStats),
    {
        if peers.is_empty() {
            return Err(TorrentError::discovery_error("No peers available").into());
        }

        let total = queue.remaining().await;

        let mut peers = peers.to_vec();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.max_connections);

        let (tx, mut rx) = mpsc::channel::<PieceResult>(peers.len().max(1));
        let mut workers = JoinSet::new();
        for &addr in &peers {
            let worker = PeerWorker {
                addr,
                info_hash: self.info.info_hash,
                config: Arc::clone(&self.config),
                queue: Arc::clone(&queue),
                results: tx.clone(),
            };
            workers.spawn(async move { (addr, worker.run().await) });
        }
        drop(tx);
        debug!("Started {} peer workers", peers.len());

        let mut output = AssembledOutput::new(self.info.piece_count());
        let mut stats = DownloadStats::new(total, bytes_total, peers.len());
        let deadline = self.config.download_timeout.map(|d| tokio::time::Instant::now() + d);

        while !stats.is_complete() {
            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        warn!("Download deadline reached with {} pieces outstanding", total - stats.pieces_done);
                        queue.close().await;
                        workers.abort_all();
                        return Err(TorrentError::transport_error(format!(
                            "Download timed out after {:?} ({}/{} pieces)",
                            stats.elapsed(),
                            stats.pieces_done,
                            total
                        ))
                        .into());
                    }
                },
                None => rx.recv().await,
            };

            let Some(result) = received else {
                break;
            };

            if !queue.complete(result.index).await {
                continue;
            }

            trace!("Storing piece {} from {}", result.index, result.peer);
            let len = result.data.len();
            output.store(result.index, result.data)?;
            stats.record_piece(len);
            on_progress(&stats);
        }

        queue.close().await;
        if tokio::time::timeout(WORKER_GRACE, join_workers(&mut workers)).await.is_err() {
            debug!("Aborting {} workers still connecting", workers.len());
            workers.abort_all();
        }

        if !stats.is_complete() {
            return Err(TorrentError::transport_error(format!(
                "Download incomplete: all {} peers exited with {} of {} pieces verified",
                peers.len(),
                stats.pieces_done,
                total
            ))
            .into());
        }

        info!(
            "Downloaded {} pieces ({} bytes) in {:?}",
            stats.pieces_done,
            stats.bytes_done,
            stats.elapsed()
        );
        Ok(output)
    }
}

async fn join_workers(workers: &mut JoinSet<(SocketAddr, Result<PeerStats>)>) {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((_, Ok(peer_stats))) => log_peer_stats(&peer_stats),
            Ok((addr, Err(e))) => debug!("Worker for {} stopped: {:#}", addr, e),
            Err(e) if e.is_cancelled() => trace!("Worker cancelled"),
            Err(e) => error!("Worker task failed: {}", e),
        }
    }
}

fn log_peer_stats(stats: &PeerStats) {
    debug!(
        "Peer {} ({}): {} pieces, {} bytes, {} bad pieces, {} advertised",
        stats.addr,
        stats.peer_id_hex().unwrap_or_else(|| "unknown".to_string()),
        stats.pieces_downloaded,
        stats.bytes_downloaded,
        stats.failures,
        stats.advertised_pieces
    );
}

/// Downloads pieces from one peer until the queue runs dry
struct PeerWorker {
    addr: SocketAddr,
    info_hash: [u8; 20],
    config: Arc<Config>,
    queue: Arc<WorkQueue>,
    results: mpsc::Sender<PieceResult>,
}

impl PeerWorker {
    async fn run(self) -> Result<PeerStats> {
        let mut conn = PeerConnection::connect(self.addr, &self.config).await?;
        conn.handshake(self.info_hash, self.config.peer_id, false).await?;
        conn.prepare_download().await?;

        while let Some(task) = self.queue.next().await {
            match conn.download_piece(&task, self.config.block_size).await {
                Ok(data) => {
                    conn.peer.pieces_downloaded += 1;
                    let result = PieceResult {
                        index: task.index,
                        data,
                        peer: self.addr,
                    };
                    if self.results.send(result).await.is_err() {
                        // collector is gone
                        self.queue.requeue(task).await;
                        break;
                    }
                }
                Err(e) if is_integrity_failure(&e) => {
                    conn.peer.failures += 1;
                    warn!("{:#}; requeueing", e);
                    self.queue.requeue(task).await;

                    if conn.peer.failures >= self.config.max_peer_failures {
                        warn!("Dropping peer {} after {} bad pieces", self.addr, conn.peer.failures);
                        break;
                    }
                }
                Err(e) => {
                    self.queue.requeue(task).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = conn.close().await {
            trace!("Closing {}: {}", self.addr, e);
        }
        Ok(conn.peer.stats())
    }
}

fn is_integrity_failure(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::IntegrityFailure { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::PieceStatus;
    use crate::testing::MockPeer;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8 ^ 0x5a).collect()
    }

    fn test_config() -> Config {
        Config {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_download_from_two_peers() {
        let data = content(10 * 1024 + 17);
        let (mock, info) = MockPeer::seeding(data.clone(), 1024);
        let a = mock.clone().spawn().await;
        let b = mock.spawn().await;

        let manager = DownloadManager::new(info, test_config());
        let mut updates = Vec::new();
        let downloaded = manager.download(&[a, b], |s| updates.push(s.pieces_done)).await.unwrap();

        assert_eq!(downloaded, data);
        assert_eq!(updates, (1..=11).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_single_piece_torrent_end_to_end() {
        let data = content(700);
        let (mock, info) = MockPeer::seeding(data.clone(), 1024);
        assert_eq!(info.piece_count(), 1);
        let expected_hash = info.pieces[0];
        let addr = mock.spawn().await;

        let manager = DownloadManager::new(info, test_config());
        let downloaded = manager.download(&[addr], |_| {}).await.unwrap();
        assert_eq!(TorrentInfo::generate_info_hash(&downloaded), expected_hash);
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn test_piece_verified_on_third_attempt() {
        let data = content(700);
        let (mock, info) = MockPeer::seeding(data.clone(), 1024);
        let corruptions = Arc::clone(&mock.corrupt_servings);
        let addr = mock.corrupting(2).spawn().await;

        let tasks = PieceTask::plan(&info).unwrap();
        assert_eq!(tasks.len(), 1);
        let queue = Arc::new(WorkQueue::new(tasks));

        let manager = DownloadManager::new(info, test_config());
        let mut updates = 0;
        let output = manager
            .run_queue(Arc::clone(&queue), 700, &[addr], |_| updates += 1)
            .await
            .unwrap();

        assert_eq!(corruptions.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(updates, 1);
        assert_eq!(queue.status(0).await, Some(PieceStatus::Verified));
        assert_eq!(output.into_bytes().unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupt_pieces_are_requeued() {
        // a single peer corrupts its first two servings; each piece is still
        // verified exactly once
        let data = content(4 * 512);
        let (mock, info) = MockPeer::seeding(data.clone(), 512);
        let addr = mock.corrupting(2).spawn().await;

        let manager = DownloadManager::new(info, test_config());
        let mut pieces = 0;
        let downloaded = manager.download(&[addr], |_| pieces += 1).await.unwrap();

        assert_eq!(downloaded, data);
        assert_eq!(pieces, 4);
    }

    #[tokio::test]
    async fn test_peer_retired_after_failure_ceiling() {
        let data = content(1024);
        let (mock, info) = MockPeer::seeding(data, 512);
        let addr = mock.corrupting(usize::MAX).spawn().await;

        let config = Config { max_peer_failures: 2, ..test_config() };
        let manager = DownloadManager::new(info, config);
        let err = manager.download(&[addr], |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("Download incomplete"));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_skipped() {
        let data = content(3000);
        let (mock, info) = MockPeer::seeding(data.clone(), 1000);
        let good = mock.spawn().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let manager = DownloadManager::new(info, test_config());
        assert_eq!(manager.download(&[dead, good], |_| {}).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_download_single_piece() {
        let data = content(2500);
        let (mock, info) = MockPeer::seeding(data.clone(), 1000);
        let addr = mock.spawn().await;

        let manager = DownloadManager::new(info, test_config());
        assert_eq!(manager.download_piece(&[addr], 2).await.unwrap(), &data[2000..]);
        assert!(manager.download_piece(&[addr], 3).await.is_err());
    }

    #[tokio::test]
    async fn test_no_peers() {
        let (_, info) = MockPeer::seeding(content(100), 64);
        let manager = DownloadManager::new(info, test_config());
        let err = manager.download(&[], |_| {}).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::DiscoveryError { .. })));
    }

    #[tokio::test]
    async fn test_deadline_aborts_workers() {
        // accepts connections but never answers the handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (_, info) = MockPeer::seeding(content(100), 64);
        let config = Config {
            download_timeout: Some(Duration::from_millis(200)),
            read_timeout: Duration::from_secs(30),
            ..test_config()
        };
        let manager = DownloadManager::new(info, config);

        let started = Instant::now();
        let err = manager.download(&[addr], |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stats_progress() {
        let mut stats = DownloadStats::new(4, 4000, 2);
        assert_eq!(stats.progress(), 0.0);
        stats.record_piece(1000);
        stats.record_piece(1000);
        assert_eq!(stats.pieces_done, 2);
        assert!((stats.progress() - 0.5).abs() < f64::EPSILON);
        assert!(!stats.is_complete());
    }
}
