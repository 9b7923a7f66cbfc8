use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::future::join_all;
use tokio::sync::{oneshot, Mutex};

use crate::{
    error::ApplicationError,
    manager::PieceManager,
    peer::{Peer, BLOCK_SIZE, MAX_PENDING_REQUESTS},
    piece::{PieceResult, PIECE_TTL},
    torrent::Torrent,
    worker::Worker,
};

/// Time allowed for a TCP connect to a peer
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for any single message read from a peer
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Download tunables shared by every worker
#[derive(Debug, Clone)]
pub struct Config {
    pub connect_timeout:      Duration,
    pub read_timeout:         Duration,
    pub max_pending_requests: usize,
    pub block_size:           usize,
    pub piece_ttl:            u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout:      CONNECT_TIMEOUT,
            read_timeout:         READ_TIMEOUT,
            max_pending_requests: MAX_PENDING_REQUESTS,
            block_size:           BLOCK_SIZE,
            piece_ttl:            PIECE_TTL,
        }
    }
}

/// How a download run ended
#[derive(Debug)]
pub enum Outcome {
    /// Every piece was downloaded and verified; order is arbitrary
    Complete(Vec<PieceResult>),
    /// Every worker exited before the last piece arrived
    Failed,
}

/// Delivers the first terminal signal and swallows the rest.
struct Completion {
    fired: AtomicBool,
    tx:    std::sync::Mutex<Option<oneshot::Sender<bool>>>,
}

impl Completion {
    fn new(tx: oneshot::Sender<bool>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            tx:    std::sync::Mutex::new(Some(tx)),
        }
    }

    fn fire(&self, complete: bool) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let sender = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            let _ = tx.send(complete);
        }
    }
}

/// Verified pieces and the count of workers still running.
pub struct Collector {
    total:   usize,
    results: Mutex<Vec<PieceResult>>,
    live:    AtomicUsize,
    done:    Completion,
}

impl Collector {
    pub fn new(total: usize, workers: usize, tx: oneshot::Sender<bool>) -> Self {
        Self {
            total,
            results: Mutex::new(Vec::with_capacity(total)),
            live: AtomicUsize::new(workers),
            done: Completion::new(tx),
        }
    }

    pub async fn submit(&self, result: PieceResult) {
        let (index, worker) = (result.index, result.worker);
        let mut results = self.results.lock().await;
        results.push(result);

        let count = results.len();
        info!(
            "## piece #{} from worker {}: {:.2}% complete, {} workers running",
            index,
            worker,
            count as f64 / self.total as f64 * 100.0,
            self.live.load(Ordering::Acquire)
        );

        if count == self.total {
            self.done.fire(true);
        }
    }

    /// Called once per worker, whether it drained the queue or gave up.
    pub fn worker_finished(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.fire(false);
        }
    }

    async fn take_results(&self) -> Vec<PieceResult> {
        std::mem::take(&mut *self.results.lock().await)
    }
}

/// Downloads every piece of a torrent from a fixed set of peers.
pub struct Downloader {
    torrent: Torrent,
    peers:   Vec<Peer>,
    config:  Config,
}

impl Downloader {
    pub fn new(torrent: Torrent, peers: Vec<Peer>, config: Config) -> Self {
        Self {
            torrent,
            peers,
            config,
        }
    }

    /// Spawns one worker per peer and waits until either every piece is
    /// verified or every worker is gone, whichever happens first.
    pub async fn start(self) -> Result<Outcome, ApplicationError> {
        let total = self.torrent.piece_count();
        if total == 0 {
            return Ok(Outcome::Complete(Vec::new()));
        }
        if self.peers.is_empty() {
            error!("no peers to download from");
            return Ok(Outcome::Failed);
        }

        info!("start downloading {} pieces from {} peers", total, self.peers.len());

        let queue = Arc::new(PieceManager::new(&self.torrent, self.config.piece_ttl));
        let (tx, rx) = oneshot::channel();
        let collector = Arc::new(Collector::new(total, self.peers.len(), tx));

        let started = Instant::now();
        let handles: Vec<_> = self
            .peers
            .iter()
            .enumerate()
            .map(|(i, peer)| {
                let worker = Worker::new(
                    i,
                    peer.clone(),
                    self.torrent.info_hash,
                    self.torrent.peer_id,
                    self.config.clone(),
                    queue.clone(),
                    collector.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let complete = rx
            .await
            .map_err(|_| ApplicationError::WorkerError("completion signal dropped".into()))?;

        // Workers may still be connecting or parked on reads.
        for handle in &handles {
            handle.abort();
        }
        join_all(handles).await;

        if complete {
            info!("All done, took {:.2}s", started.elapsed().as_secs_f64());
            Ok(Outcome::Complete(collector.take_results().await))
        } else {
            error!("All workers errored out");
            Ok(Outcome::Failed)
        }
    }
}
