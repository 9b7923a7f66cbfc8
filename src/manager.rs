use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::piece::PieceWork;
use crate::torrent::Torrent;

/// Shared queue of pieces that still need a verified download.
///
/// Workers take one piece at a time and hand it back on failure, so a piece
/// is either in the queue, held by exactly one worker, or done.
pub struct PieceManager {
    queue: Mutex<VecDeque<PieceWork>>,
}

impl PieceManager {
    /// One work item per piece of `torrent`, each starting with `ttl` checks.
    pub fn new(torrent: &Torrent, ttl: u32) -> Self {
        let work = (0..torrent.piece_count())
            .map(|i| PieceWork::new(i as u32, torrent.piece_hashes[i], torrent.piece_size(i), ttl))
            .collect();
        Self::from_work(work)
    }

    pub fn from_work(work: Vec<PieceWork>) -> Self {
        Self {
            queue: Mutex::new(work.into()),
        }
    }

    /// Takes the most recently queued piece, or `None` once the queue is drained.
    pub async fn pop(&self) -> Option<PieceWork> {
        self.queue.lock().await.pop_back()
    }

    /// Returns a piece whose download attempt failed; it is the next one handed out.
    pub async fn push(&self, work: PieceWork) {
        self.queue.lock().await.push_back(work);
    }

    /// Parks a piece the current peer does not have behind everything else,
    /// so that worker draws a different piece on its next pop.
    pub async fn push_unavailable(&self, work: PieceWork) {
        self.queue.lock().await.push_front(work);
    }
}
