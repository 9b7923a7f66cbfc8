use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    downloader::{Collector, Config},
    error::ApplicationError,
    manager::PieceManager,
    peer::{Peer, PeerConnection},
    piece::{PieceResult, PieceWork},
};

/// Downloads pieces from a single peer until the queue runs dry.
pub struct Worker {
    index:     usize,
    peer:      Peer,
    info_hash: [u8; 20],
    peer_id:   [u8; 20],
    config:    Config,
    queue:     Arc<PieceManager>,
    collector: Arc<Collector>,
}

impl Worker {
    pub fn new(
        index:     usize,
        peer:      Peer,
        info_hash: [u8; 20],
        peer_id:   [u8; 20],
        config:    Config,
        queue:     Arc<PieceManager>,
        collector: Arc<Collector>,
    ) -> Self {
        Self {
            index,
            peer,
            info_hash,
            peer_id,
            config,
            queue,
            collector,
        }
    }

    /// Runs the worker to completion and reports its exit to the collector.
    pub async fn run(self) {
        match self.start().await {
            Ok(()) => debug!("worker {} ({}): no work left", self.index, self.peer),
            Err(e) => warn!("worker {} ({}): {}", self.index, self.peer, e),
        }
        self.collector.worker_finished();
    }

    async fn start(&self) -> Result<(), ApplicationError> {
        debug!("worker {}: connecting to {}", self.index, self.peer);
        let mut conn =
            PeerConnection::connect(&self.peer, self.info_hash, self.peer_id, &self.config).await?;
        info!("worker {}: connection to {} established", self.index, self.peer);

        // Unchoking is a courtesy here; this client never serves blocks.
        conn.send_unchoke().await?;
        conn.send_interested().await?;

        self.work_loop(&mut conn).await
    }

    /// Pulls pieces until the queue is empty.
    ///
    /// A piece the peer lacks costs one unit of ttl and goes back to the
    /// queue; a failed download goes back untouched. The piece in hand is
    /// always returned to the queue before this returns an error.
    pub async fn work_loop<S>(&self, conn: &mut PeerConnection<S>) -> Result<(), ApplicationError>
    where
        S: AsyncRead + AsyncWrite,
    {
        while let Some(mut work) = self.queue.pop().await {
            if !conn.has_piece(work.index) {
                let exhausted = consume_ttl(&mut work);
                self.queue.push_unavailable(work).await;
                exhausted?;
                tokio::task::yield_now().await;
                continue;
            }

            debug!("worker {}: downloading piece #{}", self.index, work.index);
            match conn.download(&work).await {
                Ok(content) => {
                    debug!("worker {}: piece #{} verified", self.index, work.index);
                    self.collector
                        .submit(PieceResult {
                            index: work.index,
                            worker: self.index,
                            content,
                        })
                        .await;
                }
                Err(e) if e.is_connection_lost() => {
                    self.queue.push(work).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("worker {}: piece #{} failed: {}", self.index, work.index, e);
                    self.queue.push(work).await;
                }
            }
        }

        Ok(())
    }
}

/// Records one failed availability check against `work`.
///
/// Errors once the ttl reaches zero: nobody this worker can reach will
/// supply the piece.
pub fn consume_ttl(work: &mut PieceWork) -> Result<(), ApplicationError> {
    work.ttl = work.ttl.saturating_sub(1);
    if work.ttl == 0 {
        return Err(ApplicationError::PieceUnavailable(work.index));
    }
    Ok(())
}
