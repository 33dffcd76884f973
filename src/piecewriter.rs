//! A fixed pool of workers that serialize piece writes to storage.
//!
//! The session hands over verified piece buffers and counts how many are in
//! flight; while the pool is saturated it stops draining the block channel,
//! which is the engine's back-pressure path against slow disks.
use std::sync::Arc;

use tokio::{
    spawn,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    error::Error,
    session::SessionEvent,
    storage::Storage,
};

#[derive(Debug)]
pub struct WriteJob {
    pub index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct PieceWriterPool {
    tx: mpsc::Sender<WriteJob>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
}

impl PieceWriterPool {
    /// Spawn `size` writer workers over shared storage. Results come back as
    /// [`SessionEvent::PieceWritten`]. Dropping the pool lets in-flight
    /// writes complete; their results are simply discarded.
    pub fn spawn(
        size: usize,
        storage: Arc<Storage>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<WriteJob>(size.max(1) * 2);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let storage = storage.clone();
                let events = events.clone();

                spawn(async move {
                    loop {
                        // hold the lock only while waiting for a job so the
                        // pool members drain the queue in parallel
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };

                        debug!(
                            "writer {worker} writing piece {} ({} bytes)",
                            job.index,
                            job.data.len()
                        );

                        let result =
                            storage.write_piece(job.index, &job.data).await;

                        let _ = events
                            .send(SessionEvent::PieceWritten {
                                index: job.index,
                                result,
                            })
                            .await;
                    }
                })
            })
            .collect();

        Self { tx, workers, size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a write. The session keeps its in-flight count at or below the
    /// pool size, so the queue always has room.
    pub fn submit(&self, index: u32, data: Vec<u8>) -> Result<(), Error> {
        self.tx
            .try_send(WriteJob { index, data })
            .map_err(|_| Error::StorageUnusable("writer pool gone".into()))
    }

    pub fn abort(&self) {
        for w in &self.workers {
            w.abort();
        }
    }
}
