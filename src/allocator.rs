//! One-shot worker that creates and preallocates every file of the torrent.
use std::sync::Arc;

use tokio::{spawn, sync::{mpsc, watch}, task::JoinHandle};
use tracing::debug;

use crate::{session::SessionEvent, storage::Storage};

pub struct Allocator;

impl Allocator {
    /// Open or create every file at its full length, reporting per-file
    /// progress and finally `AllocatorDone(Ok(needs_verification))`, where
    /// `needs_verification` is true when any file already held data.
    pub fn spawn(
        storage: Arc<Storage>,
        events: mpsc::Sender<SessionEvent>,
        close: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        spawn(async move {
            let mut needs_verification = false;

            for file in 0..storage.file_count() {
                if *close.borrow() {
                    return;
                }

                match storage.allocate_file(file).await {
                    Ok(existed) => {
                        needs_verification |= existed;
                        let _ = events
                            .send(SessionEvent::AllocatorProgress { file })
                            .await;
                    }
                    Err(e) => {
                        let _ = events
                            .send(SessionEvent::AllocatorDone(Err(e)))
                            .await;
                        return;
                    }
                }
            }

            debug!("allocated, needs_verification: {needs_verification}");
            let _ = events
                .send(SessionEvent::AllocatorDone(Ok(needs_verification)))
                .await;
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;
    use crate::metainfo::{File, Info};

    #[tokio::test]
    async fn reports_progress_then_done() {
        let mut rng = rand::thread_rng();
        let name: String =
            (0..12).map(|_| rng.sample(Alphanumeric) as char).collect();
        let dir = std::env::temp_dir().join(format!("squall-alloc-{name}"));

        let info = Info {
            name: "t".into(),
            piece_length: 4,
            pieces: vec![0u8; 40],
            files: Some(vec![
                File { length: 4, path: vec!["a".into()] },
                File { length: 4, path: vec!["b".into()] },
            ]),
            ..Default::default()
        };
        let storage = Arc::new(Storage::file(&dir, &info));

        let (tx, mut rx) = mpsc::channel(8);
        let (_close_tx, close_rx) = watch::channel(false);
        Allocator::spawn(storage, tx, close_rx);

        let mut files = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                SessionEvent::AllocatorProgress { file } => files.push(file),
                SessionEvent::AllocatorDone(res) => {
                    assert!(!res.unwrap());
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(files, vec![0, 1]);
        assert!(dir.join("t/a").is_file());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
