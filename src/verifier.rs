//! One-shot worker that hash checks the pieces already on disk.
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::{spawn, sync::{mpsc, watch}, task::JoinHandle};
use tracing::debug;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    session::SessionEvent,
    storage::Storage,
};

pub struct Verifier;

impl Verifier {
    /// Read every piece, compute its SHA1 and build the local bitfield. A
    /// piece that cannot be read simply counts as missing. The session does
    /// not enter Running until `VerifierDone` arrives.
    pub fn spawn(
        storage: Arc<Storage>,
        hashes: Vec<[u8; 20]>,
        events: mpsc::Sender<SessionEvent>,
        close: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        spawn(async move {
            let mut bitfield = Bitfield::from_piece_count(hashes.len());

            for (index, expected) in hashes.iter().enumerate() {
                if *close.borrow() {
                    return;
                }

                if let Ok(data) = storage.read_piece(index as u32).await {
                    let mut hasher = Sha1::new();
                    hasher.update(&data);
                    let got: [u8; 20] = hasher.finalize().into();
                    bitfield.set(index, got == *expected);
                }

                let _ = events
                    .send(SessionEvent::VerifierProgress {
                        piece: index as u32,
                    })
                    .await;
            }

            debug!(
                "verified {}/{} pieces",
                bitfield.count_ones(),
                bitfield.len()
            );
            let _ =
                events.send(SessionEvent::VerifierDone(Ok(bitfield))).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;
    use crate::metainfo::Info;

    #[tokio::test]
    async fn verified_bitfield_matches_disk() {
        let mut rng = rand::thread_rng();
        let name: String =
            (0..12).map(|_| rng.sample(Alphanumeric) as char).collect();
        let dir = std::env::temp_dir().join(format!("squall-verify-{name}"));

        // two pieces of 4 bytes; only piece 0 gets the expected content
        let good = [1u8, 2, 3, 4];
        let mut hasher = Sha1::new();
        hasher.update(good);
        let good_hash: [u8; 20] = hasher.finalize().into();

        let mut pieces = good_hash.to_vec();
        pieces.extend_from_slice(&[0u8; 20]);

        let info = Info {
            name: "v.bin".into(),
            piece_length: 4,
            pieces,
            file_length: Some(8),
            ..Default::default()
        };
        let storage = Arc::new(Storage::file(&dir, &info));
        storage.allocate_file(0).await.unwrap();
        storage.write_piece(0, &good).await.unwrap();
        storage.write_piece(1, &[9, 9, 9, 9]).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (_close_tx, close_rx) = watch::channel(false);
        Verifier::spawn(
            storage,
            vec![good_hash, [0u8; 20]],
            tx,
            close_rx,
        );

        let mut progressed = 0;
        loop {
            match rx.recv().await.unwrap() {
                SessionEvent::VerifierProgress { .. } => progressed += 1,
                SessionEvent::VerifierDone(res) => {
                    let bitfield = res.unwrap();
                    assert_eq!(bitfield.len(), 2);
                    assert!(bitfield[0]);
                    assert!(!bitfield[1]);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(progressed, 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
