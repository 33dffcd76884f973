//! Durable resume state consumed through a narrow interface: persist a
//! snapshot, load it back. The session calls persist on a coalescing timer,
//! so writes stay rare even under heavy activity.
use std::path::{Path, PathBuf};

use speedy::{BigEndian, Readable, Writable};
use tokio::{fs, io::AsyncWriteExt};

use crate::error::Error;

/// One persisted view of a torrent. The bitfield is advisory; the verifier
/// remains the truth of what is on disk after a restart.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub struct Snapshot {
    pub info_hash: [u8; 20],
    /// Raw bencoded info dict, present once metadata is known. Restores
    /// magnet torrents without redownloading metadata.
    pub info_blob: Option<Vec<u8>>,
    /// The local bitfield in wire form.
    pub bitfield: Vec<u8>,
    pub downloaded: u64,
    pub uploaded: u64,
}

impl Snapshot {
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }
}

/// The family of resumers, selected at construction.
#[derive(Debug, Clone)]
pub enum Resumer {
    File(FileResumer),
}

impl Resumer {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(FileResumer { path: path.as_ref().to_owned() })
    }

    /// Persist a snapshot. Idempotent: persisting the same snapshot twice
    /// leaves the same bytes behind.
    pub async fn persist(&self, snapshot: &Snapshot) -> Result<(), Error> {
        match self {
            Resumer::File(r) => r.persist(snapshot).await,
        }
    }

    /// Load the last persisted snapshot, None if nothing was written yet.
    pub async fn load(&self) -> Result<Option<Snapshot>, Error> {
        match self {
            Resumer::File(r) => r.load().await,
        }
    }
}

/// Writes snapshots to a single file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct FileResumer {
    path: PathBuf,
}

impl FileResumer {
    async fn persist(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let bytes = snapshot.serialize()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::ResumeWrite(e.to_string()))?;
        }

        // write-then-rename keeps a crash from leaving a torn snapshot
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| Error::ResumeWrite(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::ResumeWrite(e.to_string()))?;
        file.sync_data()
            .await
            .map_err(|e| Error::ResumeWrite(e.to_string()))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::ResumeWrite(e.to_string()))?;

        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>, Error> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(Snapshot::deserialize(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;

    fn tmp_path() -> PathBuf {
        let mut rng = rand::thread_rng();
        let name: String =
            (0..12).map(|_| rng.sample(Alphanumeric) as char).collect();
        std::env::temp_dir().join(format!("squall-resume-{name}"))
    }

    #[tokio::test]
    async fn persist_load_roundtrip() {
        let path = tmp_path();
        let resumer = Resumer::file(&path);

        assert_eq!(resumer.load().await.unwrap(), None);

        let snap = Snapshot {
            info_hash: [9u8; 20],
            info_blob: Some(b"d4:name1:xe".to_vec()),
            bitfield: vec![0b1010_0000],
            downloaded: 12345,
            uploaded: 678,
        };
        resumer.persist(&snap).await.unwrap();
        assert_eq!(resumer.load().await.unwrap(), Some(snap.clone()));

        // idempotent
        resumer.persist(&snap).await.unwrap();
        assert_eq!(resumer.load().await.unwrap(), Some(snap));

        std::fs::remove_file(&path).unwrap();
    }
}
