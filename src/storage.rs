//! On-disk storage consumed by the session through a narrow interface:
//! open/allocate files, positioned block reads and writes, flush. Mapping
//! piece offsets to file offsets across file boundaries happens here.
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{
    error::Error,
    metainfo::Info,
    wire::BlockInfo,
};

/// The family of storage backends, selected at construction.
#[derive(Debug)]
pub enum Storage {
    File(FileStorage),
}

impl Storage {
    pub fn file(download_dir: impl AsRef<Path>, info: &Info) -> Storage {
        Storage::File(FileStorage::new(download_dir, info))
    }

    pub fn file_count(&self) -> usize {
        match self {
            Storage::File(s) => s.table.files.len(),
        }
    }

    /// Create or open the nth file at its full length. Returns whether the
    /// file already existed with data in it.
    pub async fn allocate_file(&self, index: usize) -> Result<bool, Error> {
        match self {
            Storage::File(s) => s.allocate_file(index).await,
        }
    }

    pub async fn write_block(
        &self,
        piece: u32,
        begin: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        match self {
            Storage::File(s) => s.write_block(piece, begin, data).await,
        }
    }

    pub async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<(), Error> {
        self.write_block(piece, 0, data).await
    }

    pub async fn read_block(&self, info: &BlockInfo) -> Result<Vec<u8>, Error> {
        match self {
            Storage::File(s) => {
                s.read(info.index, info.begin, info.len as u64).await
            }
        }
    }

    pub async fn read_piece(&self, piece: u32) -> Result<Vec<u8>, Error> {
        match self {
            Storage::File(s) => {
                let len = s.table.piece_size(piece) as u64;
                s.read(piece, 0, len).await
            }
        }
    }

    /// Nothing is buffered by the file backend, every write lands before its
    /// result is reported; kept for backends that do buffer.
    pub async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// The file table of a torrent, with absolute byte offsets resolved.
#[derive(Debug, Clone)]
pub struct FileTable {
    pub files: Vec<FileEntry>,
    pub piece_length: u32,
    pub total_size: u64,
    piece_count: u32,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the download directory, root name included.
    pub rel_path: PathBuf,
    pub length: u64,
    /// Absolute offset of the file's first byte within the torrent.
    pub offset: u64,
}

/// A byte range within one file, produced by mapping a torrent range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileSpan {
    pub file: usize,
    pub offset: u64,
    pub len: u64,
}

impl FileTable {
    pub fn from_info(info: &Info) -> Self {
        let mut files = Vec::new();
        let mut offset = 0u64;

        match &info.files {
            Some(list) => {
                for f in list {
                    let mut rel_path = PathBuf::from(&info.name);
                    for p in &f.path {
                        rel_path.push(p);
                    }
                    files.push(FileEntry { rel_path, length: f.length, offset });
                    offset += f.length;
                }
            }
            None => {
                files.push(FileEntry {
                    rel_path: PathBuf::from(&info.name),
                    length: info.file_length.unwrap_or(0),
                    offset: 0,
                });
            }
        }

        Self {
            files,
            piece_length: info.piece_length,
            total_size: info.total_size(),
            piece_count: info.piece_count(),
        }
    }

    pub fn piece_size(&self, piece: u32) -> u32 {
        if piece == self.piece_count - 1 {
            let rem = self.total_size % self.piece_length as u64;
            if rem == 0 {
                self.piece_length
            } else {
                rem as u32
            }
        } else {
            self.piece_length
        }
    }

    /// Absolute offset of a block within the torrent.
    pub fn abs_offset(&self, piece: u32, begin: u32) -> u64 {
        piece as u64 * self.piece_length as u64 + begin as u64
    }

    /// Map a torrent byte range onto the files it crosses, in order.
    pub fn spans(&self, abs_offset: u64, len: u64) -> Result<Vec<FileSpan>, Error> {
        if abs_offset + len > self.total_size {
            return Err(Error::OffsetOutOfBounds);
        }

        let mut out = Vec::new();
        let mut cursor = abs_offset;
        let mut remaining = len;

        for (i, f) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let file_end = f.offset + f.length;
            if cursor >= file_end || f.length == 0 {
                continue;
            }

            let within = cursor - f.offset;
            let take = remaining.min(f.length - within);
            out.push(FileSpan { file: i, offset: within, len: take });
            cursor += take;
            remaining -= take;
        }

        if remaining > 0 {
            return Err(Error::OffsetOutOfBounds);
        }
        Ok(out)
    }
}

/// Plain files under the download directory.
#[derive(Debug)]
pub struct FileStorage {
    download_dir: PathBuf,
    pub table: FileTable,
}

impl FileStorage {
    pub fn new(download_dir: impl AsRef<Path>, info: &Info) -> Self {
        Self {
            download_dir: download_dir.as_ref().to_owned(),
            table: FileTable::from_info(info),
        }
    }

    fn path_of(&self, file: usize) -> PathBuf {
        self.download_dir.join(&self.table.files[file].rel_path)
    }

    async fn open(&self, file: usize) -> Result<File, Error> {
        let path = self.path_of(file);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|_| Error::FileOpen(path.to_string_lossy().into_owned()))
    }

    async fn allocate_file(&self, index: usize) -> Result<bool, Error> {
        let path = self.path_of(index);
        let existed = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        let file = self.open(index).await?;
        file.set_len(self.table.files[index].length).await?;

        Ok(existed)
    }

    async fn write_block(
        &self,
        piece: u32,
        begin: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let abs = self.table.abs_offset(piece, begin);
        let mut written = 0usize;

        for span in self.table.spans(abs, data.len() as u64)? {
            let mut file = self.open(span.file).await?;
            file.seek(SeekFrom::Start(span.offset)).await?;
            file.write_all(&data[written..written + span.len as usize])
                .await?;
            file.flush().await?;
            written += span.len as usize;
        }

        Ok(())
    }

    async fn read(&self, piece: u32, begin: u32, len: u64) -> Result<Vec<u8>, Error> {
        let abs = self.table.abs_offset(piece, begin);
        let mut buf = vec![0u8; len as usize];
        let mut read = 0usize;

        for span in self.table.spans(abs, len)? {
            let mut file = self.open(span.file).await?;
            file.seek(SeekFrom::Start(span.offset)).await?;
            file.read_exact(&mut buf[read..read + span.len as usize]).await?;
            read += span.len as usize;
        }

        Ok(buf)
    }
}
