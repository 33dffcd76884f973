//! Metainfo is a .torrent document with information about the torrent.
//! For magnet links, the `info` dictionary inside it is fetched from peers.
use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{AsString, SingleItemEncoder, ToBencode},
};
use sha1::{Digest, Sha1};

use crate::{
    error::Error,
    session::InfoHash,
    wire::{BlockInfo, BLOCK_LEN},
};

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub creation_date: Option<u32>,
    pub info: Info,
    /// BEP 19 web seed URLs.
    pub url_list: Option<Vec<String>>,
    /// BEP 17 style HTTP seeds, kept for torrents that still carry them.
    pub http_seeds: Option<Vec<String>>,
}

impl MetaInfo {
    /// UDP trackers from `announce` and `announce-list`, as "host:port".
    pub fn udp_trackers(&self) -> Vec<String> {
        let mut list = vec![self.announce.clone()];
        if let Some(l) = &self.announce_list {
            list.extend(l.iter().flatten().cloned());
        }

        let mut out = Vec::new();
        for t in list {
            let t = urlencoding::decode(&t).map(|v| v.to_string()).unwrap_or(t);
            let Some(uri) = t.strip_prefix("udp://") else { continue };
            let uri = match uri.find('/') {
                Some(i) => &uri[..i],
                None => uri,
            };
            if !out.iter().any(|v| v == uri) {
                out.push(uri.to_owned());
            }
        }
        out
    }

    /// Every HTTP source that serves the torrent's bytes directly.
    pub fn web_seeds(&self) -> Vec<String> {
        let mut out = Vec::new();
        for l in [&self.url_list, &self.http_seeds] {
            if let Some(l) = l {
                out.extend(l.iter().cloned());
            }
        }
        out
    }
}

/// The info dictionary. In a single file torrent `file_length` is set; in a
/// multi file torrent `files` is set and `name` is the root directory.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    pub file_length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub name: String,
    /// Length in bytes of each piece, the last piece may be shorter.
    pub piece_length: u32,
    /// Concatenation of all 20-byte SHA1 piece hashes.
    pub pieces: Vec<u8>,

    // computed while decoding, not part of the bencoded dict
    pub info_hash: InfoHash,
    /// The exact bencoded bytes of this dict, served to peers over BEP 9.
    pub raw: Vec<u8>,
}

/// Files are relative to the torrent's root name, which is not part of their
/// path.
#[derive(Debug, PartialEq, Eq, Clone, Default, Hash)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

impl Info {
    /// Compute `raw` and `info_hash` for an Info built in memory, e.g. by the
    /// torrent creator side of a test. Decoded Infos already carry both.
    pub fn finalize(mut self) -> Result<Self, Error> {
        self.raw = self.to_bencode()?;
        self.info_hash = Self::hash_of(&self.raw);
        Ok(self)
    }

    pub(crate) fn hash_of(buf: &[u8]) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(buf);
        InfoHash(hasher.finalize().into())
    }

    /// How many pieces the torrent has.
    #[inline]
    pub fn piece_count(&self) -> u32 {
        (self.pieces.len() / 20) as u32
    }

    /// The expected SHA1 of the given piece.
    pub fn piece_hash(&self, index: u32) -> [u8; 20] {
        let b = index as usize * 20;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.pieces[b..b + 20]);
        hash
    }

    /// Size in bytes of all files in the torrent.
    pub fn total_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Size in bytes of the given piece; only the last one may be shorter.
    pub fn piece_size(&self, index: u32) -> u32 {
        if index == self.piece_count() - 1 {
            let remainder = self.total_size() % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder as u32
            }
        } else {
            self.piece_length
        }
    }

    #[inline]
    pub fn blocks_per_piece(&self) -> u32 {
        self.piece_length.div_ceil(BLOCK_LEN)
    }

    /// The blocks of one piece, in order. The trailing block may be shorter
    /// than [`BLOCK_LEN`].
    pub fn block_infos_of_piece(&self, index: u32) -> Vec<BlockInfo> {
        let piece_size = self.piece_size(index);
        let num_blocks = piece_size.div_ceil(BLOCK_LEN);
        let mut blocks = Vec::with_capacity(num_blocks as usize);

        for b in 0..num_blocks {
            let begin = b * BLOCK_LEN;
            let len = if b == num_blocks - 1 {
                piece_size - begin
            } else {
                BLOCK_LEN
            };
            blocks.push(BlockInfo { index, begin, len });
        }

        blocks
    }

    /// The file table: every file with the absolute byte range it occupies.
    pub fn file_ranges(&self) -> Vec<(File, u64, u64)> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        match &self.files {
            Some(files) => {
                for f in files {
                    out.push((f.clone(), offset, offset + f.length));
                    offset += f.length;
                }
            }
            None => {
                let f = File {
                    length: self.file_length.unwrap_or(0),
                    path: vec![self.name.clone()],
                };
                out.push((f.clone(), 0, f.length));
            }
        }
        out
    }
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error> {
        let mut dict = object.try_into_dictionary()?;
        let mut length = 0;
        let mut path = vec![];

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"length", value) => {
                    length =
                        u64::decode_bencode_object(value).context("length")?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")?;
                }
                _ => {}
            }
        }

        Ok(Self { length, path })
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(file_length) = &self.file_length {
                e.emit_pair(b"length", file_length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))
        })?;
        Ok(())
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error> {
        let mut file_length = None;
        let mut files = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        // keep the raw dict around, its exact bytes are the torrent identity
        let raw = object.try_into_dictionary()?.into_raw()?.to_vec();
        let info_hash = Info::hash_of(&raw);

        let mut decoder = Decoder::new(&raw);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name =
            name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        drop(dict);
        drop(decoder);

        Ok(Info {
            file_length,
            files,
            name,
            piece_length,
            pieces,
            info_hash,
            raw,
        })
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"announce", &self.announce)?;
            if let Some(announce_list) = &self.announce_list {
                e.emit_pair(b"announce-list", announce_list)?;
            }
            if let Some(comment) = &self.comment {
                e.emit_pair(b"comment", comment)?;
            }
            if let Some(creation_date) = &self.creation_date {
                e.emit_pair(b"creation date", creation_date)?;
            }
            if let Some(seeds) = &self.http_seeds {
                e.emit_pair(b"httpseeds", seeds)?;
            }
            e.emit_pair(b"info", &self.info)?;
            if let Some(url_list) = &self.url_list {
                e.emit_pair(b"url-list", url_list)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error> {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut creation_date = None;
        let mut http_seeds = None;
        let mut url_list = None;
        let mut info = None;

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce-list")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date = u32::decode_bencode_object(value)
                        .context("creation date")
                        .map(Some)?;
                }
                (b"httpseeds", value) => {
                    http_seeds = Vec::decode_bencode_object(value)
                        .context("httpseeds")
                        .map(Some)?;
                }
                (b"url-list", value) => {
                    url_list = Vec::decode_bencode_object(value)
                        .context("url-list")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let announce = announce
            .ok_or_else(|| decoding::Error::missing_field("announce"))?;
        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo {
            announce,
            announce_list,
            comment,
            creation_date,
            info,
            url_list,
            http_seeds,
        })
    }
}
