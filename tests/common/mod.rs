//! Shared helpers for the engine tests: deterministic torrent content, a
//! scriptable loopback seeder and a minimal HTTP range server for web
//! seeds.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use futures::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    spawn,
};
use tokio_util::codec::{Framed, FramedParts};

use bendy::encoding::ToBencode;

use squall::{
    bitfield::{Bitfield, BitfieldExt},
    extensions::{Extension, Metadata, MetadataMsgType, M, UT_METADATA_ID},
    metainfo::Info,
    peer::PeerId,
    wire::{
        Block, ExtendedMessage, Handshake, HandshakeCodec, Message,
        MessageCodec,
    },
};

/// The ut_metadata id the scripted seeder registers for itself.
const SEEDER_METADATA_ID: u8 = 1;

pub fn tmp_dir(prefix: &str) -> PathBuf {
    let mut rng = rand::thread_rng();
    let name: String =
        (0..12).map(|_| rng.sample(Alphanumeric) as char).collect();
    std::env::temp_dir().join(format!("squall-{prefix}-{name}"))
}

/// Deterministic content so the test and the seeder agree byte for byte.
pub fn make_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) % 251) as u8).collect()
}

/// Build a finalized single-file Info over the given content.
pub fn make_info(name: &str, piece_length: u32, content: &[u8]) -> Info {
    let mut pieces = Vec::new();
    for chunk in content.chunks(piece_length as usize) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        let hash: [u8; 20] = hasher.finalize().into();
        pieces.extend_from_slice(&hash);
    }

    Info {
        name: name.to_owned(),
        piece_length,
        pieces,
        file_length: Some(content.len() as u64),
        ..Default::default()
    }
    .finalize()
    .unwrap()
}

#[derive(Debug, Clone, Default)]
pub struct SeederOpts {
    /// Answer metadata requests over BEP 9.
    pub serve_metadata: bool,
    /// Deliver the first block of piece 0 corrupted, once.
    pub corrupt_first_block_once: bool,
    /// Serve this many blocks, then ignore further requests.
    pub max_blocks: Option<usize>,
    /// Serve exactly one block, then ignore further requests.
    pub silent_after_first_block: bool,
}

pub struct Seeder {
    pub addr: SocketAddr,
    /// Piece indices of every request received, in order.
    pub requests: Arc<Mutex<Vec<u32>>>,
}

/// A scripted remote peer that owns the full content of a torrent. Accepts
/// any number of connections and speaks just enough of the protocol to feed
/// a downloading session.
pub async fn spawn_seeder(
    info: Info,
    content: Vec<u8>,
    opts: SeederOpts,
) -> Seeder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let log = requests.clone();
    spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            let info = info.clone();
            let content = content.clone();
            let opts = opts.clone();
            let log = log.clone();
            spawn(async move {
                let _ = serve_connection(socket, info, content, opts, log)
                    .await;
            });
        }
    });

    Seeder { addr, requests }
}

async fn serve_connection(
    socket: TcpStream,
    info: Info,
    content: Vec<u8>,
    opts: SeederOpts,
    log: Arc<Mutex<Vec<u32>>>,
) -> Option<()> {
    // handshake, then swap to the message codec keeping buffered bytes
    let mut framed = Framed::new(socket, HandshakeCodec);
    let theirs = framed.next().await?.ok()?;
    assert_eq!(theirs.info_hash, info.info_hash);

    framed
        .send(Handshake::new(info.info_hash.clone(), PeerId::gen()))
        .await
        .ok()?;

    let old_parts = framed.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    // we are a full seeder
    let piece_count = info.piece_count() as usize;
    let mut bitfield = Bitfield::from_piece_count(piece_count);
    for i in 0..piece_count {
        bitfield.set(i, true);
    }
    socket.send(Message::Bitfield(bitfield)).await.ok()?;

    if opts.serve_metadata {
        let ext = Extension {
            m: M { ut_metadata: Some(SEEDER_METADATA_ID), ut_pex: None },
            metadata_size: Some(info.raw.len() as u32),
            v: Some("scripted seeder".into()),
            p: None,
            reqq: Some(250),
        };
        let payload = ext.to_bencode().ok()?;
        socket
            .send(Message::Extended(ExtendedMessage(0, payload)))
            .await
            .ok()?;
    }

    let mut client_metadata_id = UT_METADATA_ID;
    let mut served_blocks = 0usize;
    let mut corrupted_once = false;

    loop {
        let msg = socket.next().await?.ok()?;
        match msg {
            Message::Interested => {
                socket.send(Message::Unchoke).await.ok()?;
            }
            Message::Request(req) => {
                log.lock().unwrap().push(req.index);

                if opts.silent_after_first_block && served_blocks >= 1 {
                    continue;
                }
                if let Some(max) = opts.max_blocks {
                    if served_blocks >= max {
                        continue;
                    }
                }

                let start = req.index as usize
                    * info.piece_length as usize
                    + req.begin as usize;
                let end = (start + req.len as usize).min(content.len());
                let mut data = content.get(start..end)?.to_vec();

                if opts.corrupt_first_block_once
                    && req.index == 0
                    && req.begin == 0
                    && !corrupted_once
                {
                    corrupted_once = true;
                    data[0] ^= 0xff;
                }

                served_blocks += 1;
                socket
                    .send(Message::Piece(Block {
                        index: req.index,
                        begin: req.begin,
                        data,
                    }))
                    .await
                    .ok()?;
            }
            Message::Extended(ExtendedMessage(0, payload)) => {
                use bendy::decoding::FromBencode;
                if let Ok(ext) = Extension::from_bencode(&payload) {
                    if let Some(id) = ext.m.ut_metadata {
                        client_metadata_id = id;
                    }
                }
            }
            Message::Extended(ExtendedMessage(id, payload))
                if id == SEEDER_METADATA_ID =>
            {
                let (dict, _) = Metadata::extract(payload).ok()?;
                if dict.msg_type != MetadataMsgType::Request {
                    continue;
                }

                let total = info.raw.len() as u32;
                let begin = (dict.piece * 16384).min(total) as usize;
                let end = (begin + 16384).min(total as usize);
                let payload =
                    Metadata::data(dict.piece, total, &info.raw[begin..end])
                        .ok()?;
                socket
                    .send(Message::Extended(ExtendedMessage(
                        client_metadata_id,
                        payload,
                    )))
                    .await
                    .ok()?;
            }
            // keepalives, haves, cancels and such need no reaction
            _ => {}
        }
    }
}

/// A minimal HTTP server answering range requests over one blob, enough to
/// act as a web seed.
pub async fn spawn_http_seed(content: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let content = content.clone();

            spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }

                let head = String::from_utf8_lossy(&buf);
                let range = head
                    .lines()
                    .find(|l| l.to_ascii_lowercase().starts_with("range:"))
                    .and_then(|l| l.split('=').nth(1))
                    .and_then(|r| {
                        let (a, b) = r.trim().split_once('-')?;
                        Some((
                            a.parse::<usize>().ok()?,
                            b.parse::<usize>().ok()?,
                        ))
                    });

                let (status, body) = match range {
                    Some((a, b)) if a <= b && b < content.len() => {
                        ("206 Partial Content", content[a..=b].to_vec())
                    }
                    Some(_) => ("416 Range Not Satisfiable", Vec::new()),
                    None => ("200 OK", content.clone()),
                };

                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.flush().await;
            });
        }
    });

    addr
}
