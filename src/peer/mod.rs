//! A remote peer the client is connected to.
//!
//! Each peer runs as one task multiplexing three concerns: decoding wire
//! messages, draining the session's outbox, and housekeeping ticks
//! (keepalive, snub detection, idle timeout). Piece blocks are forwarded on
//! the session's dedicated block channel so disk back-pressure propagates
//! to the peer's TCP stream instead of the session loop.
mod types;

pub use types::*;

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use bendy::{decoding::FromBencode, encoding::ToBencode};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use hashbrown::HashSet;
use tokio::{
    net::TcpStream,
    select, spawn,
    sync::mpsc,
    time::{interval, interval_at, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::{
    bitfield::Bitfield,
    error::Error,
    extensions::{Extension, Metadata, MetadataMsgType, UT_METADATA_ID},
    handshaker::Handshaken,
    session::{SessionCtx, SessionEvent},
    wire::{BlockInfo, ExtendedMessage, Message, MessageCodec, BLOCK_LEN},
};

/// The largest block a remote may request from us.
const MAX_REQUEST_LEN: u32 = 4 * BLOCK_LEN;

/// No message at all for this long ends the connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(240);

/// What the session knows at spawn time and the peer needs up front.
#[derive(Debug, Clone)]
pub struct PeerParams {
    pub local_bitfield: Bitfield,
    pub metadata_size: Option<u32>,
    pub listen_port: u16,
    pub snub_timeout: Duration,
}

pub struct Peer {
    pub ctx: Arc<PeerCtx>,
    session: Arc<SessionCtx>,
    sink: SplitSink<Framed<TcpStream, MessageCodec>, Message>,
    stream: SplitStream<Framed<TcpStream, MessageCodec>>,
    rx: mpsc::Receiver<PeerMsg>,

    /// Requests we sent that the remote has not answered.
    outstanding: HashSet<BlockInfo>,
    sent_haves: HashSet<u32>,
    last_block_at: Instant,
    last_msg_at: Instant,
    snub_timeout: Duration,
}

impl Peer {
    /// Wire up the peer task over a handshaken socket and return its shared
    /// context. The task owns the socket; everyone else talks through the
    /// context.
    pub fn spawn(
        hs: Handshaken,
        session: Arc<SessionCtx>,
        params: PeerParams,
    ) -> Arc<PeerCtx> {
        let (tx, rx) = mpsc::channel::<PeerMsg>(256);

        let ctx = Arc::new(PeerCtx::new(
            tx,
            hs.id,
            hs.addr,
            hs.direction,
            hs.reserved[61],
            hs.reserved[43],
        ));

        let (sink, stream) = hs.socket.split();
        let peer = Peer {
            ctx: ctx.clone(),
            session,
            sink,
            stream,
            rx,
            outstanding: HashSet::new(),
            sent_haves: HashSet::new(),
            last_block_at: Instant::now(),
            last_msg_at: Instant::now(),
            snub_timeout: params.snub_timeout,
        };

        spawn(peer.run(params));

        ctx
    }

    async fn run(mut self, params: PeerParams) {
        let remote = self.ctx.remote_addr;

        if let Err(e) = self.main_loop(&params).await {
            debug!("{remote} peer loop ended: {e}");
        }

        // exactly one disconnect event per peer, whatever ended the loop
        let _ = self
            .session
            .events
            .send(SessionEvent::PeerDisconnected { addr: remote })
            .await;
    }

    async fn main_loop(&mut self, params: &PeerParams) -> Result<(), Error> {
        self.send_opening_messages(params).await?;

        let mut tick = interval(Duration::from_secs(1));
        let keepalive_period = Duration::from_secs(120);
        let mut keepalive =
            interval_at(Instant::now() + keepalive_period, keepalive_period);

        loop {
            select! {
                maybe_msg = self.stream.next() => {
                    let msg = match maybe_msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    };
                    self.last_msg_at = Instant::now();
                    self.handle_remote(msg).await?;
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_local(msg).await? {
                                return Ok(());
                            }
                        }
                        // the session dropped us
                        None => return Ok(()),
                    }
                }
                _ = tick.tick() => self.tick().await?,
                _ = keepalive.tick() => {
                    self.sink.send(Message::KeepAlive).await?;
                }
            }
        }
    }

    /// Bitfield (or have-all/have-none with the fast extension) followed by
    /// the extended handshake when both ends speak BEP 10.
    async fn send_opening_messages(
        &mut self,
        params: &PeerParams,
    ) -> Result<(), Error> {
        let bitfield = &params.local_bitfield;

        if self.ctx.supports_fast && !bitfield.is_empty() {
            if bitfield.count_ones() == bitfield.len() {
                self.sink.send(Message::HaveAll).await?;
            } else if bitfield.count_ones() == 0 {
                self.sink.send(Message::HaveNone).await?;
            } else {
                self.sink.send(Message::Bitfield(bitfield.clone())).await?;
            }
        } else if bitfield.any() {
            self.sink.send(Message::Bitfield(bitfield.clone())).await?;
        }

        if self.ctx.supports_extension_protocol {
            let ext = Extension::supported(
                params.metadata_size,
                params.listen_port,
            );
            let payload = ext.to_bencode()?;
            self.sink
                .send(Message::Extended(ExtendedMessage(0, payload)))
                .await?;
        }

        Ok(())
    }

    async fn handle_remote(&mut self, msg: Message) -> Result<(), Error> {
        let addr = self.ctx.remote_addr;

        match msg {
            Message::KeepAlive => trace!("{addr} keepalive"),
            Message::Choke => {
                self.ctx.peer_choking.store(true, Ordering::Relaxed);
                self.outstanding.clear();
                self.event(SessionEvent::PeerChoked { addr }).await;
            }
            Message::Unchoke => {
                self.ctx.peer_choking.store(false, Ordering::Relaxed);
                self.event(SessionEvent::PeerUnchoked { addr }).await;
            }
            Message::Interested => {
                self.ctx.peer_interested.store(true, Ordering::Relaxed);
                self.event(SessionEvent::PeerInterested {
                    addr,
                    interested: true,
                })
                .await;
            }
            Message::NotInterested => {
                self.ctx.peer_interested.store(false, Ordering::Relaxed);
                self.event(SessionEvent::PeerInterested {
                    addr,
                    interested: false,
                })
                .await;
            }
            Message::Have(piece) => {
                self.event(SessionEvent::PeerHave { addr, piece }).await;
            }
            Message::Bitfield(bitfield) => {
                self.event(SessionEvent::PeerBitfield { addr, bitfield })
                    .await;
            }
            Message::HaveAll => {
                if !self.ctx.supports_fast {
                    return Err(Error::ProtocolViolation);
                }
                self.event(SessionEvent::PeerHaveAll { addr }).await;
            }
            Message::HaveNone => {
                if !self.ctx.supports_fast {
                    return Err(Error::ProtocolViolation);
                }
                self.event(SessionEvent::PeerHaveNone { addr }).await;
            }
            Message::Request(info) => {
                if info.len > MAX_REQUEST_LEN {
                    warn!("{addr} requested an oversized block");
                    return Err(Error::ProtocolViolation);
                }
                self.event(SessionEvent::BlockRequested { addr, info }).await;
            }
            Message::Piece(block) => {
                self.outstanding.remove(&block.info());
                self.last_block_at = Instant::now();
                self.ctx.snubbed.store(false, Ordering::Relaxed);

                let len = block.data.len() as u64;
                self.ctx.counter.record_download(len);
                self.session.counter.record_download(len);

                // blocks ride their own channel; when the writer pool lags
                // the session stops draining it and TCP pushes back on the
                // remote through this await
                let _ = self.session.blocks.send((addr, block)).await;
            }
            Message::Cancel(info) => {
                self.event(SessionEvent::BlockRequestCancelled { addr, info })
                    .await;
            }
            Message::Reject(info) => {
                if !self.ctx.supports_fast {
                    return Err(Error::ProtocolViolation);
                }
                debug!("{addr} rejected {info:?}");
                self.outstanding.remove(&info);
            }
            Message::Suggest(piece) => trace!("{addr} suggests {piece}"),
            Message::AllowedFast(piece) => {
                trace!("{addr} allows fast {piece}")
            }
            Message::Port(port) => trace!("{addr} dht port {port}"),
            Message::Extended(ExtendedMessage(ext_id, payload)) => {
                self.handle_extended(ext_id, payload).await?;
            }
        }

        Ok(())
    }

    async fn handle_extended(
        &mut self,
        ext_id: u8,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let addr = self.ctx.remote_addr;

        match ext_id {
            // the extended handshake itself
            0 => {
                let ext = Extension::from_bencode(&payload)?;
                debug!("{addr} extended handshake {ext:?}");
                self.event(SessionEvent::ExtendedHandshake { addr, ext })
                    .await;
            }
            UT_METADATA_ID => {
                let (dict, rest) = Metadata::extract(payload)?;
                match dict.msg_type {
                    MetadataMsgType::Data => {
                        self.event(SessionEvent::MetadataPiece {
                            addr,
                            piece: dict.piece,
                            payload: rest,
                        })
                        .await;
                    }
                    MetadataMsgType::Request => {
                        self.event(SessionEvent::MetadataRequest {
                            addr,
                            piece: dict.piece,
                        })
                        .await;
                    }
                    MetadataMsgType::Reject => {
                        self.event(SessionEvent::MetadataRejected {
                            addr,
                            piece: dict.piece,
                        })
                        .await;
                    }
                }
            }
            other => debug!("{addr} unknown extension id {other}"),
        }

        Ok(())
    }

    /// Returns true when the peer should shut down cleanly.
    async fn handle_local(&mut self, msg: PeerMsg) -> Result<bool, Error> {
        match msg {
            PeerMsg::Send(msg) => {
                self.sink.send(msg).await?;
            }
            PeerMsg::RequestBlocks(infos) => {
                let cancelled: Vec<BlockInfo> = {
                    let mut set = self.ctx.cancelled.lock().unwrap();
                    infos
                        .iter()
                        .filter(|i| set.remove(*i))
                        .copied()
                        .collect()
                };

                for info in infos {
                    if cancelled.contains(&info) {
                        continue;
                    }
                    self.outstanding.insert(info);
                    self.sink.send(Message::Request(info)).await?;
                }
            }
            PeerMsg::Have(piece) => {
                if self.sent_haves.insert(piece) {
                    self.sink.send(Message::Have(piece)).await?;
                }
            }
            PeerMsg::Cancel(info) => {
                self.outstanding.remove(&info);
                self.ctx.cancelled.lock().unwrap().remove(&info);
                self.sink.send(Message::Cancel(info)).await?;
            }
            PeerMsg::Choke => {
                self.ctx.am_choking.store(true, Ordering::Relaxed);
                self.sink.send(Message::Choke).await?;
            }
            PeerMsg::Unchoke => {
                self.ctx.am_choking.store(false, Ordering::Relaxed);
                self.sink.send(Message::Unchoke).await?;
            }
            PeerMsg::Interested => {
                self.ctx.am_interested.store(true, Ordering::Relaxed);
                self.sink.send(Message::Interested).await?;
            }
            PeerMsg::NotInterested => {
                self.ctx.am_interested.store(false, Ordering::Relaxed);
                self.sink.send(Message::NotInterested).await?;
            }
            PeerMsg::Shutdown => {
                debug!("{} shutting down", self.ctx.remote_addr);
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn tick(&mut self) -> Result<(), Error> {
        // snub: a request is outstanding and no block arrived for too long
        if !self.outstanding.is_empty()
            && self.last_block_at.elapsed() >= self.snub_timeout
            && !self.ctx.snubbed.swap(true, Ordering::Relaxed)
        {
            let addr = self.ctx.remote_addr;
            warn!("{addr} snubbed us");
            self.event(SessionEvent::PeerSnubbed { addr }).await;
        }

        if self.last_msg_at.elapsed() >= IDLE_TIMEOUT {
            return Err(Error::PeerIdle);
        }

        Ok(())
    }

    async fn event(&self, event: SessionEvent) {
        let _ = self.session.events.send(event).await;
    }
}
