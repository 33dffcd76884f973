//! A library for running BitTorrent V1 downloads.
//!
//! The unit of work is the [`session::Session`]: one actor per torrent that
//! owns every piece of mutable torrent state and drives it from a magnet
//! link or a metainfo file all the way to seeding. Everything around the
//! session (peers, handshakers, piece writers, the verifier, announcers)
//! runs as its own task and talks to the session exclusively through
//! channels.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use squall::{config::Config, session::{Session, Source}};
//!
//! # async fn run() -> Result<(), squall::error::Error> {
//! let config = Arc::new(Config::default());
//! let source = Source::magnet("magnet:?xt=urn:btih:...")?;
//! let (session, handle) = Session::new(config, source)?;
//!
//! tokio::spawn(session.run());
//!
//! handle.start().await?;
//! handle.notify_complete().await?.await.ok();
//! # Ok(())
//! # }
//! ```

pub mod addrlist;
pub mod allocator;
pub mod announcer;
pub mod bitfield;
pub mod blocklist;
pub mod config;
pub mod counter;
pub mod error;
pub mod extensions;
pub mod handshaker;
pub mod infodownloader;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod piececache;
pub mod piecedownloader;
pub mod piecepicker;
pub mod piecewriter;
pub mod resumer;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod utils;
pub mod verifier;
pub mod webseed;
pub mod wire;
