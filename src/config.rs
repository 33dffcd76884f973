//! Engine configuration.
//!
//! A [`Config`] is built once by the embedding program and injected into every
//! [`crate::session::Session`] at construction. Nothing in this crate reads
//! process-global state.
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Root folder in which torrent files are placed.
    pub download_dir: String,

    /// TCP port the session listens on for peer connections. 0 lets the OS
    /// pick one; the bound port is reported through the listen notification.
    pub port: u16,

    /// Maximum number of connected peers per torrent.
    pub max_peers: u32,

    /// Regular unchoke slots recomputed on every unchoke tick.
    pub unchoke_slots: usize,

    /// Outstanding block requests kept in flight per piece downloader.
    pub request_queue_len: usize,

    /// Hard cap on outstanding block requests summed over all peers.
    pub pending_requests_cap: usize,

    /// When fewer than this many pieces are missing, endgame mode starts.
    pub endgame_threshold: u32,

    /// How many peers may download the same piece during endgame.
    pub endgame_duplicates: u32,

    /// Number of leading pieces downloaded in order before rarest-first
    /// applies. 0 disables the sequential head.
    pub sequential_head: u32,

    /// Seconds a handshake may take before the connection is dropped.
    pub handshake_timeout_secs: u64,

    /// Seconds without a block, with requests outstanding, before a peer is
    /// snubbed.
    pub snub_timeout_secs: u64,

    /// Size of the piece writer pool.
    pub piece_writers: usize,

    /// Upper bound in bytes for the upload block cache.
    pub piece_cache_bytes: u64,

    /// Bounds applied to the announce interval returned by trackers.
    pub min_announce_interval_secs: u64,
    pub max_announce_interval_secs: u64,

    /// Seconds between resume snapshot writes while the torrent is active.
    pub resume_write_interval_secs: u64,

    /// Seconds between byte-stat writes to the resumer.
    pub stats_write_interval_secs: u64,

    /// Upper bound of the candidate address list.
    pub max_addrs: usize,

    /// Allow more than one connection from the same IP.
    pub allow_multiple_per_ip: bool,

    /// HTTP sources that serve the torrent's bytes directly.
    pub web_seeds: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "downloads".to_owned(),
            port: 51413,
            max_peers: 50,
            unchoke_slots: 4,
            request_queue_len: 10,
            pending_requests_cap: 500,
            endgame_threshold: 8,
            endgame_duplicates: 3,
            sequential_head: 0,
            handshake_timeout_secs: 10,
            snub_timeout_secs: 60,
            piece_writers: 4,
            piece_cache_bytes: 16 * 1024 * 1024,
            min_announce_interval_secs: 60,
            max_announce_interval_secs: 1800,
            resume_write_interval_secs: 30,
            stats_write_interval_secs: 15,
            max_addrs: 1000,
            allow_multiple_per_ip: false,
            web_seeds: Vec::new(),
        }
    }
}

impl Config {
    /// Load the configuration, layering an optional config file under
    /// environment variables. Unset values fall back to [`Config::default`].
    pub fn load(config_file: Option<&str>) -> Result<Self, Error> {
        let defaults = Config::default();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?);

        if let Some(file) = config_file {
            builder =
                builder.add_source(config::File::with_name(file).required(false));
        }

        builder
            .add_source(config::Environment::with_prefix("SQUALL"))
            .build()?
            .try_deserialize::<Config>()
            .map_err(Error::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.unchoke_slots > 0);
        assert!(c.request_queue_len > 0);
        assert!(c.min_announce_interval_secs <= c.max_announce_interval_secs);
    }

    #[test]
    fn load_without_file_matches_defaults() {
        let c = Config::load(None).unwrap();
        assert_eq!(c.port, Config::default().port);
        assert_eq!(c.piece_writers, Config::default().piece_writers);
    }
}
