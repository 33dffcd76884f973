//! Byte counters with smoothed transfer rates.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use tokio::time::Instant;

/// Exponential moving average smoothing factor. Higher values react faster,
/// lower values smooth more.
const EMA_ALPHA: f64 = 0.3;

/// Counts downloaded and uploaded bytes and derives rolling rates from them.
/// One lives on each peer context and one on the session.
#[derive(Debug)]
pub struct Counter {
    total_downloaded: AtomicU64,
    total_uploaded: AtomicU64,

    download_rate: AtomicU64,
    upload_rate: AtomicU64,

    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    last_update: Instant,
    ema_download: f64,
    ema_upload: f64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                last_update: Instant::now(),
                ema_download: 0.0,
                ema_upload: 0.0,
            }),
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A counter that starts with bytes already accounted as downloaded,
    /// used when resuming a partially complete torrent.
    pub fn from_downloaded(bytes: u64) -> Self {
        let c = Self::default();
        c.total_downloaded.store(bytes, Ordering::Relaxed);
        c
    }

    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_download(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn total_upload(&self) -> u64 {
        self.total_uploaded.load(Ordering::Relaxed)
    }

    /// Bytes per second, smoothed.
    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    /// Bytes per second, smoothed.
    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    /// Fold the current window into the EMA rates. Called on a timer.
    pub fn update_rates(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let elapsed = now.duration_since(inner.last_update).as_secs_f64();
        if elapsed < 0.001 {
            return;
        }

        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        let dl_rate = downloaded as f64 / elapsed;
        let ul_rate = uploaded as f64 / elapsed;

        inner.ema_download = if inner.ema_download == 0.0 {
            dl_rate
        } else {
            EMA_ALPHA * dl_rate + (1.0 - EMA_ALPHA) * inner.ema_download
        };

        inner.ema_upload = if inner.ema_upload == 0.0 {
            ul_rate
        } else {
            EMA_ALPHA * ul_rate + (1.0 - EMA_ALPHA) * inner.ema_upload
        };

        self.download_rate.store(inner.ema_download as u64, Ordering::Relaxed);
        self.upload_rate.store(inner.ema_upload as u64, Ordering::Relaxed);

        inner.last_update = now;
    }
}
