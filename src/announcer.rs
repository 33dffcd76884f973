//! Periodic announce loops: one per tracker, one optional DHT announcer,
//! and the dedicated stop announcer used during shutdown.
use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::{
    select, spawn,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, warn};

use crate::{
    session::{AnnounceData, DhtHandle, SessionCtx, SessionEvent},
    tracker::{event::Event, Announce, Tracker},
};

#[derive(Debug, Clone, Copy)]
pub struct AnnouncerConfig {
    pub port: u16,
    pub num_want: u32,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

pub struct Announcer;

impl Announcer {
    /// Announce to one tracker forever: `started` first, then periodic
    /// `none` events at the tracker's interval bounded by the configured
    /// min/max, with exponential backoff plus jitter on failure. The session
    /// pushes `completed` through `trigger`.
    pub fn spawn(
        url: String,
        ctx: Arc<SessionCtx>,
        config: AnnouncerConfig,
        mut trigger: mpsc::Receiver<Event>,
        mut close: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        spawn(async move {
            let mut event = Event::Started;
            let mut backoff = Duration::from_secs(15);

            'reconnect: loop {
                if *close.borrow() {
                    return;
                }

                let mut tracker = match Tracker::connect_udp(&url).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("{url} connect failed: {e}");
                        let _ = ctx
                            .events
                            .send(SessionEvent::TrackerUpdate {
                                url: url.clone(),
                                seeders: 0,
                                leechers: 0,
                                error: Some(e.to_string()),
                            })
                            .await;

                        if !wait(with_jitter(backoff), &mut close).await {
                            return;
                        }
                        backoff = (backoff * 2).min(config.max_interval);
                        continue;
                    }
                };
                backoff = Duration::from_secs(15);

                loop {
                    let Some(data) = request_data(&ctx).await else {
                        return;
                    };

                    let announce = Announce {
                        info_hash: ctx.info_hash.clone(),
                        peer_id: ctx.local_id.clone(),
                        port: config.port,
                        downloaded: data.downloaded,
                        uploaded: data.uploaded,
                        left: data.left,
                        event,
                        num_want: config.num_want,
                    };

                    let interval = match tracker.announce(&announce).await {
                        Ok(res) => {
                            debug!(
                                "{url} announced, {} peers, interval {}",
                                res.peers.len(),
                                res.interval
                            );

                            let _ = ctx
                                .events
                                .send(SessionEvent::TrackerUpdate {
                                    url: url.clone(),
                                    seeders: res.seeders,
                                    leechers: res.leechers,
                                    error: None,
                                })
                                .await;
                            if !res.peers.is_empty() {
                                let _ = ctx
                                    .events
                                    .send(SessionEvent::TrackerAddrs(res.peers))
                                    .await;
                            }

                            event = Event::None;
                            backoff = Duration::from_secs(15);
                            Duration::from_secs(res.interval as u64)
                                .clamp(config.min_interval, config.max_interval)
                        }
                        Err(e) => {
                            warn!("{url} announce failed: {e}");
                            let _ = ctx
                                .events
                                .send(SessionEvent::TrackerUpdate {
                                    url: url.clone(),
                                    seeders: 0,
                                    leechers: 0,
                                    error: Some(e.to_string()),
                                })
                                .await;

                            let wait_for = with_jitter(backoff);
                            backoff = (backoff * 2).min(config.max_interval);
                            if !wait(wait_for, &mut close).await {
                                return;
                            }
                            continue 'reconnect;
                        }
                    };

                    select! {
                        _ = sleep(interval) => {}
                        Some(ev) = trigger.recv() => {
                            event = ev;
                        }
                        _ = close.changed() => {}
                    }
                    if *close.borrow() {
                        return;
                    }
                }
            }
        })
    }
}

/// Delivers the terminal `stopped` announce during shutdown, bounded so a
/// dead tracker cannot stall the stop path.
pub struct StopAnnouncer;

impl StopAnnouncer {
    pub async fn announce(
        url: String,
        announce: Announce,
        limit: Duration,
    ) {
        let res = timeout(limit, async {
            let mut tracker = Tracker::connect_udp(&url).await?;
            tracker.announce(&announce).await
        })
        .await;

        match res {
            Ok(Ok(_)) => debug!("{url} accepted the stopped announce"),
            Ok(Err(e)) => debug!("{url} rejected the stopped announce: {e}"),
            Err(_) => debug!("{url} stopped announce timed out"),
        }
    }
}

/// Bridges an external DHT node: announces the torrent periodically and
/// forwards discovered addresses into the session.
pub struct DhtAnnouncer;

impl DhtAnnouncer {
    pub fn spawn(
        mut dht: DhtHandle,
        ctx: Arc<SessionCtx>,
        port: u16,
        interval: Duration,
        mut close: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        spawn(async move {
            let mut tick = tokio::time::interval(interval);

            loop {
                select! {
                    _ = tick.tick() => {
                        let _ = dht
                            .announce
                            .send((ctx.info_hash.clone(), port))
                            .await;
                    }
                    Some(addrs) = dht.peers.recv() => {
                        let _ = ctx
                            .events
                            .send(SessionEvent::DhtAddrs(addrs))
                            .await;
                    }
                    _ = close.changed() => {
                        if *close.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

async fn request_data(ctx: &SessionCtx) -> Option<AnnounceData> {
    let (otx, orx) = oneshot::channel();
    ctx.events.send(SessionEvent::AnnounceData(otx)).await.ok()?;
    orx.await.ok()
}

fn with_jitter(d: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=d.as_secs() / 4 + 1);
    d + Duration::from_secs(jitter)
}

/// Sleep unless the close flag flips first. Returns false on close.
async fn wait(d: Duration, close: &mut watch::Receiver<bool>) -> bool {
    select! {
        _ = sleep(d) => true,
        _ = close.changed() => !*close.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_bounded() {
        let base = Duration::from_secs(60);
        for _ in 0..100 {
            let j = with_jitter(base);
            assert!(j >= base);
            assert!(j <= base + Duration::from_secs(16));
        }
    }
}
