//! Web seeds: HTTP sources that serve the torrent's bytes directly, used to
//! make progress when the swarm cannot (BEP 19 style URLs).
use std::{sync::Arc, time::Duration};

use tokio::{
    select, spawn,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, warn};

use crate::{
    error::Error,
    session::{SessionCtx, SessionEvent},
    storage::FileTable,
};

/// How long a worker idles when the session has no piece to hand out.
const IDLE_WAIT: Duration = Duration::from_secs(2);

/// Backoff after a failed fetch.
const ERROR_WAIT: Duration = Duration::from_secs(5);

/// One worker per configured URL. It repeatedly asks the session for a
/// missing piece, fetches its byte ranges over HTTP and feeds the assembled
/// piece back through the same hash-and-write path peer downloads take.
pub struct WebSeed;

impl WebSeed {
    pub fn spawn(
        url: String,
        table: FileTable,
        ctx: Arc<SessionCtx>,
        mut close: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        spawn(async move {
            let client = reqwest::Client::new();

            loop {
                if *close.borrow() {
                    return;
                }

                let (otx, orx) = oneshot::channel();
                if ctx
                    .events
                    .send(SessionEvent::WebSeedPick(otx))
                    .await
                    .is_err()
                {
                    return;
                }

                let piece = match orx.await {
                    Ok(Some(piece)) => piece,
                    Ok(None) => {
                        if !idle(IDLE_WAIT, &mut close).await {
                            return;
                        }
                        continue;
                    }
                    Err(_) => return,
                };

                match fetch_piece(&client, &url, &table, piece).await {
                    Ok(data) => {
                        debug!("{url} fetched piece {piece}");
                        ctx.counter.record_download(data.len() as u64);
                        let _ = ctx
                            .events
                            .send(SessionEvent::WebSeedPiece {
                                index: piece,
                                data,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!("{url} failed to fetch piece {piece}: {e}");
                        let _ = ctx
                            .events
                            .send(SessionEvent::WebSeedError {
                                url: url.clone(),
                                error: e.to_string(),
                            })
                            .await;
                        if !idle(ERROR_WAIT, &mut close).await {
                            return;
                        }
                    }
                }
            }
        })
    }
}

async fn fetch_piece(
    client: &reqwest::Client,
    base: &str,
    table: &FileTable,
    piece: u32,
) -> Result<Vec<u8>, Error> {
    let abs = table.abs_offset(piece, 0);
    let len = table.piece_size(piece) as u64;

    let mut data = Vec::with_capacity(len as usize);
    for span in table.spans(abs, len)? {
        let url = file_url(base, table, span.file);
        let end = span.offset + span.len - 1;

        let res = client
            .get(&url)
            .header("Range", format!("bytes={}-{end}", span.offset))
            .send()
            .await
            .map_err(|e| Error::WebSeed(e.to_string()))?;

        let status = res.status();
        let whole_file = span.offset == 0
            && span.len == table.files[span.file].length;
        if !(status == reqwest::StatusCode::PARTIAL_CONTENT
            || (status == reqwest::StatusCode::OK && whole_file))
        {
            return Err(Error::WebSeed(format!("{url} answered {status}")));
        }

        let body =
            res.bytes().await.map_err(|e| Error::WebSeed(e.to_string()))?;
        if body.len() as u64 != span.len {
            return Err(Error::WebSeed(format!(
                "{url} sent {} bytes, wanted {}",
                body.len(),
                span.len
            )));
        }

        data.extend_from_slice(&body);
    }

    Ok(data)
}

/// BEP 19 URL mapping: a URL that does not end in a slash names the single
/// file itself; otherwise the torrent-relative path is appended.
fn file_url(base: &str, table: &FileTable, file: usize) -> String {
    if table.files.len() == 1 && !base.ends_with('/') {
        return base.to_owned();
    }

    let mut url = base.trim_end_matches('/').to_owned();
    for comp in table.files[file].rel_path.components() {
        url.push('/');
        url.push_str(
            &urlencoding::encode(&comp.as_os_str().to_string_lossy()),
        );
    }
    url
}

async fn idle(d: Duration, close: &mut watch::Receiver<bool>) -> bool {
    select! {
        _ = sleep(d) => true,
        _ = close.changed() => !*close.borrow(),
    }
}
