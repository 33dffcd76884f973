//! End to end scenarios over loopback: scripted seeders, web seeds and
//! restarts, all against real sockets and a real download directory.
mod common;

use std::{path::Path, sync::Arc, time::Duration};

use tokio::time::{sleep, timeout};

use common::{
    make_content, make_info, spawn_http_seed, spawn_seeder, tmp_dir,
    SeederOpts,
};
use squall::{
    config::Config,
    metainfo::MetaInfo,
    resumer::Resumer,
    session::{Session, SessionHandle, Source},
};

const BLOCK: u32 = 16384;

fn test_config(dir: &Path) -> Arc<Config> {
    Arc::new(Config {
        download_dir: dir.to_string_lossy().into_owned(),
        port: 0,
        snub_timeout_secs: 2,
        resume_write_interval_secs: 1,
        stats_write_interval_secs: 1,
        ..Config::default()
    })
}

fn metainfo_source(info: &squall::metainfo::Info) -> Source {
    Source::metainfo(MetaInfo {
        announce: String::new(),
        info: info.clone(),
        ..Default::default()
    })
}

async fn start_session(
    config: Arc<Config>,
    source: Source,
) -> SessionHandle {
    let (session, handle) = Session::new(config, source).unwrap();
    tokio::spawn(session.run());
    handle.start().await.unwrap();
    handle
}

async fn await_complete(handle: &SessionHandle, secs: u64) {
    let complete = handle.notify_complete().await.unwrap();
    timeout(Duration::from_secs(secs), complete)
        .await
        .expect("download did not complete in time")
        .unwrap();
}

async fn poll_until<F, Fut>(secs: u64, probe: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Duration::from_secs(secs);
    timeout(deadline, async {
        loop {
            if probe().await {
                return;
            }
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Probe a handle until a predicate over its peer list holds.
async fn poll_peers<P>(handle: &SessionHandle, secs: u64, pred: P)
where
    P: Fn(&[squall::session::PeerStats]) -> bool + Copy,
{
    let handle = handle.clone();
    poll_until(secs, move || {
        let handle = handle.clone();
        async move {
            handle.peers().await.map(|p| pred(&p)).unwrap_or(false)
        }
    })
    .await;
}

/// Probe a handle until a predicate over its stats holds.
async fn poll_stats<P>(handle: &SessionHandle, secs: u64, pred: P)
where
    P: Fn(&squall::session::SessionStats) -> bool + Copy,
{
    let handle = handle.clone();
    poll_until(secs, move || {
        let handle = handle.clone();
        async move {
            handle.stats().await.map(|s| pred(&s)).unwrap_or(false)
        }
    })
    .await;
}

#[tokio::test]
async fn downloads_with_full_metainfo() {
    let dir = tmp_dir("metainfo");
    let content = make_content(3 * BLOCK as usize + 5000);
    let info = make_info("sample_torrent", BLOCK, &content);

    let seeder =
        spawn_seeder(info.clone(), content.clone(), SeederOpts::default())
            .await;

    let handle = start_session(test_config(&dir), metainfo_source(&info)).await;
    handle.add_peers(vec![seeder.addr]).await.unwrap();

    await_complete(&handle, 10).await;

    let downloaded = std::fs::read(dir.join("sample_torrent")).unwrap();
    assert_eq!(downloaded, content);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.status, "Seeding");
    assert_eq!(stats.have_pieces, stats.piece_count);

    // a full-metainfo start must never touch the metadata extension
    handle.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn downloads_from_magnet_with_metadata_exchange() {
    let dir = tmp_dir("magnet");
    let content = make_content(2 * BLOCK as usize + 777);
    let info = make_info("magnet_sample", BLOCK, &content);

    let seeder = spawn_seeder(
        info.clone(),
        content.clone(),
        SeederOpts { serve_metadata: true, ..Default::default() },
    )
    .await;

    let link = format!(
        "magnet:?xt=urn:btih:{}&dn=magnet_sample",
        info.info_hash
    );
    let source = Source::magnet(&link).unwrap();

    let handle = start_session(test_config(&dir), source).await;
    handle.add_peers(vec![seeder.addr]).await.unwrap();

    await_complete(&handle, 10).await;

    let downloaded = std::fs::read(dir.join("magnet_sample")).unwrap();
    assert_eq!(downloaded, content);

    handle.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn completes_from_web_seeds_alone() {
    let dir = tmp_dir("webseed");
    let content = make_content(3 * BLOCK as usize + 123);
    let info = make_info("webseed_sample", BLOCK, &content);

    let seed_a = spawn_http_seed(content.clone()).await;
    let seed_b = spawn_http_seed(content.clone()).await;

    let mut config = Config {
        download_dir: dir.to_string_lossy().into_owned(),
        port: 0,
        web_seeds: vec![
            format!("http://{seed_a}/webseed_sample"),
            format!("http://{seed_b}/webseed_sample"),
        ],
        ..Config::default()
    };
    config.stats_write_interval_secs = 1;

    let handle =
        start_session(Arc::new(config), metainfo_source(&info)).await;

    // no peers at all: the bytes must come over HTTP
    await_complete(&handle, 10).await;

    let downloaded = std::fs::read(dir.join("webseed_sample")).unwrap();
    assert_eq!(downloaded, content);

    handle.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn snubbed_peer_is_detected_and_piece_reassigned() {
    let dir = tmp_dir("snub");
    let content = make_content(4 * BLOCK as usize);
    let info = make_info("snub_sample", BLOCK, &content);

    // answers one request, then plays dead with requests outstanding
    let bad = spawn_seeder(
        info.clone(),
        content.clone(),
        SeederOpts { silent_after_first_block: true, ..Default::default() },
    )
    .await;
    let good =
        spawn_seeder(info.clone(), content.clone(), SeederOpts::default())
            .await;

    let handle = start_session(test_config(&dir), metainfo_source(&info)).await;
    handle.add_peers(vec![bad.addr, good.addr]).await.unwrap();

    // the snub must be flagged within the configured timeout
    poll_peers(&handle, 10, |peers| peers.iter().any(|p| p.snubbed)).await;

    // and the download must still finish through the healthy peer
    await_complete(&handle, 20).await;
    let downloaded = std::fs::read(dir.join("snub_sample")).unwrap();
    assert_eq!(downloaded, content);

    handle.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn corrupt_piece_is_requeued_and_peer_penalized() {
    let dir = tmp_dir("corrupt");
    let content = make_content(3 * BLOCK as usize);
    let info = make_info("corrupt_sample", BLOCK, &content);

    let seeder = spawn_seeder(
        info.clone(),
        content.clone(),
        SeederOpts { corrupt_first_block_once: true, ..Default::default() },
    )
    .await;

    let handle = start_session(test_config(&dir), metainfo_source(&info)).await;
    handle.add_peers(vec![seeder.addr]).await.unwrap();

    // the bad delivery shows up as a penalty strike
    poll_peers(&handle, 10, |peers| peers.iter().any(|p| p.penalty >= 1))
        .await;

    // the piece is re-queued and served correctly the second time
    await_complete(&handle, 20).await;
    let downloaded = std::fs::read(dir.join("corrupt_sample")).unwrap();
    assert_eq!(downloaded, content);

    handle.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn restart_resumes_verified_pieces_without_redownloading() {
    let dir = tmp_dir("restart");
    let content = make_content(4 * BLOCK as usize);
    let info = make_info("restart_sample", BLOCK, &content);
    let resume_path = dir.join("resume.snapshot");

    // first run: the seeder serves two blocks (= two pieces) and stalls
    let partial = spawn_seeder(
        info.clone(),
        content.clone(),
        SeederOpts { max_blocks: Some(2), ..Default::default() },
    )
    .await;

    let handle = start_session(test_config(&dir), metainfo_source(&info)).await;
    handle.set_resumer(Resumer::file(&resume_path)).await.unwrap();
    handle.add_peers(vec![partial.addr]).await.unwrap();

    poll_stats(&handle, 10, |s| s.have_pieces >= 2).await;

    handle.stop().await.unwrap();
    poll_stats(&handle, 10, |s| s.status == "Stopped").await;
    handle.close().await.unwrap();

    // which pieces actually survived on disk
    let on_disk = std::fs::read(dir.join("restart_sample")).unwrap();
    let verified: Vec<u32> = (0..info.piece_count())
        .filter(|&i| {
            let a = i as usize * BLOCK as usize;
            let b = (a + info.piece_size(i) as usize).min(content.len());
            on_disk.get(a..b) == content.get(a..b)
        })
        .collect();
    assert!(verified.len() >= 2, "first run made no progress");

    // second run with a fresh, fully serving seeder
    let full =
        spawn_seeder(info.clone(), content.clone(), SeederOpts::default())
            .await;

    let handle2 =
        start_session(test_config(&dir), metainfo_source(&info)).await;
    handle2.set_resumer(Resumer::file(&resume_path)).await.unwrap();
    handle2.add_peers(vec![full.addr]).await.unwrap();

    await_complete(&handle2, 20).await;

    let downloaded = std::fs::read(dir.join("restart_sample")).unwrap();
    assert_eq!(downloaded, content);

    // the verifier confirmed the old pieces; none were requested again
    let requested = full.requests.lock().unwrap().clone();
    for piece in &verified {
        assert!(
            !requested.contains(piece),
            "piece {piece} was redownloaded despite verifying"
        );
    }

    handle2.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let dir = tmp_dir("idempotent");
    let content = make_content(2 * BLOCK as usize);
    let info = make_info("idempotent_sample", BLOCK, &content);

    let (session, handle) =
        Session::new(test_config(&dir), metainfo_source(&info)).unwrap();
    tokio::spawn(session.run());

    // the listener port arrives once the session starts
    let listen = handle.notify_listen().await.unwrap();
    handle.start().await.unwrap();
    let port = timeout(Duration::from_secs(5), listen).await.unwrap().unwrap();
    assert_ne!(port, 0);

    // a second start is a no-op
    handle.start().await.unwrap();
    poll_stats(&handle, 10, |s| s.status == "Downloading").await;

    let stop = handle.notify_stop().await.unwrap();
    handle.stop().await.unwrap();
    timeout(Duration::from_secs(5), stop).await.unwrap().unwrap();

    // a second stop is also a no-op
    handle.stop().await.unwrap();
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.status, "Stopped");
    assert!(stats.last_error.is_none());

    // the lifecycle can begin again after a stop
    handle.start().await.unwrap();
    poll_stats(&handle, 10, |s| s.status == "Downloading").await;

    handle.close().await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn single_and_multi_file_layouts_yield_identical_bitfields() {
    use squall::metainfo::File;

    let dir = tmp_dir("layouts");
    let content = make_content(2 * BLOCK as usize + 99);

    let single = make_info("single_sample", BLOCK, &content);

    // the same bytes split across two files
    let multi = squall::metainfo::Info {
        name: "multi_sample".into(),
        piece_length: BLOCK,
        pieces: single.pieces.clone(),
        files: Some(vec![
            File { length: BLOCK as u64, path: vec!["a.bin".into()] },
            File {
                length: content.len() as u64 - BLOCK as u64,
                path: vec!["b.bin".into()],
            },
        ]),
        ..Default::default()
    }
    .finalize()
    .unwrap();

    let seeder_single =
        spawn_seeder(single.clone(), content.clone(), SeederOpts::default())
            .await;
    let seeder_multi =
        spawn_seeder(multi.clone(), content.clone(), SeederOpts::default())
            .await;

    let h1 = start_session(test_config(&dir), metainfo_source(&single)).await;
    h1.add_peers(vec![seeder_single.addr]).await.unwrap();
    let h2 = start_session(test_config(&dir), metainfo_source(&multi)).await;
    h2.add_peers(vec![seeder_multi.addr]).await.unwrap();

    await_complete(&h1, 10).await;
    await_complete(&h2, 10).await;

    let s1 = h1.stats().await.unwrap();
    let s2 = h2.stats().await.unwrap();
    assert_eq!(s1.piece_count, s2.piece_count);
    assert_eq!(s1.have_pieces, s2.have_pieces);

    // and the reassembled bytes are identical
    let single_bytes = std::fs::read(dir.join("single_sample")).unwrap();
    let mut multi_bytes =
        std::fs::read(dir.join("multi_sample/a.bin")).unwrap();
    multi_bytes
        .extend(std::fs::read(dir.join("multi_sample/b.bin")).unwrap());
    assert_eq!(single_bytes, multi_bytes);

    h1.close().await.unwrap();
    h2.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}
