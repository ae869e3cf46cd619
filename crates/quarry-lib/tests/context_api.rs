//! The engine facade as collaborators consume it.

mod support;

use std::path::PathBuf;
use std::sync::Arc;

use quarry_lib::cdn::HttpProbeTransport;
use quarry_lib::{hash, AppContext, DownloadTask, SilentSink};
use support::TestServer;
use tempfile::TempDir;

async fn context_for(server: &TestServer, root: &TempDir) -> AppContext {
    AppContext::with_transport(
        root.path().to_path_buf(),
        root.path().join("app"),
        Arc::new(HttpProbeTransport::new().unwrap()),
        Some(server.base_url()),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn download_and_verify_through_the_facade() {
    let server = TestServer::start().await;
    let body = b"facade payload".to_vec();
    server.serve("/asset.bin", body.clone());

    let root = TempDir::new().unwrap();
    let ctx = context_for(&server, &root).await;

    let scratch = root.path().join("scratch.bin");
    tokio::fs::write(&scratch, &body).await.unwrap();
    let expected = hash::hash_file(&scratch, hash::Algorithms::ALL)
        .await
        .unwrap();

    let dest = root.path().join("downloads/asset.bin");
    let task = DownloadTask::new(server.url("/asset.bin"), &dest).with_hash(expected.clone());
    let result = ctx.download_file(&task).await.unwrap();
    assert!(result.success);

    let verdicts = ctx
        .verify_files(&[(dest.clone(), expected)])
        .await
        .unwrap();
    assert_eq!(verdicts.get(&dest), Some(&true));

    let stats = ctx.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn settings_updates_retune_the_limiter() {
    let server = TestServer::start().await;
    let root = TempDir::new().unwrap();
    let ctx = context_for(&server, &root).await;

    assert_eq!(ctx.downloads().limiter().limit(), 0);
    ctx.update_settings(|s| s.max_download_speed_bps = Some(250_000))
        .await
        .unwrap();
    assert_eq!(ctx.downloads().limiter().limit(), 250_000);

    // The change is durable.
    let reloaded = context_for(&server, &root).await;
    assert_eq!(reloaded.downloads().limiter().limit(), 250_000);
}

#[tokio::test]
async fn fan_out_downloads_land_at_their_destinations() {
    let server = TestServer::start().await;
    server.serve("/a.bin", b"alpha".to_vec());
    server.serve("/b.bin", b"bravo".to_vec());

    let root = TempDir::new().unwrap();
    let ctx = context_for(&server, &root).await;

    let dest_a: PathBuf = root.path().join("files/a.bin");
    let dest_b: PathBuf = root.path().join("files/b.bin");
    let results = ctx
        .download_files(
            vec![
                DownloadTask::new(server.url("/a.bin"), &dest_a),
                DownloadTask::new(server.url("/b.bin"), &dest_b),
            ],
            &SilentSink,
        )
        .await;

    assert!(results.iter().all(|r| r.success));
    assert_eq!(tokio::fs::read(&dest_a).await.unwrap(), b"alpha");
    assert_eq!(tokio::fs::read(&dest_b).await.unwrap(), b"bravo");
}
