use std::collections::HashMap;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use yumsync_core::{
    cache::Cache,
    config::Yumfile,
    error::Error,
    repomd::RepoMd,
    sync::sync_repo,
};

mod common;

use common::{build_rpm, read_published, upstream_files, TestUpstream};

fn yumfile_for(url: &str, local_path: &std::path::Path, extra: &str) -> Yumfile {
    let content = format!(
        "[test-repo]\nbaseurl = {url}\nlocalpath = {}\n{extra}",
        local_path.display()
    );
    let mut yumfile = Yumfile::parse(&content).unwrap();
    yumfile.validate().unwrap();
    yumfile
}

async fn run_sync(
    yumfile: &Yumfile,
    cache_dir: &std::path::Path,
) -> yumsync_core::Result<yumsync_core::sync::SyncOutcome> {
    let cache = Cache::new(cache_dir).unwrap();
    sync_repo(
        yumfile.repo("test-repo").unwrap(),
        &cache,
        &reqwest::Client::new(),
        &CancellationToken::new(),
        3,
        None,
    )
    .await
}

#[tokio::test]
async fn test_empty_upstream_publishes_empty_repodata() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");

    let repomd = RepoMd::new(7);
    let mut files = HashMap::new();
    files.insert(
        "/repodata/repomd.xml".to_string(),
        repomd.to_xml().unwrap().into_bytes(),
    );
    let upstream = TestUpstream::serve(files).await;

    let yumfile = yumfile_for(&upstream.url, &local, "");
    let outcome = run_sync(&yumfile, &dir.path().join("cache")).await.unwrap();

    assert_eq!(outcome.downloaded, 0);
    assert_eq!(outcome.failed, 0);

    // a local repodata exists and no packages appeared
    let packages = read_published(&local, dir.path());
    assert!(packages.is_empty());
    let rpm_count = std::fs::read_dir(&local)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .is_some_and(|ext| ext == "rpm")
        })
        .count();
    assert_eq!(rpm_count, 0);
}

#[tokio::test]
async fn test_single_package_first_run() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();

    let rpm = build_rpm(&source, "a", "1.0", "noarch");
    let expected_size = std::fs::metadata(&rpm).unwrap().len();
    let files = upstream_files(&[rpm], dir.path(), |_| {});
    let upstream = TestUpstream::serve(files).await;

    let yumfile = yumfile_for(&upstream.url, &local, "");
    let outcome = run_sync(&yumfile, &dir.path().join("cache")).await.unwrap();

    assert_eq!(outcome.downloaded, 1);
    assert_eq!(outcome.verified, 1);
    assert_eq!(outcome.failed, 0);

    // exactly one file of the declared size landed in the mirror
    let mirrored = local.join("a-1.0-1.noarch.rpm");
    assert_eq!(std::fs::metadata(&mirrored).unwrap().len(), expected_size);
    assert!(!local.join("a-1.0-1.noarch.rpm.part").exists());

    // the published index holds exactly that package
    let packages = read_published(&local, dir.path());
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].name, "a");
    assert_eq!(packages[0].version, "1.0");
    assert_eq!(packages[0].release, "1");
    assert_eq!(packages[0].arch, "noarch");
}

#[tokio::test]
async fn test_second_run_downloads_nothing_and_bumps_revision() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();

    let rpm = build_rpm(&source, "a", "1.0", "noarch");
    let files = upstream_files(&[rpm], dir.path(), |_| {});
    let upstream = TestUpstream::serve(files).await;

    let yumfile = yumfile_for(&upstream.url, &local, "");
    let cache_dir = dir.path().join("cache");

    run_sync(&yumfile, &cache_dir).await.unwrap();
    let first = RepoMd::parse_file(&local.join("repodata/repomd.xml")).unwrap();
    let first_bytes = std::fs::read(local.join("a-1.0-1.noarch.rpm")).unwrap();

    let outcome = run_sync(&yumfile, &cache_dir).await.unwrap();
    assert_eq!(outcome.downloaded, 0);

    let second = RepoMd::parse_file(&local.join("repodata/repomd.xml")).unwrap();
    assert!(second.revision > first.revision);

    // local package files are byte-identical across runs
    let second_bytes = std::fs::read(local.join("a-1.0-1.noarch.rpm")).unwrap();
    assert_eq!(first_bytes, second_bytes);
}

#[tokio::test]
async fn test_new_only_downloads_latest_version() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();

    let old = build_rpm(&source, "a", "1.0", "noarch");
    let new = build_rpm(&source, "a", "1.1", "noarch");
    let files = upstream_files(&[old, new], dir.path(), |_| {});
    let upstream = TestUpstream::serve(files).await;

    let yumfile = yumfile_for(&upstream.url, &local, "newonly = yes\n");
    let outcome = run_sync(&yumfile, &dir.path().join("cache")).await.unwrap();

    assert_eq!(outcome.downloaded, 1);
    assert!(local.join("a-1.1-1.noarch.rpm").exists());
    assert!(!local.join("a-1.0-1.noarch.rpm").exists());

    let packages = read_published(&local, dir.path());
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].version, "1.1");
}

#[tokio::test]
async fn test_architecture_filter() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();

    let x86 = build_rpm(&source, "a", "1.0", "x86_64");
    let arm = build_rpm(&source, "a", "1.0", "aarch64");
    let files = upstream_files(&[x86, arm], dir.path(), |_| {});
    let upstream = TestUpstream::serve(files).await;

    let yumfile = yumfile_for(&upstream.url, &local, "arch = x86_64\n");
    let outcome = run_sync(&yumfile, &dir.path().join("cache")).await.unwrap();

    assert_eq!(outcome.downloaded, 1);
    assert!(local.join("a-1.0-1.x86_64.rpm").exists());
    assert!(!local.join("a-1.0-1.aarch64.rpm").exists());

    let packages = read_published(&local, dir.path());
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].arch, "x86_64");
}

#[tokio::test]
async fn test_package_checksum_mismatch_is_reported_not_fatal() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();

    let rpm = build_rpm(&source, "a", "1.0", "noarch");
    // the upstream index advertises a digest the served bytes can never hash to
    let files = upstream_files(&[rpm], dir.path(), |meta| {
        meta.checksum = "0".repeat(64);
    });
    let upstream = TestUpstream::serve(files).await;

    let yumfile = yumfile_for(&upstream.url, &local, "");
    let outcome = run_sync(&yumfile, &dir.path().join("cache")).await.unwrap();

    assert_eq!(outcome.downloaded, 0);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.failed_packages.len(), 1);

    // the bad file is gone and the publish still went through, empty
    assert!(!local.join("a-1.0-1.noarch.rpm").exists());
    assert!(!local.join("a-1.0-1.noarch.rpm.part").exists());
    let packages = read_published(&local, dir.path());
    assert!(packages.is_empty());
}

#[tokio::test]
async fn test_upstream_404_aborts_upstream() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");

    let upstream = TestUpstream::serve(HashMap::new()).await;
    let yumfile = yumfile_for(&upstream.url, &local, "");

    let err = run_sync(&yumfile, &dir.path().join("cache")).await.unwrap_err();
    assert!(matches!(err, Error::BadResponse { status: 404, .. }));
    // nothing was published
    assert!(!local.join("repodata/repomd.xml").exists());
}

#[tokio::test]
async fn test_interrupt_mid_transfer_leaves_no_partials() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();

    let rpm = build_rpm(&source, "a", "1.0", "noarch");
    let files = upstream_files(&[rpm], dir.path(), |_| {});
    // the package transfer stalls halfway through
    let stall = vec!["/a-1.0-1.noarch.rpm".to_string()];
    let upstream = TestUpstream::serve_with_stall(files, stall).await;

    let yumfile = yumfile_for(&upstream.url, &local, "");
    let cache = Cache::new(dir.path().join("cache")).unwrap();
    let cancel = CancellationToken::new();

    let interrupter = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        interrupter.cancel();
    });

    let err = sync_repo(
        yumfile.repo("test-repo").unwrap(),
        &cache,
        &reqwest::Client::new(),
        &cancel,
        3,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Interrupted));

    // no package, no partial, no manifest
    assert!(!local.join("a-1.0-1.noarch.rpm").exists());
    assert!(!local.join("a-1.0-1.noarch.rpm.part").exists());
    assert!(!local.join("repodata/repomd.xml").exists());
}

#[tokio::test]
async fn test_delete_removed_policy() {
    let dir = tempdir().unwrap();
    let local = dir.path().join("mirror");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("stale-9-9.noarch.rpm"), b"leftover").unwrap();

    let repomd = RepoMd::new(7);
    let mut files = HashMap::new();
    files.insert(
        "/repodata/repomd.xml".to_string(),
        repomd.to_xml().unwrap().into_bytes(),
    );
    let upstream = TestUpstream::serve(files).await;

    let yumfile = yumfile_for(&upstream.url, &local, "deleteremoved = yes\n");
    run_sync(&yumfile, &dir.path().join("cache")).await.unwrap();

    assert!(!local.join("stale-9-9.noarch.rpm").exists());
}
