use predicates::prelude::*;

mod novel_stub;

use novel_stub::{NovelStub, NovelStubConfig, WORK_ID};
use novelsync::archive::{ArchiveHandle as _, ArchiveReader as _};
use novelsync::epub::EpubReader;

#[test]
fn sync_writes_epub_and_prints_its_path() -> anyhow::Result<()> {
    let stub = NovelStub::spawn(NovelStubConfig::default());
    let temp = tempfile::TempDir::new()?;
    let out_dir = temp.path().join("out");
    let cache_dir = temp.path().join("cache");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelsync");
    cmd.args([
        "sync",
        "--work-id",
        WORK_ID,
        "--base-url",
        &stub.base_url,
        "--source",
        "plain",
        "--out",
        out_dir.to_str().unwrap(),
        "--cache-dir",
        cache_dir.to_str().unwrap(),
        "--concurrency",
        "2",
        "--lang",
        "en",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Stub Novel.epub"));

    let archive = out_dir.join("Stub Novel.epub");
    let mut handle = EpubReader.open(&archive)?;
    let provenance = handle.provenance()?;
    assert_eq!(provenance.work_id, WORK_ID);
    assert_eq!(provenance.downloaded_ids.len(), 3);

    let fragment = handle.read_fragment("c1")?.unwrap_or_default();
    let local_images = novelsync::marker::collect_image_sources(&fragment)
        .into_iter()
        .filter(|src| src.starts_with("images/"))
        .collect::<Vec<_>>();
    assert_eq!(local_images.len(), 1);
    assert_eq!(
        handle.read_resource(&local_images[0])?,
        Some(novel_stub::PIXEL_PNG.to_vec())
    );

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelsync");
    cmd.args([
        "cache",
        "status",
        "--work-id",
        WORK_ID,
        "--cache-dir",
        cache_dir.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("no cache for w1"));
    Ok(())
}

#[test]
fn sync_with_range_outside_toc_fails() -> anyhow::Result<()> {
    let stub = NovelStub::spawn(NovelStubConfig::default());
    let temp = tempfile::TempDir::new()?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelsync");
    cmd.args([
        "sync",
        "--work-id",
        WORK_ID,
        "--base-url",
        &stub.base_url,
        "--out",
        temp.path().join("out").to_str().unwrap(),
        "--cache-dir",
        temp.path().join("cache").to_str().unwrap(),
        "--from",
        "50",
    ])
    .env("NOVELSYNC_SOURCE", "protected")
    .assert()
    .failure()
    .stderr(predicate::str::contains("requested range"));
    Ok(())
}

#[test]
fn rust_log_debug_emits_parsed_cli() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelsync");
    cmd.env("RUST_LOG", "debug")
        .args(["cache", "status", "--work-id", "nothing", "--cache-dir", "/nonexistent-novelsync"])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}

#[test]
fn unknown_source_is_rejected() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelsync");
    cmd.args([
        "sync",
        "--work-id",
        "w",
        "--base-url",
        "http://127.0.0.1:1/",
        "--source",
        "ftp",
        "--out",
        "/tmp/unused",
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("unsupported source"));
}
