mod common;

use std::sync::Arc;
use std::time::Duration;

use common::init_test_logging;
use msu_common::{ConvergePolicy, DirectoryConverger};
use tempfile::TempDir;
use tracing::info;

fn policy(max_attempts: u32) -> ConvergePolicy {
    ConvergePolicy {
        max_attempts,
        delay_unit: Duration::from_millis(1),
    }
}

fn is_empty_dir(path: &std::path::Path) -> bool {
    path.is_dir() && std::fs::read_dir(path).expect("read dir").next().is_none()
}

#[tokio::test]
async fn test_converge_nested_tree() {
    init_test_logging();
    info!(test = "test_converge_nested_tree", phase = "setup");

    let dir = TempDir::new().expect("tempdir");
    let scratch = dir.path().join("ca");
    std::fs::create_dir_all(scratch.join("a/b/c")).expect("mkdir");
    std::fs::write(scratch.join("a/b/c/cert.pem"), b"-----BEGIN").expect("write");
    std::fs::write(scratch.join("top.pem"), b"-----BEGIN").expect("write");

    let converged = DirectoryConverger::new(policy(4))
        .converge(&scratch)
        .await
        .expect("converge");

    info!(test = "test_converge_nested_tree", phase = "assert");
    assert_eq!(converged, scratch);
    assert!(is_empty_dir(&scratch));

    info!(
        test = "test_converge_nested_tree",
        phase = "complete",
        status = "passed"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_converge_replaces_symlink_without_following_it() {
    init_test_logging();
    info!(
        test = "test_converge_replaces_symlink_without_following_it",
        phase = "setup"
    );

    let dir = TempDir::new().expect("tempdir");
    let target = dir.path().join("elsewhere");
    std::fs::create_dir(&target).expect("mkdir");
    std::fs::write(target.join("keep.txt"), b"keep").expect("write");
    let scratch = dir.path().join("ca");
    std::os::unix::fs::symlink(&target, &scratch).expect("symlink");

    DirectoryConverger::new(policy(4))
        .converge(&scratch)
        .await
        .expect("converge");

    info!(
        test = "test_converge_replaces_symlink_without_following_it",
        phase = "assert"
    );
    let meta = std::fs::symlink_metadata(&scratch).expect("metadata");
    assert!(meta.is_dir());
    assert!(is_empty_dir(&scratch));
    assert!(target.join("keep.txt").exists());

    info!(
        test = "test_converge_replaces_symlink_without_following_it",
        phase = "complete",
        status = "passed"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_convergers_agree() {
    init_test_logging();
    info!(test = "test_concurrent_convergers_agree", phase = "setup");

    let dir = TempDir::new().expect("tempdir");
    let scratch = Arc::new(dir.path().join("ca"));
    std::fs::create_dir_all(scratch.join("stale")).expect("mkdir");
    std::fs::write(scratch.join("stale/file"), b"x").expect("write");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let scratch = Arc::clone(&scratch);
        tasks.push(tokio::spawn(async move {
            DirectoryConverger::new(policy(10)).converge(&scratch).await
        }));
    }

    let mut ok = 0;
    for task in tasks {
        if task.await.expect("join").is_ok() {
            ok += 1;
        }
    }

    info!(
        test = "test_concurrent_convergers_agree",
        phase = "assert",
        succeeded = ok
    );
    assert_eq!(ok, 8);
    assert!(is_empty_dir(&scratch));

    info!(
        test = "test_concurrent_convergers_agree",
        phase = "complete",
        status = "passed"
    );
}
