//! Watcher integration tests
//!
//! Directory watchers over real inotify descriptors, process-exit watchers
//! over real children, and the busy rule on asynchronous hashing.

use crossbeam_channel::{unbounded, Receiver};
use osport::{code, Change, ChangeAction, ErrorPair, HashAlgorithm, Runtime, WatchState};
use std::fs::File;
use std::time::{Duration, Instant};

fn wait_for<T>(rt: &Runtime, rx: &Receiver<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(value) = rx.try_recv() {
            return value;
        }
        rt.run_once(Duration::from_millis(20));
    }
    panic!("timed out waiting for a callback");
}

/// Pump for a short while and report whether anything arrived.
fn settles<T>(rt: &Runtime, rx: &Receiver<T>) -> bool {
    for _ in 0..10 {
        rt.run_once(Duration::from_millis(20));
    }
    rx.try_recv().is_err()
}

fn added(name: &str) -> Change {
    Change {
        action: ChangeAction::Added,
        name: name.to_string(),
    }
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Directory watcher
// ============================================================================

#[test]
fn test_directory_watch_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::new();
    let (tx, rx) = unbounded();
    let watcher = rt
        .watch_directory(dir.path(), false, Box::new(move |batch| tx.send(batch).unwrap()))
        .unwrap();
    assert_eq!(rt.watcher_state(watcher), Some(WatchState::Armed));

    File::create(dir.path().join("new.txt")).unwrap();
    assert_eq!(wait_for(&rt, &rx), Ok(vec![added("new.txt")]));
    assert!(settles(&rt, &rx));

    rt.close_directory_watcher(watcher).unwrap();
    assert_eq!(rt.watcher_state(watcher), None);
    assert_eq!(wait_for(&rt, &rx), Err(code::CANCELLED));
    assert!(settles(&rt, &rx));
    assert_eq!(
        rt.close_directory_watcher(watcher).unwrap_err(),
        ErrorPair::invalid_handle("close_directory_watcher")
    );
    assert_eq!(rt.handle_counts().watchers, 0);
    assert_eq!(rt.engine().side_table().outstanding(), 0);
}

#[test]
fn test_successive_events_rearm_before_callback() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::new();
    let poster = rt.engine().poster();
    let (tx, rx) = unbounded();
    let watcher = rt
        .watch_directory(
            dir.path(),
            false,
            Box::new(move |batch| {
                // the next read is already parked when the callback runs
                let outstanding = poster.side_table().outstanding();
                tx.send((batch, outstanding)).unwrap();
            }),
        )
        .unwrap();

    for name in ["e1", "e2", "e3"] {
        File::create(dir.path().join(name)).unwrap();
        let (batch, outstanding) = wait_for(&rt, &rx);
        assert_eq!(batch, Ok(vec![added(name)]));
        assert_eq!(outstanding, 1);
    }
    rt.close_directory_watcher(watcher).unwrap();
    assert_eq!(wait_for(&rt, &rx).0, Err(code::CANCELLED));
}

#[test]
fn test_directory_actions_in_kernel_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old"), b"x").unwrap();
    let rt = Runtime::new();
    let (tx, rx) = unbounded();
    let watcher = rt
        .watch_directory(dir.path(), false, Box::new(move |batch| tx.send(batch).unwrap()))
        .unwrap();

    std::fs::rename(dir.path().join("old"), dir.path().join("renamed")).unwrap();
    std::fs::remove_file(dir.path().join("renamed")).unwrap();

    let mut changes = Vec::new();
    while changes.len() < 3 {
        changes.extend(wait_for(&rt, &rx).unwrap());
    }
    let actions: Vec<_> = changes.iter().map(|c| (c.action, c.name.as_str())).collect();
    assert_eq!(
        actions,
        [
            (ChangeAction::RenamedOld, "old"),
            (ChangeAction::RenamedNew, "renamed"),
            (ChangeAction::Removed, "renamed"),
        ]
    );
    rt.close_directory_watcher(watcher).unwrap();
}

#[test]
fn test_subtree_watch_follows_new_directories() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let rt = Runtime::new();
    let (tx, rx) = unbounded();
    let watcher = rt
        .watch_directory(dir.path(), true, Box::new(move |batch| tx.send(batch).unwrap()))
        .unwrap();

    File::create(dir.path().join("sub").join("inner")).unwrap();
    assert_eq!(wait_for(&rt, &rx), Ok(vec![added("sub/inner")]));

    std::fs::create_dir(dir.path().join("late")).unwrap();
    assert_eq!(wait_for(&rt, &rx), Ok(vec![added("late")]));
    File::create(dir.path().join("late").join("deep")).unwrap();
    assert_eq!(wait_for(&rt, &rx), Ok(vec![added("late/deep")]));

    rt.close_directory_watcher(watcher).unwrap();
    assert_eq!(wait_for(&rt, &rx), Err(code::CANCELLED));
}

#[test]
fn test_watch_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let rt = Runtime::new();
    let err = rt
        .watch_directory(&dir.path().join("absent"), false, Box::new(|_| {}))
        .unwrap_err();
    assert_eq!(err, ErrorPair::new("watch_directory", libc::ENOENT as u32));
    assert_eq!(rt.handle_counts().watchers, 0);
}

// ============================================================================
// Process watcher
// ============================================================================

#[test]
fn test_process_exit_code_delivered_once() {
    let rt = Runtime::new();
    let (tx, rx) = unbounded();
    let process = rt
        .create_detached_watched_process(&argv(&["sh", "-c", "exit 7"]), Box::new(move |exit| tx.send(exit).unwrap()))
        .unwrap();

    let exit = wait_for(&rt, &rx);
    assert_eq!(exit.process, process);
    assert_eq!(exit.exit_code, 7);
    assert!(settles(&rt, &rx));
    assert_eq!(rt.process_id(process).unwrap_err().code, code::INVALID_HANDLE);
    assert_eq!(rt.handle_counts().processes, 0);
}

#[test]
fn test_terminate_process() {
    let rt = Runtime::new();
    let (tx, rx) = unbounded();
    let process = rt
        .create_detached_watched_process(&argv(&["sleep", "30"]), Box::new(move |exit| tx.send(exit).unwrap()))
        .unwrap();
    assert!(rt.process_id(process).unwrap() > 0);

    rt.terminate_process(process).unwrap();
    let exit = wait_for(&rt, &rx);
    assert_eq!(exit.exit_code, 128 + libc::SIGKILL as u32);
    assert_eq!(
        rt.terminate_process(process).unwrap_err(),
        ErrorPair::invalid_handle("terminate_process")
    );
}

#[test]
fn test_spawn_failure_is_synchronous() {
    let rt = Runtime::new();
    let err = rt
        .create_detached_watched_process(&argv(&["/nonexistent/osport-binary"]), Box::new(|_| {}))
        .unwrap_err();
    assert_eq!(err.code, libc::ENOENT as u32);
    assert_eq!(rt.handle_counts().processes, 0);
}

// ============================================================================
// Busy resources
// ============================================================================

#[test]
fn test_async_hash_marks_busy_until_decoded() {
    let rt = Runtime::new();
    let hash = rt.open_hash(HashAlgorithm::Sha256).unwrap();
    let (tx, rx) = unbounded();
    rt.hash_data_async(hash, vec![0u8; 1 << 20], Box::new(move |r| tx.send(r).unwrap()))
        .unwrap();

    assert_eq!(rt.hash_data(hash, b"x").unwrap_err(), ErrorPair::busy("hash_data"));
    assert_eq!(rt.hash_value(hash).unwrap_err(), ErrorPair::busy("hash_value"));
    assert_eq!(
        rt.hash_data_async(hash, vec![1], Box::new(|_| {})).unwrap_err(),
        ErrorPair::busy("hash_data_async")
    );

    let result = wait_for(&rt, &rx);
    assert_eq!(result.count, 1 << 20);
    assert_eq!(rt.hash_value(hash).unwrap().len(), 32);
    rt.close_hash(hash).unwrap();
}
