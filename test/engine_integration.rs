//! Completion engine integration tests
//!
//! Exercises the shared queue end to end: posting from many threads, the
//! non-blocking peek, worker-pool items and a file round trip through the
//! driver lanes.

use crossbeam_channel::{unbounded, Receiver, Sender};
use osport::runtime::completion::Descriptor;
use osport::{
    code, Delivery, Disposition, ErrorPair, FileAccess, IoBuffer, IoResult, OsportConfig, Runtime, WorkItem,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Pump the dispatch step until `rx` yields, failing after five seconds.
fn wait_for<T>(rt: &Runtime, rx: &Receiver<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Ok(value) = rx.try_recv() {
            return value;
        }
        rt.run_once(Duration::from_millis(20));
    }
    panic!("timed out waiting for a completion");
}

fn noop(_: &Runtime, _: u32, _: Descriptor, _: u32) -> Delivery {
    Delivery::none()
}

// ============================================================================
// Queue semantics
// ============================================================================

#[test]
fn test_each_completion_fetched_exactly_once() {
    let rt = Runtime::new();
    let producers: Vec<_> = (0..4usize)
        .map(|t| {
            let poster = rt.engine().poster();
            thread::spawn(move || {
                for i in 0..100u32 {
                    poster.post(i, noop, Descriptor(t * 1000 + i as usize), 0);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut seen = HashSet::new();
    while let Some(completion) = rt.engine().try_fetch() {
        assert!(seen.insert(completion.descriptor), "{:?} fetched twice", completion);
    }
    assert_eq!(seen.len(), 400);
    assert!(rt.engine().try_fetch().is_none());
}

#[test]
fn test_is_ready_caches_one_completion() {
    let rt = Runtime::new();
    assert!(!rt.is_ready());
    rt.engine().post(7, noop, Descriptor(1));
    assert!(rt.is_ready());
    assert!(rt.is_ready());
    assert_eq!(rt.engine().pending(), 1);

    let completion = rt.engine().fetch(Duration::ZERO).unwrap();
    assert_eq!((completion.count, completion.descriptor), (7, Descriptor(1)));
    assert!(!rt.is_ready());
}

#[test]
fn test_fetch_timeout_is_not_an_error() {
    let rt = Runtime::new();
    let started = Instant::now();
    assert!(rt.get_completion(Duration::from_millis(50)).is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));
}

// ============================================================================
// Work items
// ============================================================================

struct ThreadRecorder {
    worker: Option<thread::ThreadId>,
    tx: Sender<(thread::ThreadId, thread::ThreadId, u32)>,
}

impl WorkItem for ThreadRecorder {
    fn work(&mut self) -> u32 {
        self.worker = Some(thread::current().id());
        libc::ENOENT as u32
    }

    fn decode(self: Box<Self>, _rt: &Runtime, status: u32) -> Delivery {
        let ThreadRecorder { worker, tx } = *self;
        let dispatch = thread::current().id();
        Delivery::new(move || tx.send((worker.unwrap(), dispatch, status)).unwrap())
    }
}

#[test]
fn test_work_item_runs_off_dispatch_thread() {
    let rt = Runtime::new();
    let (tx, rx) = unbounded();
    rt.schedule_work(Box::new(ThreadRecorder { worker: None, tx })).unwrap();

    let (worker, dispatch, status) = wait_for(&rt, &rx);
    assert_ne!(worker, thread::current().id());
    assert_eq!(dispatch, thread::current().id());
    assert_eq!(status, libc::ENOENT as u32);
    assert_eq!(rt.engine().side_table().outstanding(), 0);
}

struct Blocker {
    started: Sender<()>,
    release: Receiver<()>,
}

impl WorkItem for Blocker {
    fn work(&mut self) -> u32 {
        let _ = self.started.send(());
        let _ = self.release.recv();
        0
    }

    fn decode(self: Box<Self>, _rt: &Runtime, _status: u32) -> Delivery {
        Delivery::none()
    }
}

#[test]
fn test_exhausted_pool_rejects_work() {
    let mut config = OsportConfig::default();
    config.workers.max_threads = 1;
    config.workers.queue_capacity = 1;
    let rt = Runtime::with_config(config);

    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded::<()>();
    let blocker = || {
        Box::new(Blocker {
            started: started_tx.clone(),
            release: release_rx.clone(),
        })
    };

    rt.schedule_work(blocker()).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    rt.schedule_work(blocker()).unwrap();
    assert_eq!(
        rt.schedule_work(blocker()).unwrap_err(),
        ErrorPair::new("schedule_work", code::EXHAUSTED)
    );

    drop(release_tx);
    for _ in 0..2 {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !rt.run_once(Duration::from_millis(20)) {
            assert!(Instant::now() < deadline, "queued work never completed");
        }
    }
}

// ============================================================================
// End to end through the driver
// ============================================================================

#[test]
fn test_file_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let rt = Runtime::new();
    let file = rt
        .open_file(&path, FileAccess::ReadWrite, Disposition::CreateNew)
        .unwrap();

    let (tx, rx) = unbounded::<IoResult>();
    let payload = IoBuffer::from_vec(b"completion".to_vec());
    let sender = tx.clone();
    rt.write_port(file, payload, 0, 10, Some(100), Box::new(move |r| sender.send(r).unwrap()))
        .unwrap();
    assert_eq!(wait_for(&rt, &rx), IoResult { count: 10, error: 0 });
    assert_eq!(rt.port_size(file).unwrap(), 110);

    let buffer = IoBuffer::new(16);
    let sender = tx.clone();
    rt.read_port(file, buffer.clone(), 2, 10, Some(100), Box::new(move |r| sender.send(r).unwrap()))
        .unwrap();
    assert_eq!(wait_for(&rt, &rx).count, 10);
    assert_eq!(&buffer.to_vec()[2..12], b"completion");
    assert_eq!(buffer.pins(), 1);

    rt.close_port(file).unwrap();
    assert_eq!(rt.port_size(file).unwrap_err().code, code::INVALID_HANDLE);
}

#[test]
fn test_overlapping_read_and_write_complete_independently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.bin");
    std::fs::write(&path, [b'a'; 32]).unwrap();
    let rt = Runtime::new();
    let file = rt
        .open_file(&path, FileAccess::ReadWrite, Disposition::OpenExisting)
        .unwrap();

    let (tx, rx) = unbounded::<(&str, IoResult)>();
    let reads = tx.clone();
    rt.read_port(file, IoBuffer::new(32), 0, 32, Some(0), Box::new(move |r| reads.send(("read", r)).unwrap()))
        .unwrap();
    let writes = tx;
    rt.write_port(
        file,
        IoBuffer::from_vec(vec![b'b'; 16]),
        0,
        16,
        Some(0),
        Box::new(move |r| writes.send(("write", r)).unwrap()),
    )
    .unwrap();

    let mut seen = vec![wait_for(&rt, &rx), wait_for(&rt, &rx)];
    seen.sort_by_key(|(tag, _)| *tag);
    assert_eq!(
        seen,
        [
            ("read", IoResult { count: 32, error: 0 }),
            ("write", IoResult { count: 16, error: 0 }),
        ]
    );
    for _ in 0..5 {
        rt.run_once(Duration::from_millis(20));
    }
    assert!(rx.try_recv().is_err());
    assert_eq!(rt.engine().side_table().outstanding(), 0);
    rt.close_port(file).unwrap();
}

#[test]
fn test_outstanding_buffer_outlives_caller() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::write(&path, b"kept alive").unwrap();
    let rt = Runtime::new();
    let file = rt
        .open_file(&path, FileAccess::Read, Disposition::OpenExisting)
        .unwrap();

    let (tx, rx) = unbounded();
    let buffer = IoBuffer::new(10);
    let observer = buffer.clone();
    let pinned = Arc::new(());
    let witness = Arc::clone(&pinned);
    rt.read_port(
        file,
        buffer,
        0,
        10,
        Some(0),
        Box::new(move |r| {
            drop(witness);
            tx.send(r).unwrap();
        }),
    )
    .unwrap();

    assert_eq!(wait_for(&rt, &rx).count, 10);
    assert_eq!(observer.to_vec(), b"kept alive");
    assert_eq!(Arc::strong_count(&pinned), 1);
    assert_eq!(rt.engine().side_table().outstanding(), 0);
}
