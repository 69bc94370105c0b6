//! Auto-updating detokenizer: polling, reloads, retained snapshots and domain selection.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokdetok::{
    AutoUpdatingDetokenizer, CsvDatabaseLoader, Database, DatabaseError, DatabaseLoader,
    DetokenizerOptions, ModificationObserver, ReloadEvent,
};

struct FakeState {
    now: Instant,
    mtimes: HashMap<PathBuf, SystemTime>,
}

/// Settable clock and modification times.
#[derive(Clone)]
struct FakeObserver(Arc<Mutex<FakeState>>);

impl FakeObserver {
    fn new() -> Self {
        FakeObserver(Arc::new(Mutex::new(FakeState { now: Instant::now(), mtimes: HashMap::new() })))
    }

    fn advance(&self, by: Duration) {
        self.0.lock().expect("lock").now += by;
    }

    fn touch(&self, path: &Path, secs: u64) {
        self.0
            .lock()
            .expect("lock")
            .mtimes
            .insert(path.to_path_buf(), UNIX_EPOCH + Duration::from_secs(secs));
    }

    fn forget(&self, path: &Path) {
        self.0.lock().expect("lock").mtimes.remove(path);
    }
}

impl ModificationObserver for FakeObserver {
    fn now(&self) -> Instant {
        self.0.lock().expect("lock").now
    }

    fn modified(&self, path: &Path) -> Option<SystemTime> {
        self.0.lock().expect("lock").mtimes.get(path).copied()
    }
}

const ONE: &[u8] = b"\x01\x00\x00\x00";

fn write_db(path: &Path, string: &str) {
    fs::write(path, format!("00000001,,\"{}\"\n", string)).expect("write database");
}

fn source(path: &Path) -> String {
    path.display().to_string()
}

/// One database file, loaded at mtime 100 with a one second poll period.
fn setup(dir: &tempfile::TempDir) -> (PathBuf, FakeObserver, AutoUpdatingDetokenizer) {
    let path = dir.path().join("tokens.csv");
    write_db(&path, "first");
    let observer = FakeObserver::new();
    observer.touch(&path, 100);
    let detok = AutoUpdatingDetokenizer::builder([source(&path)])
        .min_poll_period(Duration::from_secs(1))
        .observer(observer.clone())
        .open()
        .expect("open");
    (path, observer, detok)
}

#[test]
fn test_initial_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, _, detok) = setup(&dir);
    assert_eq!(detok.generation(), 1);
    assert_eq!(detok.paths(), vec![path]);
    assert_eq!(detok.detokenize(ONE).to_string(), "first");
}

#[test]
fn test_reload_waits_for_poll_period() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, observer, detok) = setup(&dir);

    write_db(&path, "second");
    observer.touch(&path, 200);
    observer.advance(Duration::from_millis(500));
    assert_eq!(detok.detokenize(ONE).to_string(), "first");

    observer.advance(Duration::from_millis(600));
    assert_eq!(detok.detokenize(ONE).to_string(), "second");
    assert_eq!(detok.generation(), 2);
}

#[test]
fn test_unchanged_mtime_does_not_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, observer, detok) = setup(&dir);

    write_db(&path, "second");
    observer.advance(Duration::from_secs(5));
    assert_eq!(detok.detokenize(ONE).to_string(), "first");
    assert_eq!(detok.generation(), 1);
}

#[test]
fn test_old_snapshot_stays_valid_after_swap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, observer, detok) = setup(&dir);
    let before = detok.current();

    write_db(&path, "second");
    observer.touch(&path, 200);
    assert!(detok.poll_now());

    assert_eq!(before.detokenize(ONE).to_string(), "first");
    assert_eq!(detok.current().detokenize(ONE).to_string(), "second");
    assert!(!Arc::ptr_eq(&before, &detok.current()));
}

#[test]
fn test_missing_file_keeps_last_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, observer, detok) = setup(&dir);

    fs::remove_file(&path).expect("remove");
    observer.forget(&path);
    observer.advance(Duration::from_secs(2));
    assert_eq!(detok.detokenize(ONE).to_string(), "first");
    assert_eq!(detok.generation(), 1);

    // Recreated later.
    write_db(&path, "back");
    observer.touch(&path, 300);
    observer.advance(Duration::from_secs(2));
    assert_eq!(detok.detokenize(ONE).to_string(), "back");
}

#[test]
fn test_missing_at_startup_starts_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("later.csv");
    let observer = FakeObserver::new();
    let detok = AutoUpdatingDetokenizer::builder([source(&path)])
        .observer(observer.clone())
        .open()
        .expect("open");
    assert_eq!(detok.generation(), 0);
    assert!(!detok.detokenize(ONE).ok());

    write_db(&path, "arrived");
    observer.touch(&path, 1);
    observer.advance(Duration::from_secs(2));
    assert_eq!(detok.detokenize(ONE).to_string(), "arrived");
}

#[test]
fn test_failed_reload_keeps_previous_and_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tokens.csv");
    write_db(&path, "good");
    let observer = FakeObserver::new();
    observer.touch(&path, 100);
    let events: Arc<Mutex<Vec<ReloadEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    let detok = AutoUpdatingDetokenizer::builder([source(&path)])
        .observer(observer.clone())
        .on_reload(move |event| sink.lock().expect("lock").push(event))
        .open()
        .expect("open");

    fs::write(&path, b"\xff\xfe not utf-8").expect("write");
    observer.touch(&path, 200);
    assert!(!detok.poll_now());
    assert_eq!(detok.detokenize(ONE).to_string(), "good");

    let events = events.lock().expect("lock");
    assert_eq!(events.len(), 2);
    assert!(events[0].success);
    assert_eq!(events[0].generation, 1);
    assert_eq!(events[0].entries, 1);
    assert!(!events[1].success);
    assert_eq!(events[1].generation, 1);
    assert!(events[1].error.is_some());
}

#[test]
fn test_domain_selection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tokens.csv");
    fs::write(
        &path,
        "00000001,,,\"default\"\n00000001,,net,\"network\"\n00000002,,net,\"net only\"\n",
    )
    .expect("write");
    let net = DetokenizerOptions { domain: "net".to_string(), ..DetokenizerOptions::default() };

    let plain = AutoUpdatingDetokenizer::builder([source(&path)])
        .options(net.clone())
        .open()
        .expect("open");
    assert!(!plain.detokenize(b"\x02\x00\x00\x00").ok());

    let all = AutoUpdatingDetokenizer::builder([format!("{}#.*", source(&path))])
        .options(net.clone())
        .open()
        .expect("open");
    assert_eq!(all.detokenize(ONE).to_string(), "network");
    assert_eq!(all.detokenize(b"\x02\x00\x00\x00").to_string(), "net only");

    let default_only = AutoUpdatingDetokenizer::builder([source(&path)])
        .open()
        .expect("open");
    assert_eq!(default_only.detokenize(ONE).to_string(), "default");

    assert!(AutoUpdatingDetokenizer::builder([format!("{}#[", source(&path))])
        .open()
        .is_err());
}

#[test]
fn test_directory_source_loads_csv_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("a.csv"), "00000001,,\"from a\"\n").expect("write");
    fs::write(dir.path().join("b.csv"), "00000002,,\"from b\"\n").expect("write");
    fs::write(dir.path().join("notes.txt"), "00000003,,\"ignored\"\n").expect("write");

    let detok = AutoUpdatingDetokenizer::new([source(dir.path())], Duration::from_secs(1))
        .expect("open");
    assert_eq!(detok.detokenize(ONE).to_string(), "from a");
    assert_eq!(detok.detokenize(b"\x02\x00\x00\x00").to_string(), "from b");
    assert!(!detok.detokenize(b"\x03\x00\x00\x00").ok());
}

#[test]
fn test_multiple_sources_merge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = dir.path().join("first.csv");
    let second = dir.path().join("second.csv");
    fs::write(&first, "00000001,,\"one\"\n").expect("write");
    fs::write(&second, "00000002,,\"two\"\n").expect("write");
    let observer = FakeObserver::new();
    observer.touch(&first, 1);
    observer.touch(&second, 1);
    let detok = AutoUpdatingDetokenizer::builder([source(&first), source(&second)])
        .observer(observer.clone())
        .open()
        .expect("open");
    assert_eq!(detok.detokenize(ONE).to_string(), "one");

    // Only the second file changes; the first one's entries remain.
    fs::write(&second, "00000002,,\"deux\"\n").expect("write");
    observer.touch(&second, 2);
    assert!(detok.poll_now());
    assert_eq!(detok.detokenize(ONE).to_string(), "one");
    assert_eq!(detok.detokenize(b"\x02\x00\x00\x00").to_string(), "deux");
}

#[test]
fn test_background_poller_reloads_and_stops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, observer, detok) = setup(&dir);
    let detok = Arc::new(detok);
    let poller = detok.spawn_poller(Duration::from_millis(5));

    write_db(&path, "polled");
    observer.touch(&path, 200);
    observer.advance(Duration::from_secs(2));

    let deadline = Instant::now() + Duration::from_secs(5);
    while detok.generation() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(detok.generation(), 2);
    assert_eq!(detok.current().detokenize(ONE).to_string(), "polled");
    drop(poller);

    // Nothing polls once the handle is gone.
    write_db(&path, "after stop");
    observer.touch(&path, 300);
    observer.advance(Duration::from_secs(2));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(detok.generation(), 2);
    assert_eq!(detok.current().detokenize(ONE).to_string(), "polled");
}

#[test]
fn test_poller_exits_when_detokenizer_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, _, detok) = setup(&dir);
    let detok = Arc::new(detok);
    let poller = detok.spawn_poller(Duration::from_millis(5));
    assert!(!poller.is_finished());
    drop(detok);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !poller.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(poller.is_finished());
}

/// CSV loader whose second load panics.
struct PanicsOnSecondLoad(AtomicUsize);

impl DatabaseLoader for PanicsOnSecondLoad {
    fn load(&self, path: &Path) -> Result<Database, DatabaseError> {
        if self.0.fetch_add(1, Ordering::SeqCst) == 1 {
            panic!("loader failure");
        }
        CsvDatabaseLoader.load(path)
    }
}

#[test]
fn test_polling_resumes_after_loader_panic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tokens.csv");
    write_db(&path, "first");
    let observer = FakeObserver::new();
    observer.touch(&path, 100);
    let detok = AutoUpdatingDetokenizer::builder([source(&path)])
        .min_poll_period(Duration::from_secs(1))
        .loader(PanicsOnSecondLoad(AtomicUsize::new(0)))
        .observer(observer.clone())
        .open()
        .expect("open");

    observer.touch(&path, 200);
    observer.advance(Duration::from_secs(2));
    assert!(catch_unwind(AssertUnwindSafe(|| detok.detokenize(ONE))).is_err());
    assert_eq!(detok.generation(), 1);

    // Automatic polling still picks up changes.
    write_db(&path, "recovered");
    observer.touch(&path, 300);
    observer.advance(Duration::from_secs(2));
    assert_eq!(detok.detokenize(ONE).to_string(), "recovered");
    assert_eq!(detok.generation(), 2);
}

#[test]
fn test_reload_callback_may_use_detokenizer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tokens.csv");
    write_db(&path, "first");
    let observer = FakeObserver::new();
    observer.touch(&path, 100);
    let handle: Arc<OnceLock<Weak<AutoUpdatingDetokenizer>>> = Arc::default();
    let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
    let (cb_handle, cb_seen) = (Arc::clone(&handle), Arc::clone(&seen));
    let detok = Arc::new(
        AutoUpdatingDetokenizer::builder([source(&path)])
            .observer(observer.clone())
            .on_reload(move |_| {
                if let Some(detok) = cb_handle.get().and_then(Weak::upgrade) {
                    cb_seen.lock().expect("lock").push(detok.paths().len());
                }
            })
            .open()
            .expect("open"),
    );
    handle.set(Arc::downgrade(&detok)).expect("set once");

    write_db(&path, "second");
    observer.touch(&path, 200);
    assert!(detok.poll_now());

    observer.touch(&path, 300);
    observer.advance(Duration::from_secs(2));
    assert_eq!(detok.detokenize(ONE).to_string(), "second");
    assert_eq!(*seen.lock().expect("lock"), vec![1, 1]);
}

#[test]
fn test_live_stream_uses_current_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, _, detok) = setup(&dir);
    let input = format!("boot {}\n", tokdetok::prefixed_base64(ONE, '$'));
    let mut out = Vec::new();
    detok
        .detokenize_base64_live(std::io::Cursor::new(input), &mut out, b'$', 9)
        .expect("rewrite");
    assert_eq!(out, b"boot first\n".to_vec());
    assert_eq!(detok.detokenize_base64(b"[$AQAAAA==]", b'$', 9), b"[first]".to_vec());
}
