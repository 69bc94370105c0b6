//! Detokenizer that reloads its token databases when their files change.
//!
//! [`AutoUpdatingDetokenizer`] keeps the current [`Detokenizer`] behind an [`ArcSwap`].
//! Before each decode (or from a background poller) it compares source modification times
//! with the last ones seen, at most once per poll period; when one has advanced it loads a
//! fresh database and swaps in a brand-new detokenizer. Readers always see a complete old
//! or new snapshot.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokdetok::AutoUpdatingDetokenizer;
//!
//! let detok = AutoUpdatingDetokenizer::builder(["tokens.csv", "more/#.*"])
//!     .min_poll_period(Duration::from_millis(500))
//!     .open()?;
//! println!("{}", detok.detokenize(b"\xab\xcd\x00\x00"));
//! # Ok::<(), tokdetok::DatabaseError>(())
//! ```

use crate::database::{
    has_database_suffix, CsvDatabaseLoader, Database, DatabaseError, DatabaseLoader, DatabaseSource,
};
use crate::detokenize::{rewrite_stream, DetokenizedResult, Detokenizer, DetokenizerOptions};
use arc_swap::ArcSwap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

pub const DEFAULT_MIN_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Clock and file-stat capability, replaceable in tests.
pub trait ModificationObserver: Send + Sync {
    fn now(&self) -> Instant;

    /// Last modification time of `path`, or `None` if it does not exist. For a directory
    /// this is the latest of the directory itself and its database files.
    fn modified(&self, path: &Path) -> Option<SystemTime>;
}

/// Reads modification times from the file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemObserver;

impl ModificationObserver for FileSystemObserver {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn modified(&self, path: &Path) -> Option<SystemTime> {
        let meta = fs::metadata(path).ok()?;
        let own = meta.modified().ok()?;
        if !meta.is_dir() {
            return Some(own);
        }
        let newest_file = fs::read_dir(path)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| has_database_suffix(&e.path()))
            .filter_map(|e| e.metadata().ok()?.modified().ok())
            .max();
        Some(newest_file.map_or(own, |t| t.max(own)))
    }
}

/// Reported after every reload attempt.
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    pub success: bool,
    pub error: Option<String>,
    /// Generation after the attempt; unchanged when it failed.
    pub generation: u64,
    pub entries: usize,
}

pub type ReloadCallback = Arc<dyn Fn(ReloadEvent) + Send + Sync>;

/// Per-source bookkeeping.
struct SourceState {
    source: DatabaseSource,
    last_modified: Option<SystemTime>,
    database: Option<Database>,
}

struct PollState {
    last_poll: Option<Instant>,
    sources: Vec<SourceState>,
    entries: usize,
}

/// Detokenizer over database files that are reloaded when they change.
pub struct AutoUpdatingDetokenizer {
    current: ArcSwap<Detokenizer>,
    generation: AtomicU64,
    options: DetokenizerOptions,
    min_poll_period: Duration,
    loader: Box<dyn DatabaseLoader>,
    observer: Box<dyn ModificationObserver>,
    reload_callback: Option<ReloadCallback>,
    /// Held while polling; contention means another poll is already running.
    poll: Mutex<PollState>,
}

/// Builder for [`AutoUpdatingDetokenizer`].
pub struct AutoUpdatingDetokenizerBuilder {
    sources: Vec<String>,
    min_poll_period: Duration,
    options: DetokenizerOptions,
    loader: Box<dyn DatabaseLoader>,
    observer: Box<dyn ModificationObserver>,
    reload_callback: Option<ReloadCallback>,
}

impl AutoUpdatingDetokenizerBuilder {
    pub fn min_poll_period(mut self, period: Duration) -> Self {
        self.min_poll_period = period;
        self
    }

    pub fn options(mut self, options: DetokenizerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn loader(mut self, loader: impl DatabaseLoader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn observer(mut self, observer: impl ModificationObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Called after each reload attempt, once the poll lock has been released, so the
    /// callback may use the detokenizer.
    pub fn on_reload<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReloadEvent) + Send + Sync + 'static,
    {
        self.reload_callback = Some(Arc::new(callback));
        self
    }

    /// Parse the sources and perform the initial load. Missing files start out empty;
    /// a selector with an invalid domain pattern is an error.
    pub fn open(self) -> Result<AutoUpdatingDetokenizer, DatabaseError> {
        let sources = self
            .sources
            .iter()
            .map(|s| DatabaseSource::parse(s))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|source| SourceState { source, last_modified: None, database: None })
            .collect();
        let detok = AutoUpdatingDetokenizer {
            current: ArcSwap::from_pointee(Detokenizer::with_options(
                Database::new(),
                self.options.clone(),
            )),
            generation: AtomicU64::new(0),
            options: self.options,
            min_poll_period: self.min_poll_period,
            loader: self.loader,
            observer: self.observer,
            reload_callback: self.reload_callback,
            poll: Mutex::new(PollState { last_poll: None, sources, entries: 0 }),
        };
        detok.poll_now();
        Ok(detok)
    }
}

impl AutoUpdatingDetokenizer {
    /// Start building from `path[#domain-regex]` selectors.
    pub fn builder<I, S>(sources: I) -> AutoUpdatingDetokenizerBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AutoUpdatingDetokenizerBuilder {
            sources: sources.into_iter().map(Into::into).collect(),
            min_poll_period: DEFAULT_MIN_POLL_PERIOD,
            options: DetokenizerOptions::default(),
            loader: Box::new(CsvDatabaseLoader),
            observer: Box::new(FileSystemObserver),
            reload_callback: None,
        }
    }

    /// Open with the CSV loader and file-system observer.
    pub fn new<I, S>(sources: I, min_poll_period: Duration) -> Result<Self, DatabaseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AutoUpdatingDetokenizer::builder(sources)
            .min_poll_period(min_poll_period)
            .open()
    }

    /// Number of successful loads so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Poll if the period has elapsed, then return the current snapshot.
    pub fn snapshot(&self) -> Arc<Detokenizer> {
        self.poll_if_due();
        self.current.load_full()
    }

    /// Current snapshot without polling.
    pub fn current(&self) -> Arc<Detokenizer> {
        self.current.load_full()
    }

    pub fn detokenize(&self, data: &[u8]) -> DetokenizedResult {
        self.snapshot().detokenize(data)
    }

    pub fn detokenize_text(&self, text: &str, recursion: usize) -> String {
        self.snapshot().detokenize_text(text, recursion)
    }

    pub fn detokenize_base64(&self, data: &[u8], prefix: u8, recursion: usize) -> Vec<u8> {
        self.snapshot().detokenize_base64(data, prefix, recursion)
    }

    /// Rewrite a live stream, picking up database changes between messages.
    pub fn detokenize_base64_live<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        prefix: u8,
        recursion: usize,
    ) -> io::Result<()> {
        rewrite_stream(reader, writer, prefix, |message| {
            self.snapshot().rewrite_base64_message(message, recursion)
        })
    }

    fn poll_if_due(&self) {
        let event = {
            let mut state = match self.poll.try_lock() {
                Ok(state) => state,
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("previous poll panicked; recovering poll state");
                    poisoned.into_inner()
                }
            };
            let now = self.observer.now();
            if let Some(last) = state.last_poll {
                if now.saturating_duration_since(last) < self.min_poll_period {
                    return;
                }
            }
            self.refresh(&mut state, now).1
        };
        if let Some(event) = event {
            self.notify(event);
        }
    }

    /// Check every source now, regardless of the poll period. Returns whether a new
    /// snapshot was installed.
    pub fn poll_now(&self) -> bool {
        let (changed, event) = {
            let mut state = self.lock_poll();
            let now = self.observer.now();
            self.refresh(&mut state, now)
        };
        if let Some(event) = event {
            self.notify(event);
        }
        changed
    }

    fn lock_poll(&self) -> MutexGuard<'_, PollState> {
        match self.poll.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reload changed sources. The event is returned rather than delivered so that the
    /// callback runs without the poll lock held.
    fn refresh(&self, state: &mut PollState, now: Instant) -> (bool, Option<ReloadEvent>) {
        state.last_poll = Some(now);
        let mut changed = false;
        let mut errors = Vec::new();
        for src in &mut state.sources {
            let path = &src.source.path;
            let Some(modified) = self.observer.modified(path) else {
                debug!(path = %path.display(), "token database source missing; keeping last load");
                continue;
            };
            if src.last_modified.is_some_and(|last| modified <= last) {
                continue;
            }
            debug!(path = %path.display(), "token database source modified");
            match self.loader.load(path) {
                Ok(mut db) => {
                    db.retain_domains(&src.source.domains);
                    src.database = Some(db);
                    src.last_modified = Some(modified);
                    changed = true;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "token database reload failed; keeping previous snapshot");
                    errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if changed {
            let mut merged = Database::new();
            for db in state.sources.iter().filter_map(|s| s.database.as_ref()) {
                merged.merge(db);
            }
            state.entries = merged.len();
            let entries = state.entries;
            self.current
                .store(Arc::new(Detokenizer::with_options(merged, self.options.clone())));
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            info!(generation, entries, "token database reloaded");
        }
        let event = (changed || !errors.is_empty()).then(|| ReloadEvent {
            success: errors.is_empty(),
            error: if errors.is_empty() { None } else { Some(errors.join("; ")) },
            generation: self.generation(),
            entries: state.entries,
        });
        (changed, event)
    }

    fn notify(&self, event: ReloadEvent) {
        if let Some(callback) = &self.reload_callback {
            callback(event);
        }
    }

    /// Poll from a background thread every `period` until the handle is dropped or the
    /// detokenizer itself goes away.
    pub fn spawn_poller(self: &Arc<Self>, period: Duration) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(period) {
                Err(mpsc::RecvTimeoutError::Timeout) => match weak.upgrade() {
                    Some(detok) => detok.poll_if_due(),
                    None => break,
                },
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });
        PollerHandle { shutdown_tx: Some(shutdown_tx), handle: Some(handle) }
    }

    /// Paths being watched.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock_poll().sources.iter().map(|s| s.source.path.clone()).collect()
    }
}

/// Stops the background poller when dropped.
pub struct PollerHandle {
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PollerHandle {
    /// Whether the polling thread has exited, e.g. because the detokenizer was dropped.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
