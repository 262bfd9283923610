// The single owned "Server" aggregate (per design note in §9): every piece of
// shared mutable state lives here, behind one `parking_lot::Mutex`. Driver
// loops and HTTP handlers both go through this lock when they need to touch
// snapshots or test state; the report cache itself is read without holding
// the lock (readers clone the `Arc<str>` pointer).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::ServerConfig;
use crate::quick::TestingState;
use crate::snapshot::{Snapshot, SnapshotStub};

/// Human-readable status exposed via `/aquaserver/status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub status: String,
    #[serde(rename = "startupTimestamp")]
    pub startup_timestamp: i64,
    #[serde(rename = "lastErrorString")]
    pub last_error_string: Option<String>,
}

struct Inner {
    /// Newest-first, strictly ordered by creation time.
    snapshots: VecDeque<Arc<Snapshot>>,
    pending: Option<SnapshotStub>,
    trash: Vec<SnapshotStub>,
    last_error: Option<String>,
    progress: String,
}

/// The single process-wide aggregate. Cheap to clone (it's an `Arc`
/// internally); pass `Arc<Server>` into axum's `State` and into every driver
/// loop task.
pub struct Server {
    inner: Mutex<Inner>,
    /// The rendered report JSON. Writers (the report-builder loop) replace
    /// the whole `Arc<str>`; readers clone the pointer and serve without
    /// taking any lock.
    report_cache: RwLock<Arc<str>>,
    testing_state: RwLock<Arc<TestingState>>,
    pub config: ServerConfig,
    pub startup_timestamp: i64,
    last_dispatch_ms: AtomicI64,
}

impl Server {
    pub fn new(config: ServerConfig, startup_timestamp: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshots: VecDeque::new(),
                pending: None,
                trash: Vec::new(),
                last_error: None,
                progress: "starting up".to_owned(),
            }),
            report_cache: RwLock::new(Arc::from("{}")),
            testing_state: RwLock::new(Arc::new(TestingState::default())),
            config,
            startup_timestamp,
            last_dispatch_ms: AtomicI64::new(0),
        }
    }

    /// Snapshots newest-first, as an owned snapshot of the `Arc` pointers
    /// (cheap: only the `Vec` spine is cloned).
    pub fn snapshots(&self) -> Vec<Arc<Snapshot>> {
        self.inner.lock().snapshots.iter().cloned().collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    pub fn find_snapshot(&self, name: &str) -> Option<Arc<Snapshot>> {
        self.inner
            .lock()
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Adds a freshly-constructed snapshot at the front (newest) of the list.
    pub fn push_snapshot(&self, snapshot: Arc<Snapshot>) {
        let mut inner = self.inner.lock();
        inner.snapshots.push_front(snapshot);
        inner.pending = None;
    }

    pub fn set_pending(&self, stub: Option<SnapshotStub>) {
        self.inner.lock().pending = stub;
    }

    pub fn pending(&self) -> Option<SnapshotStub> {
        self.inner.lock().pending.clone()
    }

    /// Retires snapshots beyond `retained_count` or older than
    /// `retention_hours`, moving them onto the trash list (never the two
    /// newest, never `pending`/the active head).
    pub fn retire_old_snapshots(&self, now_ms: i64) -> Vec<Arc<Snapshot>> {
        let retention_ms = self.config.retention_hours as i64 * 3_600_000;
        let mut inner = self.inner.lock();
        let mut retired = Vec::new();
        // Always keep at least the 3 newest regardless of other bounds (the
        // creator loop moves anything past the third-newest to trash; the
        // count/age bounds below are a secondary, stricter retention cap).
        let keep_at_least = 3usize.min(inner.snapshots.len());
        let mut i = inner.snapshots.len();
        while i > keep_at_least {
            i -= 1;
            let too_many = inner.snapshots.len() > self.config.retained_count;
            let too_old = now_ms - inner.snapshots[i].timestamp > retention_ms;
            if too_many || too_old {
                if let Some(s) = inner.snapshots.remove(i) {
                    retired.push(s);
                }
            }
        }
        for s in &retired {
            inner.trash.push(SnapshotStub::from(s.as_ref()));
        }
        retired
    }

    /// Moves every snapshot past the third-newest to trash, per the creator
    /// loop's algorithm (§4.11).
    pub fn trash_beyond_third_newest(&self) -> Vec<Arc<Snapshot>> {
        let mut inner = self.inner.lock();
        let mut retired = Vec::new();
        while inner.snapshots.len() > 3 {
            if let Some(s) = inner.snapshots.pop_back() {
                inner.trash.push(SnapshotStub::from(s.as_ref()));
                retired.push(s);
            }
        }
        retired
    }

    pub fn trash_stubs(&self) -> Vec<SnapshotStub> {
        self.inner.lock().trash.clone()
    }

    pub fn remove_trash_stub(&self, name: &str) {
        self.inner.lock().trash.retain(|s| s.name != name);
    }

    pub fn restore_trash(&self, stubs: Vec<SnapshotStub>) {
        self.inner.lock().trash = stubs;
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{}", message);
        self.inner.lock().last_error = Some(message);
    }

    pub fn set_progress(&self, message: impl Into<String>) {
        self.inner.lock().progress = message.into();
    }

    pub fn status(&self) -> Status {
        let inner = self.inner.lock();
        Status {
            status: inner.progress.clone(),
            startup_timestamp: self.startup_timestamp,
            last_error_string: inner.last_error.clone(),
        }
    }

    pub fn report_json(&self) -> Arc<str> {
        self.report_cache.read().clone()
    }

    pub fn set_report_json(&self, json: Arc<str>) {
        *self.report_cache.write() = json;
    }

    pub fn testing_state(&self) -> Arc<TestingState> {
        self.testing_state.read().clone()
    }

    pub fn set_testing_state(&self, state: TestingState) {
        *self.testing_state.write() = Arc::new(state);
    }

    pub fn record_dispatch(&self, now_ms: i64) {
        self.last_dispatch_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// A persistable snapshot of just the parts of [`Server`] that §8's
/// round-trip invariant cares about (used by `persistence.rs`).
pub struct PersistableState {
    pub snapshots: Vec<Arc<Snapshot>>,
    pub pending: Option<SnapshotStub>,
    pub trash: Vec<SnapshotStub>,
}

impl Server {
    pub fn persistable_state(&self) -> PersistableState {
        let inner = self.inner.lock();
        PersistableState {
            snapshots: inner.snapshots.iter().cloned().collect(),
            pending: inner.pending.clone(),
            trash: inner.trash.clone(),
        }
    }

    pub fn restore_state(&self, snapshots: Vec<Snapshot>, pending: Option<SnapshotStub>, trash: Vec<SnapshotStub>) {
        let mut inner = self.inner.lock();
        inner.snapshots = snapshots.into_iter().map(Arc::new).collect();
        inner.pending = pending;
        inner.trash = trash;
    }
}
