//! Request capture
//!
//! Turns request descriptors into log entries and hands them to the store.
//! Recording is fail-open: every failure is reported through tracing and
//! swallowed, and a slow store is abandoned after the configured budget.
//! Operators should expect gaps in the audit trail during storage outages.
//!
//! At most `max_pending` appends occupy the blocking pool at once. While a
//! stalled store holds them all, further entries are dropped immediately
//! rather than queued behind it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::entry::{HeaderAllowList, LogEntry, RequestDescriptor};
use crate::audit::store::{AuditLogStore, VerificationReport};
use crate::error::{AuditError, Result};

/// Default time a request waits for its audit entry to be committed.
pub const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Default number of appends allowed on the blocking pool at once.
pub const DEFAULT_MAX_PENDING_APPENDS: usize = 8;

/// Shared handle used by the request path to record entries
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    store: Arc<AuditLogStore>,
    allow_list: Arc<HeaderAllowList>,
    append_timeout: Duration,
    max_pending: usize,
    pending: Arc<Semaphore>,
}

impl AuditRecorder {
    pub fn new(
        store: Arc<AuditLogStore>,
        allow_list: HeaderAllowList,
        append_timeout: Duration,
    ) -> Self {
        Self {
            store,
            allow_list: Arc::new(allow_list),
            append_timeout,
            max_pending: DEFAULT_MAX_PENDING_APPENDS,
            pending: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING_APPENDS)),
        }
    }

    /// Cap the appends in flight on the blocking pool. Zero is treated as one.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        self.max_pending = max_pending;
        self.pending = Arc::new(Semaphore::new(max_pending));
        self
    }

    pub fn store(&self) -> &Arc<AuditLogStore> {
        &self.store
    }

    pub fn allow_list(&self) -> &HeaderAllowList {
        &self.allow_list
    }

    pub fn append_timeout(&self) -> Duration {
        self.append_timeout
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Appends currently holding a slot, including abandoned ones still
    /// stuck in storage.
    pub fn in_flight(&self) -> usize {
        self.max_pending - self.pending.available_permits()
    }

    /// Record one request. Never fails and never waits longer than the
    /// append budget.
    pub async fn record(&self, descriptor: &RequestDescriptor) {
        let entry = LogEntry::from_request(descriptor, &self.allow_list, Utc::now().timestamp());

        match self.try_record(entry).await {
            Ok(_) => {}
            Err(AuditError::Timeout(budget)) => {
                warn!(
                    "Audit entry for {} {} not committed within {:?}; continuing without waiting",
                    descriptor.method, descriptor.url, budget
                );
            }
            Err(AuditError::DeadlineExpired) => {
                warn!(
                    "Audit entry for {} {} abandoned: log busy past the {:?} budget",
                    descriptor.method, descriptor.url, self.append_timeout
                );
            }
            Err(AuditError::Saturated(max)) => {
                warn!(
                    "Audit entry for {} {} dropped: {} appends still pending on a slow store",
                    descriptor.method, descriptor.url, max
                );
            }
            Err(e) => {
                error!("CRITICAL: Failed to write to secure audit log: {}", e);
            }
        }
    }

    /// Append `entry` on the blocking pool and return the new root.
    ///
    /// Fails with `Saturated` without touching the pool when every slot is
    /// taken. On timeout the caller stops waiting. An append that already
    /// holds the store's lock still runs to completion; one still queued for
    /// the lock gives up once the budget has passed.
    pub async fn try_record(&self, entry: LogEntry) -> Result<String> {
        let permit = Arc::clone(&self.pending)
            .try_acquire_owned()
            .map_err(|_| AuditError::Saturated(self.max_pending))?;
        let deadline = Instant::now() + self.append_timeout;

        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            store.append_until(&entry, deadline)
        });

        match tokio::time::timeout(self.append_timeout, task).await {
            Ok(joined) => joined.map_err(|e| AuditError::Task(e.to_string()))?,
            Err(_) => Err(AuditError::Timeout(self.append_timeout)),
        }
    }

    /// Out-of-band integrity check.
    pub async fn verify(&self) -> Result<VerificationReport> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.verify_detailed())
            .await
            .map_err(|e| AuditError::Task(e.to_string()))?
    }
}

/// Periodically re-verify the log. Mismatches and unreadable storage are
/// reported at error level; request serving is never affected.
pub fn spawn_integrity_monitor(recorder: AuditRecorder, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match recorder.verify().await {
                Ok(report) if report.is_valid => {}
                Ok(report) => {
                    error!("Possible audit log tampering: {}", report.summary());
                }
                Err(e) => {
                    error!("Audit log could not be verified: {}", e);
                }
            }
        }
    })
}

/// Startup check, logged but not fatal.
pub async fn log_startup_integrity(recorder: &AuditRecorder) {
    match recorder.verify().await {
        Ok(report) if report.is_valid => info!("{}", report.summary()),
        Ok(report) => error!("Audit log failed startup verification: {}", report.summary()),
        Err(e) => error!("Audit log could not be verified at startup: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn recorder_in(dir: &std::path::Path) -> AuditRecorder {
        let store = AuditLogStore::new(dir.join("secure_audit.log"), dir.join("merkle_root.txt"));
        AuditRecorder::new(Arc::new(store), HeaderAllowList::default(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_record_appends_filtered_entry() {
        let dir = tempdir().unwrap();
        let recorder = recorder_in(dir.path());

        let descriptor = RequestDescriptor::new("GET", "http://localhost/health")
            .with_header("user-agent", "curl/8.4.0")
            .with_header("authorization", "Bearer secret");
        recorder.record(&descriptor).await;

        let entries = recorder.store().entries().unwrap();
        assert_eq!(entries.len(), 1);
        let entry: LogEntry = serde_json::from_str(&entries[0]).unwrap();
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.url, "http://localhost/health");
        assert_eq!(entry.headers.len(), 1);
        assert_eq!(entry.headers["user-agent"], "curl/8.4.0");

        let report = recorder.verify().await.unwrap();
        assert!(report.is_valid);
        assert_eq!(report.entry_count, 1);
    }

    #[tokio::test]
    async fn test_record_swallows_storage_failure() {
        let dir = tempdir().unwrap();
        let not_a_dir = dir.path().join("plain-file");
        fs::write(&not_a_dir, b"x").unwrap();

        let store = AuditLogStore::new(not_a_dir.join("audit.log"), not_a_dir.join("root.txt"));
        let recorder = AuditRecorder::new(Arc::new(store), HeaderAllowList::default(), Duration::from_secs(5));

        recorder.record(&RequestDescriptor::new("GET", "/")).await;

        let err = recorder
            .try_record(LogEntry::from_request(&RequestDescriptor::new("GET", "/"), recorder.allow_list(), 0))
            .await
            .unwrap_err();
        assert!(err.is_io());
        assert!(recorder.verify().await.unwrap_err().is_io());
    }

    #[tokio::test]
    async fn test_timeout_abandons_append_queued_behind_stalled_writer() {
        let dir = tempdir().unwrap();
        let store = Arc::new(AuditLogStore::new(
            dir.path().join("secure_audit.log"),
            dir.path().join("merkle_root.txt"),
        ));
        let budget = Duration::from_millis(50);
        let recorder = AuditRecorder::new(Arc::clone(&store), HeaderAllowList::default(), budget);

        let entry = LogEntry::from_request(&RequestDescriptor::new("GET", "/slow"), recorder.allow_list(), 7);
        let guard = store.hold_write_lock();
        let err = recorder.try_record(entry).await.unwrap_err();
        assert!(matches!(err, AuditError::Timeout(b) if b == budget));
        assert_eq!(recorder.in_flight(), 1);
        drop(guard);

        // The queued append sees its deadline has passed and writes nothing
        for _ in 0..200 {
            if recorder.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.in_flight(), 0);
        assert_eq!(store.entry_count().unwrap(), 0);
        assert!(store.verify().unwrap());

        let entry = LogEntry::from_request(&RequestDescriptor::new("GET", "/fast"), recorder.allow_list(), 8);
        recorder.try_record(entry).await.unwrap();
        assert_eq!(store.entry_count().unwrap(), 1);
        assert!(store.verify().unwrap());
    }

    #[tokio::test]
    async fn test_saturated_recorder_drops_without_queueing() {
        let dir = tempdir().unwrap();
        let store = Arc::new(AuditLogStore::new(
            dir.path().join("secure_audit.log"),
            dir.path().join("merkle_root.txt"),
        ));
        let recorder = AuditRecorder::new(Arc::clone(&store), HeaderAllowList::default(), Duration::from_millis(20))
            .with_max_pending(1);
        assert_eq!(recorder.max_pending(), 1);

        let guard = store.hold_write_lock();
        let first = LogEntry::from_request(&RequestDescriptor::new("GET", "/a"), recorder.allow_list(), 1);
        assert!(matches!(recorder.try_record(first).await, Err(AuditError::Timeout(_))));

        let second = LogEntry::from_request(&RequestDescriptor::new("GET", "/b"), recorder.allow_list(), 2);
        assert!(matches!(recorder.try_record(second).await, Err(AuditError::Saturated(1))));
        recorder.record(&RequestDescriptor::new("GET", "/c")).await;
        assert_eq!(recorder.in_flight(), 1);
        drop(guard);

        for _ in 0..200 {
            if recorder.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.entry_count().unwrap(), 0);
    }

    /// A log path that blocks forever on open stands in for hung storage.
    #[cfg(unix)]
    #[test]
    fn test_hung_store_leaves_blocking_pool_usable() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("secure_audit.log");
        let status = std::process::Command::new("mkfifo").arg(&log_path).status().unwrap();
        assert!(status.success());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(2)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = AuditLogStore::new(log_path.clone(), dir.path().join("merkle_root.txt"));
            let recorder = AuditRecorder::new(Arc::new(store), HeaderAllowList::default(), Duration::from_millis(50))
                .with_max_pending(1);

            let entry = LogEntry::from_request(&RequestDescriptor::new("GET", "/hang"), recorder.allow_list(), 1);
            assert!(matches!(recorder.try_record(entry).await, Err(AuditError::Timeout(_))));

            let started = std::time::Instant::now();
            for i in 0..16 {
                recorder.record(&RequestDescriptor::new("GET", format!("/r/{}", i))).await;
            }
            assert!(started.elapsed() < Duration::from_secs(1));
            assert_eq!(recorder.in_flight(), 1);

            let unrelated = tokio::task::spawn_blocking(|| 1);
            let joined = tokio::time::timeout(Duration::from_secs(2), unrelated).await;
            assert_eq!(joined.unwrap().unwrap(), 1);
        });

        // The hung append never returns; do not wait for it
        runtime.shutdown_timeout(Duration::from_millis(100));
    }
}
