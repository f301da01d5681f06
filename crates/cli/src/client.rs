//! Sync client: pull a product subtree once, or push local changes forever
//!
//! The push loop primes its tracker with one scan, then every interval scans
//! the root, archives new and modified files and sends them together with
//! the deleted paths in one Apply. A transport failure retries the same
//! request after a fixed delay until it gets through or the loop is
//! cancelled. A reply with a non-zero status ends the cycle without a retry;
//! the changes stay pending and go out again next cycle, unless the server
//! already wrote them and only failed to record them.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use confsync_core::archive::{self, Compression, UnpackSummary};
use confsync_core::config::{ClientConfig, ScanInterval};
use confsync_core::protocol::status;
use confsync_core::{ApplyReply, ApplyRequest, FetchRequest, FileStateTracker, ScanResult};
use confsync_transport::{ConfigTransport, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] confsync_core::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server refused to send {product} (status {status}): {message}")]
    FetchRejected {
        product: String,
        status: i32,
        message: String,
    },
}

/// How a failed Apply is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed wait between attempts
    pub delay: Duration,
    /// Log an alert after every this many consecutive failures
    pub alert_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            alert_after: 6,
        }
    }
}

/// What one push cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing changed since the last scan
    Idle,
    /// The server accepted the changeset
    Sent { result: ScanResult, message: String },
    /// The server answered with a non-zero status; see [`SyncClient::push_once`]
    Rejected {
        result: ScanResult,
        status: i32,
        message: String,
    },
    /// Cancelled before the changeset got through; it will be detected again
    Cancelled,
}

/// Mirrors one local root into one product subtree on the server
pub struct SyncClient<T> {
    transport: T,
    tracker: FileStateTracker,
    product: String,
    commit_ref: String,
    compression: Compression,
    interval: ScanInterval,
    retry: RetryPolicy,
}

impl<T: ConfigTransport> SyncClient<T> {
    /// Create a client for the root and product named in `config`
    ///
    /// # Errors
    /// Returns an error if an exclude pattern is invalid.
    pub fn new(transport: T, config: &ClientConfig) -> Result<Self, ClientError> {
        let tracker = FileStateTracker::new(&config.root).with_excludes(&config.exclude)?;
        Ok(Self {
            transport,
            tracker,
            product: config.product.clone(),
            commit_ref: config.commit_ref.clone(),
            compression: config.compression,
            interval: config.interval,
            retry: RetryPolicy {
                delay: config.retry_delay(),
                alert_after: config.alert_after.max(1),
            },
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: ScanInterval) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn tracker(&self) -> &FileStateTracker {
        &self.tracker
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Fetch the whole product subtree and unpack it under the local root
    ///
    /// # Errors
    /// Fails on the first problem: transport failure, a non-zero status or
    /// an archive that cannot be unpacked.
    pub async fn pull_once(&self) -> Result<UnpackSummary, ClientError> {
        let reply = self
            .transport
            .fetch(FetchRequest {
                product: self.product.clone(),
                commit_ref: self.commit_ref.clone(),
            })
            .await?;

        if !reply.is_ok() {
            return Err(ClientError::FetchRejected {
                product: self.product.clone(),
                status: reply.status,
                message: reply.message,
            });
        }

        debug!("received {} byte archive for {}", reply.archive.len(), self.product);
        let summary = archive::unpack(&reply.archive, self.tracker.root())?;
        info!(
            "pulled {}: {} files ({} bytes) into {}",
            self.product,
            summary.files,
            summary.bytes,
            self.tracker.root().display()
        );
        Ok(summary)
    }

    /// Record the current tree as the baseline without sending anything
    ///
    /// # Errors
    /// Returns an error if the root cannot be scanned.
    pub fn prime(&mut self) -> Result<usize, ClientError> {
        self.tracker.scan()?;
        Ok(self.tracker.state().len())
    }

    /// Run one scan-pack-send cycle
    ///
    /// The scan is committed once the server has the files: on success, or
    /// on `RECORD_FAILED`. Any other status leaves the changes pending.
    ///
    /// # Errors
    /// Returns an error if the scan or the archive fails. Tracker state is
    /// left as it was, so the same changes are picked up next cycle.
    pub async fn push_once(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, ClientError> {
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        let pending = self.tracker.prepare()?;
        if pending.result().is_empty() {
            self.tracker.commit(pending);
            return Ok(CycleOutcome::Idle);
        }
        let result = pending.result().clone();

        let archive = if result.has_content() {
            archive::pack(self.tracker.root(), result.changed_files(), self.compression)?
        } else {
            Bytes::new()
        };
        let request = ApplyRequest {
            product: self.product.clone(),
            commit_ref: self.commit_ref.clone(),
            deleted: result.deleted_files.iter().cloned().collect(),
            archive,
        };
        debug!(
            "sending {} new, {} modified, {} deleted ({} byte archive)",
            result.new_files.len(),
            result.modified_files.len(),
            result.deleted_files.len(),
            request.archive.len()
        );

        let Some(reply) = self.apply_with_retry(request, cancel).await else {
            return Ok(CycleOutcome::Cancelled);
        };
        if reply.is_ok() || reply.status == status::RECORD_FAILED {
            self.tracker.commit(pending);
        }

        if reply.is_ok() {
            info!(
                "pushed {} changed and {} deleted files: {}",
                result.new_files.len() + result.modified_files.len(),
                result.deleted_files.len(),
                reply.message
            );
            Ok(CycleOutcome::Sent {
                result,
                message: reply.message,
            })
        } else {
            error!(
                "server rejected changeset for {} (status {}): {}",
                self.product, reply.status, reply.message
            );
            if reply.status != status::RECORD_FAILED {
                warn!("changes for {} stay pending until the server accepts them", self.product);
            }
            Ok(CycleOutcome::Rejected {
                result,
                status: reply.status,
                message: reply.message,
            })
        }
    }

    /// Send `request` until a reply arrives; `None` if cancelled first
    async fn apply_with_retry(
        &self,
        request: ApplyRequest,
        cancel: &CancellationToken,
    ) -> Option<ApplyReply> {
        let mut failures: u32 = 0;
        loop {
            match self.transport.apply(request.clone()).await {
                Ok(reply) => {
                    if failures > 0 {
                        info!("apply succeeded after {failures} failed attempts");
                    }
                    return Some(reply);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "apply to {} failed (attempt {failures}), retrying in {}s: {e}",
                        self.product,
                        self.retry.delay.as_secs()
                    );
                    if failures % self.retry.alert_after.max(1) == 0 {
                        error!(
                            "changes for {} not delivered after {failures} consecutive attempts",
                            self.product
                        );
                    }
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("cancelled with undelivered changes for {}", self.product);
                    return None;
                }
                () = tokio::time::sleep(self.retry.delay) => {}
            }
        }
    }

    /// Prime, then push changes every interval until `cancel` fires
    ///
    /// # Errors
    /// Returns an error only if the priming scan fails; failures of later
    /// cycles are logged and the loop carries on.
    pub async fn push_loop(&mut self, cancel: CancellationToken) -> Result<(), ClientError> {
        let tracked = self.prime()?;
        info!(
            "tracking {tracked} files under {}, scanning every {}s",
            self.tracker.root().display(),
            self.interval.secs()
        );

        loop {
            match self.push_once(&cancel).await {
                Ok(CycleOutcome::Cancelled) => break,
                Ok(CycleOutcome::Idle) => debug!("no changes"),
                Ok(_) => {}
                Err(e) => warn!("push cycle failed: {e}"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval.as_duration()) => {}
            }
        }

        info!("push loop for {} stopped", self.product);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use confsync_core::FetchReply;
    use confsync_core::protocol::status;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::TempDir;

    /// Fails the first `failures` applies, or every one if `None`
    struct FakeTransport {
        failures: Mutex<Option<usize>>,
        attempts: AtomicUsize,
        applied: Mutex<Vec<ApplyRequest>>,
        /// Status of each successive reply; `OK` once exhausted
        apply_statuses: Mutex<Vec<i32>>,
        fetch_reply: FetchReply,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                failures: Mutex::new(Some(0)),
                attempts: AtomicUsize::new(0),
                applied: Mutex::new(Vec::new()),
                apply_statuses: Mutex::new(Vec::new()),
                fetch_reply: FetchReply::ok(Bytes::new()),
            }
        }

        fn failing(failures: Option<usize>) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Self::new()
            }
        }

        fn heal(&self) {
            *self.failures.lock().unwrap() = Some(0);
        }
    }

    #[async_trait]
    impl ConfigTransport for FakeTransport {
        async fn fetch(&self, _request: FetchRequest) -> Result<FetchReply, TransportError> {
            Ok(self.fetch_reply.clone())
        }

        async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            {
                let mut failures = self.failures.lock().unwrap();
                match failures.as_mut() {
                    None => return Err(TransportError::Remote("down".to_string())),
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        return Err(TransportError::Remote("down".to_string()));
                    }
                    Some(_) => {}
                }
            }
            self.applied.lock().unwrap().push(request);
            let mut statuses = self.apply_statuses.lock().unwrap();
            let status = if statuses.is_empty() {
                status::OK
            } else {
                statuses.remove(0)
            };
            Ok(ApplyReply {
                status,
                message: "ok".to_string(),
            })
        }
    }

    fn write_at(root: &Path, rel: &str, content: &str, mtime: i64) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn client(dir: &TempDir, transport: Arc<FakeTransport>) -> SyncClient<Arc<FakeTransport>> {
        let config = ClientConfig {
            root: dir.path().to_path_buf(),
            ..ClientConfig::default()
        };
        SyncClient::new(transport, &config)
            .unwrap()
            .with_retry(RetryPolicy {
                delay: Duration::from_millis(10),
                alert_after: 2,
            })
    }

    fn set(paths: &[&str]) -> std::collections::BTreeSet<String> {
        paths.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_quiet_tree_is_idle() {
        let dir = TempDir::new().unwrap();
        write_at(dir.path(), "a.txt", "a", 100);
        let transport = Arc::new(FakeTransport::new());
        let mut client = client(&dir, Arc::clone(&transport));

        assert_eq!(client.prime().unwrap(), 1);
        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_sends_changes_and_deletions() {
        let dir = TempDir::new().unwrap();
        write_at(dir.path(), "a.txt", "a", 100);
        write_at(dir.path(), "b.txt", "b", 200);
        let transport = Arc::new(FakeTransport::new());
        let mut client = client(&dir, Arc::clone(&transport));
        client.prime().unwrap();

        write_at(dir.path(), "a.txt", "a2", 300);
        write_at(dir.path(), "c.txt", "c", 150);
        std::fs::remove_file(dir.path().join("b.txt")).unwrap();

        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        let CycleOutcome::Sent { result, .. } = outcome else {
            panic!("expected Sent, got {outcome:?}");
        };
        assert_eq!(result.new_files, set(&["c.txt"]));
        assert_eq!(result.modified_files, set(&["a.txt"]));
        assert_eq!(result.deleted_files, set(&["b.txt"]));

        let applied = transport.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].product, "am");
        assert_eq!(applied[0].commit_ref, "master");
        assert_eq!(applied[0].deleted, vec!["b.txt".to_string()]);
        let archive = archive::Archive::from_bytes(&applied[0].archive).unwrap();
        let paths: Vec<_> = archive.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_deletions_only_send_empty_archive() {
        let dir = TempDir::new().unwrap();
        write_at(dir.path(), "gone.txt", "x", 100);
        let transport = Arc::new(FakeTransport::new());
        let mut client = client(&dir, Arc::clone(&transport));
        client.prime().unwrap();

        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();
        client.push_once(&CancellationToken::new()).await.unwrap();

        let applied = transport.applied.lock().unwrap();
        assert!(applied[0].archive.is_empty());
        assert_eq!(applied[0].deleted, vec!["gone.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_retries_until_delivered() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::failing(Some(3)));
        let mut client = client(&dir, Arc::clone(&transport));
        client.prime().unwrap();

        write_at(dir.path(), "new.txt", "n", 100);
        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Sent { .. }), "{outcome:?}");
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(transport.applied.lock().unwrap().len(), 1);
        assert!(client.tracker().state().contains("new.txt"));
    }

    #[tokio::test]
    async fn test_cancel_during_retries_keeps_changes_pending() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::failing(None));
        let mut client = client(&dir, Arc::clone(&transport));
        client.prime().unwrap();
        write_at(dir.path(), "new.txt", "n", 100);

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                cancel.cancel();
            }
        });

        let outcome = client.push_once(&cancel).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert!(transport.attempts.load(Ordering::SeqCst) >= 2);
        assert!(!client.tracker().state().contains("new.txt"));

        // Detected again once the server is reachable
        transport.heal();
        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        let CycleOutcome::Sent { result, .. } = outcome else {
            panic!("expected Sent, got {outcome:?}");
        };
        assert_eq!(result.new_files, set(&["new.txt"]));
    }

    fn replying(statuses: &[i32]) -> FakeTransport {
        FakeTransport {
            apply_statuses: Mutex::new(statuses.to_vec()),
            ..FakeTransport::new()
        }
    }

    #[tokio::test]
    async fn test_rejected_changeset_is_not_retried_within_cycle() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(replying(&[status::UNKNOWN_PRODUCT]));
        let mut client = client(&dir, Arc::clone(&transport));
        client.prime().unwrap();
        write_at(dir.path(), "x.txt", "x", 100);

        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        assert!(
            matches!(outcome, CycleOutcome::Rejected { status: status::UNKNOWN_PRODUCT, .. }),
            "{outcome:?}"
        );
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert!(!client.tracker().state().contains("x.txt"));
    }

    #[tokio::test]
    async fn test_server_failure_keeps_changes_pending() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(replying(&[status::IO_ERROR]));
        let mut client = client(&dir, Arc::clone(&transport));
        client.prime().unwrap();
        write_at(dir.path(), "realm.json", "{}", 100);

        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        assert!(
            matches!(outcome, CycleOutcome::Rejected { status: status::IO_ERROR, .. }),
            "{outcome:?}"
        );

        // Sent again on the next cycle
        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        let CycleOutcome::Sent { result, .. } = outcome else {
            panic!("expected Sent, got {outcome:?}");
        };
        assert_eq!(result.new_files, set(&["realm.json"]));
        assert_eq!(transport.applied.lock().unwrap().len(), 2);
        assert!(client.tracker().state().contains("realm.json"));
    }

    #[tokio::test]
    async fn test_record_failure_is_not_resent() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(replying(&[status::RECORD_FAILED]));
        let mut client = client(&dir, Arc::clone(&transport));
        client.prime().unwrap();
        write_at(dir.path(), "x.txt", "x", 100);

        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        assert!(
            matches!(outcome, CycleOutcome::Rejected { status: status::RECORD_FAILED, .. }),
            "{outcome:?}"
        );
        let outcome = client.push_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
        assert_eq!(transport.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_cycle() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let mut client = client(&dir, Arc::clone(&transport));
        let cancel = CancellationToken::new();
        cancel.cancel();

        write_at(dir.path(), "x.txt", "x", 100);
        assert_eq!(client.push_once(&cancel).await.unwrap(), CycleOutcome::Cancelled);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_loop_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        let mut client = client(&dir, Arc::clone(&transport));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.push_loop(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("push loop should stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_loop_fails_on_missing_root() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            root: dir.path().join("missing"),
            ..ClientConfig::default()
        };
        let mut client = SyncClient::new(Arc::new(FakeTransport::new()), &config).unwrap();

        let err = client.push_loop(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Core(_)), "{err}");
    }

    #[tokio::test]
    async fn test_pull_unpacks_archive() {
        let src = TempDir::new().unwrap();
        write_at(src.path(), "conf/app.json", "{}", 100);
        let archive = archive::pack(src.path(), ["conf/app.json"], Compression::Off).unwrap();

        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport {
            fetch_reply: FetchReply::ok(archive),
            ..FakeTransport::new()
        });
        let client = client(&dir, transport);

        let summary = client.pull_once().await.unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("conf/app.json")).unwrap(),
            "{}"
        );
    }

    #[tokio::test]
    async fn test_pull_fails_fast_on_status() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport {
            fetch_reply: FetchReply::failed(status::UNKNOWN_PRODUCT, "unknown product: am"),
            ..FakeTransport::new()
        });
        let client = client(&dir, transport);

        let err = client.pull_once().await.unwrap_err();
        assert!(
            matches!(err, ClientError::FetchRejected { status: status::UNKNOWN_PRODUCT, .. }),
            "{err}"
        );
    }
}
