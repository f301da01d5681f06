//! Fetch and Apply handlers for product subtrees
//!
//! Each configured product maps to a subtree below the server root and owns
//! a reader-writer lock: any number of Fetches may read a subtree at once,
//! an Apply has it to itself until its change is recorded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use confsync_core::archive::{self, Compression, UnpackSummary};
use confsync_core::config::ServerConfig;
use confsync_core::path::{contained_join, join_relative, normalize, validate_relative};
use confsync_core::protocol::status;
use confsync_core::tracker;
use confsync_core::{ApplyReply, ApplyRequest, Error, FetchReply, FetchRequest};
use confsync_transport::ConfigService;

use crate::recorder::{ChangeRecorder, RecordError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] Error),

    /// The files were written but the change was not recorded
    #[error("change applied but not recorded: {0}")]
    Record(#[from] RecordError),
}

impl ServerError {
    /// Wire status code for this failure
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Core(e) => e.status_code(),
            Self::Record(_) => status::RECORD_FAILED,
        }
    }
}

/// A product's subtree and its lock
#[derive(Debug)]
struct Product {
    /// Portable path relative to the server root
    subtree: String,
    dir: PathBuf,
    lock: RwLock<()>,
}

/// What an Apply did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub written: UnpackSummary,
    /// Deleted paths that existed
    pub removed: usize,
    /// Message handed to the recorder
    pub message: String,
}

/// Serves product subtrees below one root directory
pub struct ConfigServer {
    root: PathBuf,
    products: BTreeMap<String, Product>,
    compression: Compression,
    recorder: Arc<dyn ChangeRecorder>,
}

impl ConfigServer {
    /// Create a server for `products`, each mapped to a subtree of `root`
    ///
    /// # Errors
    /// Returns [`Error::InvalidPath`] if a subtree escapes the root.
    pub fn new(
        root: impl Into<PathBuf>,
        products: &BTreeMap<String, PathBuf>,
        recorder: Arc<dyn ChangeRecorder>,
    ) -> Result<Self, Error> {
        let root = root.into();
        let products = products
            .iter()
            .map(|(id, subtree)| {
                let subtree = normalize(subtree)?;
                let dir = join_relative(&root, &subtree)?;
                Ok((
                    id.clone(),
                    Product {
                        subtree,
                        dir,
                        lock: RwLock::new(()),
                    },
                ))
            })
            .collect::<Result<_, Error>>()?;

        Ok(Self {
            root,
            products,
            compression: Compression::Off,
            recorder,
        })
    }

    /// Create a server from loaded configuration
    ///
    /// # Errors
    /// See [`ConfigServer::new`].
    pub fn from_config(
        config: &ServerConfig,
        recorder: Arc<dyn ChangeRecorder>,
    ) -> Result<Self, Error> {
        let server = Self::new(&config.root, &config.products, recorder)?;
        Ok(server.with_compression(config.compression))
    }

    /// Compression used for Fetch archives
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configured product ids
    pub fn products(&self) -> impl Iterator<Item = &str> {
        self.products.keys().map(String::as_str)
    }

    /// Directory holding a product's subtree
    ///
    /// # Errors
    /// Returns [`Error::UnknownProduct`] if the product is not configured.
    pub fn product_dir(&self, id: &str) -> Result<&Path, Error> {
        self.product(id).map(|p| p.dir.as_path())
    }

    fn product(&self, id: &str) -> Result<&Product, Error> {
        self.products
            .get(id)
            .ok_or_else(|| Error::UnknownProduct(id.to_string()))
    }

    /// Archive the entire subtree of a product
    ///
    /// # Errors
    /// Returns [`Error::UnknownProduct`] for unconfigured products and
    /// [`Error::Io`] if the subtree cannot be read.
    pub async fn fetch_archive(&self, id: &str) -> Result<Bytes, ServerError> {
        let product = self.product(id)?;
        let _guard = product.lock.read().await;

        let dir = product.dir.clone();
        let compression = self.compression;
        let archive = run_blocking(&product.dir, move || {
            let state = tracker::snapshot(&dir, None)?;
            archive::pack(&dir, state.paths(), compression)
        })
        .await?;
        Ok(archive)
    }

    /// Unpack an archive into a product subtree, remove deleted paths, then
    /// record the change.
    ///
    /// Deleted paths that do not exist are skipped. A recording failure is
    /// reported after the files have been written; nothing is rolled back.
    ///
    /// # Errors
    /// Returns [`ServerError::Core`] if nothing could be applied and
    /// [`ServerError::Record`] if the change was applied but not recorded.
    pub async fn apply_changes(
        &self,
        request: &ApplyRequest,
    ) -> Result<ApplySummary, ServerError> {
        let product = self.product(&request.product)?;
        for path in &request.deleted {
            validate_relative(path)?;
        }

        let _guard = product.lock.write().await;

        let dir = product.dir.clone();
        let payload = request.archive.clone();
        let deleted = request.deleted.clone();
        let (written, removed) = run_blocking(&product.dir, move || {
            let targets = deleted
                .iter()
                .map(|rel| contained_join(&dir, rel))
                .collect::<Result<Vec<_>, Error>>()?;
            let written = archive::unpack(&payload, &dir)?;
            let mut removed = 0;
            for target in &targets {
                if remove_path(target)? {
                    removed += 1;
                }
            }
            Ok((written, removed))
        })
        .await?;

        let message = format!(
            "update {}: {} written, {removed} deleted",
            request.product, written.files
        );
        self.recorder.record_change(&product.subtree, &message).await?;

        Ok(ApplySummary {
            written,
            removed,
            message,
        })
    }
}

/// Remove a file, or a directory and everything below it
///
/// Returns whether anything was there to remove.
fn remove_path(path: &Path) -> Result<bool, Error> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("already gone: {}", path.display());
            return Ok(false);
        }
        Err(e) => return Err(Error::io("failed to stat", path, e)),
    };

    let removed = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io("failed to remove", path, e)),
    }
}

/// Run filesystem work off the async threads
async fn run_blocking<T, F>(dir: &Path, work: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::io("worker failed for", dir, std::io::Error::other(e)))?
}

#[async_trait]
impl ConfigService for ConfigServer {
    async fn fetch(&self, request: FetchRequest) -> FetchReply {
        match self.fetch_archive(&request.product).await {
            Ok(archive) => {
                info!(
                    "fetch {} at {}: {} byte archive",
                    request.product,
                    request.commit_ref,
                    archive.len()
                );
                FetchReply::ok(archive)
            }
            Err(e) => {
                warn!("fetch {} failed: {e}", request.product);
                FetchReply::failed(e.status_code(), e.to_string())
            }
        }
    }

    async fn apply(&self, request: ApplyRequest) -> ApplyReply {
        match self.apply_changes(&request).await {
            Ok(summary) => {
                info!(
                    "apply {} at {}: {} files ({} bytes) written, {} of {} deleted paths removed",
                    request.product,
                    request.commit_ref,
                    summary.written.files,
                    summary.written.bytes,
                    summary.removed,
                    request.deleted.len()
                );
                ApplyReply::ok(summary.message)
            }
            Err(e) => {
                warn!("apply {} failed: {e}", request.product);
                ApplyReply::failed(e.status_code(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::Notify;

    use crate::recorder::NoopRecorder;

    /// Remembers every recorded change
    #[derive(Default)]
    struct MemoryRecorder {
        changes: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ChangeRecorder for MemoryRecorder {
        async fn record_change(&self, subtree: &str, message: &str) -> Result<(), RecordError> {
            if self.fail {
                return Err(RecordError::Git {
                    args: "commit".to_string(),
                    status: 128,
                    stderr: "index.lock exists".to_string(),
                });
            }
            self.changes
                .lock()
                .unwrap()
                .push((subtree.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn products() -> BTreeMap<String, PathBuf> {
        BTreeMap::from([
            ("am".to_string(), PathBuf::from("docker/am")),
            ("idm".to_string(), PathBuf::from("docker/idm")),
        ])
    }

    fn server_with(dir: &TempDir, recorder: Arc<dyn ChangeRecorder>) -> ConfigServer {
        ConfigServer::new(dir.path(), &products(), recorder).unwrap()
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn archive_of(files: &[(&str, &str)]) -> Bytes {
        let mut archive = archive::Archive::new();
        for (path, content) in files {
            archive.push(archive::ArchiveEntry {
                path: (*path).to_string(),
                mode: 0o644,
                modified: 1_700_000_000,
                data: Bytes::copy_from_slice(content.as_bytes()),
            });
        }
        archive.to_bytes(Compression::Off).unwrap()
    }

    fn apply_request(product: &str, archive: Bytes, deleted: &[&str]) -> ApplyRequest {
        ApplyRequest {
            product: product.to_string(),
            commit_ref: "master".to_string(),
            deleted: deleted.iter().map(ToString::to_string).collect(),
            archive,
        }
    }

    fn fetch_request(product: &str) -> FetchRequest {
        FetchRequest {
            product: product.to_string(),
            commit_ref: "master".to_string(),
        }
    }

    #[test]
    fn test_new_rejects_escaping_subtree() {
        let dir = TempDir::new().unwrap();
        let products = BTreeMap::from([("evil".to_string(), PathBuf::from("../elsewhere"))]);
        assert!(ConfigServer::new(dir.path(), &products, Arc::new(NoopRecorder)).is_err());
    }

    #[tokio::test]
    async fn test_fetch_unknown_product() {
        let dir = TempDir::new().unwrap();
        let server = server_with(&dir, Arc::new(NoopRecorder));

        let reply = server.fetch(fetch_request("ds")).await;
        assert_eq!(reply.status, status::UNKNOWN_PRODUCT);
        assert!(reply.archive.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_archives_whole_subtree() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docker/am/boot.json", "{\"boot\":true}");
        write(dir.path(), "docker/am/services/realm.json", "[]");
        write(dir.path(), "docker/idm/other.json", "not fetched");
        let server = server_with(&dir, Arc::new(NoopRecorder));

        let reply = server.fetch(fetch_request("am")).await;
        assert!(reply.is_ok(), "{}", reply.message);

        let out = TempDir::new().unwrap();
        let summary = archive::unpack(&reply.archive, out.path()).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(
            std::fs::read_to_string(out.path().join("services/realm.json")).unwrap(),
            "[]"
        );
        assert!(!out.path().join("other.json").exists());
    }

    #[tokio::test]
    async fn test_fetch_compressed() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docker/am/a.txt", "a");
        let server = server_with(&dir, Arc::new(NoopRecorder)).with_compression(Compression::On);

        let reply = server.fetch(fetch_request("am")).await;
        assert!(reply.archive.starts_with(&archive::ZSTD_MAGIC));
    }

    #[tokio::test]
    async fn test_fetch_missing_subtree_is_io_error() {
        let dir = TempDir::new().unwrap();
        let server = server_with(&dir, Arc::new(NoopRecorder));

        let reply = server.fetch(fetch_request("idm")).await;
        assert_eq!(reply.status, status::IO_ERROR);
    }

    #[tokio::test]
    async fn test_apply_writes_and_records() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(MemoryRecorder::default());
        let server = server_with(&dir, recorder.clone());

        let reply = server
            .apply(apply_request(
                "am",
                archive_of(&[("a.txt", "alpha"), ("nested/b.txt", "beta")]),
                &[],
            ))
            .await;
        assert!(reply.is_ok(), "{}", reply.message);
        assert_eq!(reply.message, "update am: 2 written, 0 deleted");

        let am = dir.path().join("docker/am");
        assert_eq!(std::fs::read_to_string(am.join("a.txt")).unwrap(), "alpha");
        assert_eq!(std::fs::read_to_string(am.join("nested/b.txt")).unwrap(), "beta");

        let changes = recorder.changes.lock().unwrap();
        assert_eq!(
            *changes,
            vec![("docker/am".to_string(), "update am: 2 written, 0 deleted".to_string())]
        );
    }

    #[tokio::test]
    async fn test_apply_only_deletions() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docker/am/c.txt", "c");
        write(dir.path(), "docker/am/keep.txt", "k");
        let recorder = Arc::new(MemoryRecorder::default());
        let server = server_with(&dir, recorder.clone());

        let reply = server.apply(apply_request("am", Bytes::new(), &["c.txt"])).await;
        assert!(reply.is_ok(), "{}", reply.message);
        assert!(!dir.path().join("docker/am/c.txt").exists());
        assert!(dir.path().join("docker/am/keep.txt").exists());
        assert_eq!(recorder.changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_deletion_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docker/am/c.txt", "c");
        let server = server_with(&dir, Arc::new(NoopRecorder));
        let request = apply_request("am", Bytes::new(), &["c.txt", "never-existed.txt"]);

        let first = server.apply_changes(&request).await.unwrap();
        assert_eq!(first.removed, 1);
        assert_eq!(first.message, "update am: 0 written, 1 deleted");
        let second = server.apply_changes(&request).await.unwrap();
        assert_eq!(second.removed, 0);
        assert_eq!(second.message, "update am: 0 written, 0 deleted");
        assert!(!dir.path().join("docker/am/c.txt").exists());
    }

    #[tokio::test]
    async fn test_apply_deletes_directory() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docker/am/old/a.txt", "a");
        write(dir.path(), "docker/am/old/deeper/b.txt", "b");
        let server = server_with(&dir, Arc::new(NoopRecorder));

        let reply = server.apply(apply_request("am", Bytes::new(), &["old"])).await;
        assert!(reply.is_ok(), "{}", reply.message);
        assert!(!dir.path().join("docker/am/old").exists());
    }

    #[tokio::test]
    async fn test_apply_rejects_escaping_deletion() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docker/secret.txt", "s");
        let recorder = Arc::new(MemoryRecorder::default());
        let server = server_with(&dir, recorder.clone());

        let reply = server
            .apply(apply_request("am", archive_of(&[("a.txt", "a")]), &["../secret.txt"]))
            .await;
        assert_eq!(reply.status, status::INVALID_PATH);
        assert!(dir.path().join("docker/secret.txt").exists());
        assert!(!dir.path().join("docker/am/a.txt").exists());
        assert!(recorder.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(MemoryRecorder::default());
        let server = server_with(&dir, recorder.clone());

        let reply = server
            .apply(apply_request("am", Bytes::from_static(b"garbage"), &[]))
            .await;
        assert_eq!(reply.status, status::CORRUPT_ARCHIVE);
        assert!(recorder.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_unknown_product() {
        let dir = TempDir::new().unwrap();
        let server = server_with(&dir, Arc::new(NoopRecorder));

        let reply = server.apply(apply_request("ds", Bytes::new(), &["x"])).await;
        assert_eq!(reply.status, status::UNKNOWN_PRODUCT);
    }

    #[tokio::test]
    async fn test_record_failure_keeps_files() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(MemoryRecorder {
            fail: true,
            ..MemoryRecorder::default()
        });
        let server = server_with(&dir, recorder);

        let reply = server
            .apply(apply_request("am", archive_of(&[("a.txt", "a")]), &[]))
            .await;
        assert_eq!(reply.status, status::RECORD_FAILED);
        assert!(reply.message.contains("index.lock"));
        assert!(dir.path().join("docker/am/a.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_refuses_symlinked_directory() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        write(outside.path(), "victim.txt", "v");
        write(dir.path(), "docker/am/a.txt", "a");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("docker/am/link")).unwrap();
        let recorder = Arc::new(MemoryRecorder::default());
        let server = server_with(&dir, recorder.clone());

        let reply = server
            .apply(apply_request("am", Bytes::new(), &["link/victim.txt"]))
            .await;
        assert_eq!(reply.status, status::INVALID_PATH);
        assert!(outside.path().join("victim.txt").exists());

        let reply = server
            .apply(apply_request("am", archive_of(&[("link/dropped.txt", "d")]), &[]))
            .await;
        assert_eq!(reply.status, status::INVALID_PATH);
        assert!(!outside.path().join("dropped.txt").exists());
        assert!(recorder.changes.lock().unwrap().is_empty());
    }

    /// Holds every Apply inside the recorder until released
    #[derive(Default)]
    struct GateRecorder {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ChangeRecorder for GateRecorder {
        async fn record_change(&self, _subtree: &str, _message: &str) -> Result<(), RecordError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_apply_excludes_fetch_on_same_product() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docker/am/a.txt", "a");
        write(dir.path(), "docker/idm/i.txt", "i");
        let gate = Arc::new(GateRecorder::default());
        let server = Arc::new(server_with(&dir, gate.clone()));

        let apply = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                server
                    .apply(apply_request("am", archive_of(&[("b.txt", "b")]), &[]))
                    .await
            }
        });
        gate.entered.notified().await;

        // Same product waits for the Apply, other products do not
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), server.fetch(fetch_request("am")))
                .await;
        assert!(blocked.is_err());
        let other =
            tokio::time::timeout(Duration::from_secs(5), server.fetch(fetch_request("idm")))
                .await
                .unwrap();
        assert!(other.is_ok());

        gate.release.notify_one();
        assert!(apply.await.unwrap().is_ok());

        let reply = server.fetch(fetch_request("am")).await;
        let out = TempDir::new().unwrap();
        assert_eq!(archive::unpack(&reply.archive, out.path()).unwrap().files, 2);
    }

    #[tokio::test]
    async fn test_applies_on_same_product_are_serialized() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(GateRecorder::default());
        let server = Arc::new(server_with(&dir, gate.clone()));

        let first = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                server
                    .apply(apply_request("am", archive_of(&[("a.txt", "first")]), &[]))
                    .await
            }
        });
        gate.entered.notified().await;

        // The second Apply cannot start writing while the first holds the lock
        let second = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                server
                    .apply(apply_request("am", archive_of(&[("a.txt", "second")]), &[]))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("docker/am/a.txt")).unwrap(),
            "first"
        );

        gate.release.notify_one();
        assert!(first.await.unwrap().is_ok());

        gate.entered.notified().await;
        gate.release.notify_one();
        let second = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok(), "{}", second.message);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("docker/am/a.txt")).unwrap(),
            "second"
        );
    }
}
