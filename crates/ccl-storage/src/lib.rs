//! Object-store access for raw observation records + retry/backoff policy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ccl_core::{MediaMappingDoc, RawObservationRecord, RawRecordLocator, RdoKeyParts};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::debug;

pub const CRATE_NAME: &str = "ccl-storage";

pub const RAW_RECORD_FILE: &str = "output.json";
pub const MEDIA_MAPPING_FILE: &str = "media_mapping.json";

/// Hex sha256 of raw bytes; the fallback content marker when the store
/// exposes no ETag for a record.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("io error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed for {key}: {source}")]
    Request {
        key: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {key}")]
    HttpStatus { status: u16, key: String },
    #[error("listing is not supported by this object store")]
    ListUnsupported,
}

impl ObjectStoreError {
    /// Transient errors are worth retrying with backoff; everything else is
    /// surfaced to the caller as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            ObjectStoreError::Io { .. } => true,
            ObjectStoreError::Request { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            ObjectStoreError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            ObjectStoreError::ListUnsupported => false,
        }
    }
}

/// Minimal surface the pipeline needs from object storage: point reads and
/// (for backfill) full key enumeration.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` means the key does not exist; errors are infrastructure.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

/// Filesystem-backed store: keys map to paths under a root directory.
/// Used by local pipelines, backfills and tests.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    /// Write an object, creating parent directories. Exists so tests and the
    /// local capture path can seed a store; the pipeline itself only reads.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|source| ObjectStoreError::Io {
                key: key.to_string(),
                source,
            })?;
        }
        fs::write(&path, bytes).await.map_err(|source| ObjectStoreError::Io {
            key: key.to_string(),
            source,
        })
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ObjectStoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(ObjectStoreError::Io {
                        key: dir.display().to_string(),
                        source,
                    })
                }
            };
            while let Some(entry) = entries.next_entry().await.map_err(|source| {
                ObjectStoreError::Io {
                    key: dir.display().to_string(),
                    source,
                }
            })? {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff, shared by HTTP fetching and the ingestion worker's
/// requeue delays.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// HTTP-backed store for gateways that expose the raw-record bucket over
/// plain GET (presigned or S3-compatible endpoints). Retries transient
/// statuses per `BackoffPolicy`; listing is not available over this surface.
#[derive(Debug)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpObjectStore {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        concurrency: usize,
        backoff: BackoffPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            backoff,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let url = self.url_for(key);

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|source| {
                            ObjectStoreError::Request {
                                key: key.to_string(),
                                source,
                            }
                        })?;
                        return Ok(Some(body.to_vec()));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ObjectStoreError::HttpStatus {
                        status: status.as_u16(),
                        key: key.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ObjectStoreError::Request {
                        key: key.to_string(),
                        source: err,
                    });
                }
            }
        }

        Err(ObjectStoreError::Request {
            key: key.to_string(),
            source: last_request_error.expect("retry loop captures a request error"),
        })
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Err(ObjectStoreError::ListUnsupported)
    }
}

#[derive(Debug, Error)]
pub enum FetchRawError {
    #[error("raw record not found at {key}")]
    NotFound { key: String },
    #[error("raw record at {key} is not valid JSON: {source}")]
    InvalidJson {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

impl FetchRawError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchRawError::Store(err) => err.is_transient(),
            // A missing record may be a notification racing the write.
            FetchRawError::NotFound { .. } => true,
            FetchRawError::InvalidJson { .. } => false,
        }
    }
}

/// Raw Record Fetcher: resolves locators to RDO documents and their sibling
/// media-mapping documents, and enumerates historical records for backfill.
#[derive(Clone)]
pub struct RawRecordStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl RawRecordStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The media-mapping document lives next to the RDO in the same record
    /// directory.
    pub fn media_mapping_key(locator: &RawRecordLocator) -> Option<String> {
        let dir = locator.key.strip_suffix(RAW_RECORD_FILE)?;
        Some(format!("{dir}{MEDIA_MAPPING_FILE}"))
    }

    pub async fn fetch_rdo(
        &self,
        locator: &RawRecordLocator,
    ) -> Result<(RawObservationRecord, String), FetchRawError> {
        let bytes = self
            .store
            .get(&locator.key)
            .await?
            .ok_or_else(|| FetchRawError::NotFound {
                key: locator.key.clone(),
            })?;
        let fingerprint = content_fingerprint(&bytes);
        let document = serde_json::from_slice(&bytes).map_err(|source| {
            FetchRawError::InvalidJson {
                key: locator.key.clone(),
                source,
            }
        })?;
        debug!(key = %locator.key, bytes = bytes.len(), "fetched raw record");
        Ok((RawObservationRecord::new(document), fingerprint))
    }

    /// Absence of the mapping document is expected for records without media
    /// and is never an ingestion failure; a present-but-unparsable document
    /// is treated the same as absent so it can be reconciled later.
    pub async fn fetch_media_mapping(
        &self,
        locator: &RawRecordLocator,
    ) -> Result<Option<MediaMappingDoc>, FetchRawError> {
        let Some(key) = Self::media_mapping_key(locator) else {
            return Ok(None);
        };
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "unparsable media mapping, leaving payloads unresolved");
                Ok(None)
            }
        }
    }

    /// Enumerate every historical raw-record locator, optionally scoped to
    /// one observer prefix. Keys that do not match the RDO layout are
    /// silently skipped; they belong to other record types in the bucket.
    pub async fn enumerate_raw_records(
        &self,
        observer_prefix: Option<&str>,
    ) -> Result<Vec<RawRecordLocator>, ObjectStoreError> {
        let prefix = observer_prefix.unwrap_or("");
        let keys = self.store.list(prefix).await?;
        Ok(keys
            .into_iter()
            .filter(|key| RdoKeyParts::parse(key).is_some())
            .map(|key| RawRecordLocator::new(self.bucket.clone(), key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(
            content_fingerprint(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(350));
    }

    #[test]
    fn media_mapping_key_is_a_sibling_of_the_rdo() {
        let locator = RawRecordLocator::new("bucket", "obr-1/rdo/100.ad-1/output.json");
        assert_eq!(
            RawRecordStore::media_mapping_key(&locator).as_deref(),
            Some("obr-1/rdo/100.ad-1/media_mapping.json")
        );

        let other = RawRecordLocator::new("bucket", "obr-1/rdo/100.ad-1/other.json");
        assert_eq!(RawRecordStore::media_mapping_key(&other), None);
    }

    #[tokio::test]
    async fn fs_store_roundtrips_and_reports_missing_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store
            .put("obr-1/rdo/100.ad-1/output.json", b"{\"version\":2}")
            .await
            .expect("put");

        let got = store
            .get("obr-1/rdo/100.ad-1/output.json")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(got, b"{\"version\":2}");
        assert!(store.get("obr-1/rdo/999.ad-9/output.json").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn enumeration_only_yields_rdo_keys() {
        let dir = tempdir().expect("tempdir");
        let fs = FsObjectStore::new(dir.path());
        fs.put("obr-1/rdo/100.ad-1/output.json", b"{}").await.expect("put");
        fs.put("obr-1/rdo/100.ad-1/media_mapping.json", b"{}").await.expect("put");
        fs.put("obr-1/temp/100.ad-1/frame.png", b"x").await.expect("put");
        fs.put("obr-2/rdo/200.ad-2/output.json", b"{}").await.expect("put");

        let store = RawRecordStore::new(Arc::new(fs), "observations");
        let all = store.enumerate_raw_records(None).await.expect("enumerate");
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|l| l.key.ends_with("/output.json")));

        let scoped = store
            .enumerate_raw_records(Some("obr-2/"))
            .await
            .expect("enumerate scoped");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].key, "obr-2/rdo/200.ad-2/output.json");
    }

    #[tokio::test]
    async fn fetch_rdo_reports_invalid_json_as_permanent() {
        let dir = tempdir().expect("tempdir");
        let fs = FsObjectStore::new(dir.path());
        fs.put("obr-1/rdo/100.ad-1/output.json", b"not json").await.expect("put");

        let store = RawRecordStore::new(Arc::new(fs), "observations");
        let locator = RawRecordLocator::new("observations", "obr-1/rdo/100.ad-1/output.json");
        let err = store.fetch_rdo(&locator).await.expect_err("invalid json");
        assert!(matches!(err, FetchRawError::InvalidJson { .. }));
        assert!(!err.is_transient());
    }
}
