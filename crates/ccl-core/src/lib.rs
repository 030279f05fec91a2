//! Core domain model for the commercial content enrichment pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ccl-core";

/// Points at one raw observation record in object storage.
///
/// Produced by the storage-change notification or by backfill enumeration,
/// and never mutated afterwards. The `etag` is the storage-side content
/// marker used for deterministic id derivation when the vendor supplied no
/// scrape UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecordLocator {
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
}

impl RawRecordLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn content_marker(&self) -> Option<&str> {
        self.etag.as_deref()
    }
}

/// Identifiers extracted from the raw-record key layout
/// `<observer_id>/rdo/<timestamp>.<observation_id>/output.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdoKeyParts {
    pub observer_id: String,
    pub timestamp_ms: i64,
    pub observation_id: String,
}

impl RdoKeyParts {
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() != 4 || parts[1] != "rdo" || parts[3] != "output.json" {
            return None;
        }
        let (timestamp, observation_id) = parts[2].split_once('.')?;
        let timestamp_ms = timestamp.parse().ok()?;
        if observation_id.is_empty() {
            return None;
        }
        Some(Self {
            observer_id: parts[0].to_string(),
            timestamp_ms,
            observation_id: observation_id.to_string(),
        })
    }
}

/// One fetched RDO document. Read-only input to the pipeline.
///
/// The document keeps the vendor's exact JSON; typed accessors below pull
/// out the handful of fields the pipeline itself depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawObservationRecord {
    pub document: Value,
}

impl RawObservationRecord {
    pub fn new(document: Value) -> Self {
        Self { document }
    }

    /// Explicit schema version marker, when the record carries one.
    pub fn version(&self) -> Option<i64> {
        self.document.get("version").and_then(Value::as_i64)
    }

    pub fn observation_id(&self) -> Option<&str> {
        self.document
            .get("observation")
            .and_then(|o| o.get("uuid"))
            .and_then(Value::as_str)
    }

    pub fn observer_id(&self) -> Option<&str> {
        self.document
            .get("observer")
            .and_then(|o| o.get("uuid"))
            .and_then(Value::as_str)
    }

    pub fn enrichment(&self) -> Option<&Value> {
        self.document.get("enrichment")
    }
}

/// Parser handoff contract: one enrichment scrape before identity
/// resolution. The upsert engine turns drafts into canonical records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentDraft {
    /// Vendor-supplied scrape UUID, the preferred dedupe key.
    pub scrape_uuid: Option<String>,
    pub version: i32,
    pub vendor: String,
    pub platform: Option<String>,
    pub ad_type: Option<String>,
    /// Epoch milliseconds, as the vendor reports them.
    pub scrape_started_at: Option<i64>,
    pub scrape_completed_at: Option<i64>,
    pub entities: Vec<EntityDraft>,
    pub snapshots: Vec<SnapshotDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    pub source_id: Option<String>,
    pub entity_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDraft {
    pub source_id: Option<String>,
    pub data: Value,
}

/// Canonical persisted enrichment record, one per scrape instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommercialContentEnrichment {
    pub id: String,
    pub observation_id: String,
    pub version: i32,
    pub vendor: String,
    pub platform: Option<String>,
    pub ad_type: Option<String>,
    pub scrape_started_at: Option<i64>,
    pub scrape_completed_at: Option<i64>,
}

/// Snapshot of an advertising actor (page, keyword, location) tied to one
/// enrichment. Append-only; the same `source_id` under different parents is
/// deliberately kept as distinct history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisingEntity {
    pub id: Uuid,
    pub enrichment_id: String,
    pub source_id: Option<String>,
    pub entity_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementSnapshot {
    pub id: Uuid,
    pub enrichment_id: String,
    pub source_id: Option<String>,
    pub data: Value,
}

/// One enrichment with its owned children, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentGraph {
    pub enrichment: CommercialContentEnrichment,
    pub entities: Vec<AdvertisingEntity>,
    pub snapshots: Vec<AdvertisementSnapshot>,
}

/// Per-scrape mapping from an opaque outlink id to the vendor URL that was
/// archived (or attempted) for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMappingEntry {
    pub vendor: String,
    pub url: String,
    pub scrape_id: String,
    pub outlink_id: String,
    pub content_type: String,
    pub attempted: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMappingDoc {
    #[serde(default)]
    pub outlinks: Vec<MediaMappingEntry>,
}

/// Flattened, search-indexable projection of one observation plus all of its
/// stored enrichments. Disposable: rebuildable from the relational store at
/// any time, identity is the observation id alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryableDataObject {
    pub observation_id: String,
    pub observer_id: Option<String>,
    pub platform: Option<String>,
    pub observed_at: Option<i64>,
    pub properties: BTreeMap<String, Value>,
}
