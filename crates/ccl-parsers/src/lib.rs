//! Version/vendor detection + the pluggable enrichment parser registry.

use std::collections::{BTreeSet, HashMap};

use ccl_core::{EnrichmentDraft, EntityDraft, RawObservationRecord, SnapshotDraft};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "ccl-parsers";

pub const SCHEME_CCL_V2: &str = "ccl_v2";
pub const SCHEME_CCL: &str = "ccl";
pub const SCHEME_LEGACY_SCRAPE: &str = "meta_adlibrary_scrape";

/// Registry key: which extraction strategy handles a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParserKey {
    pub vendor: String,
    pub version: i32,
}

impl ParserKey {
    pub fn new(vendor: impl Into<String>, version: i32) -> Self {
        Self {
            vendor: vendor.into(),
            version,
        }
    }
}

impl std::fmt::Display for ParserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/v{}", self.vendor, self.version)
    }
}

/// Outcome of inspecting a raw record. Pure function of its input; an
/// unknown shape is a distinct signal, never a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Enrichment(ParserKey),
    NoEnrichment,
    Unsupported { observed: String },
}

pub fn detect(rdo: &RawObservationRecord) -> Detection {
    let Some(enrichment) = rdo.enrichment().and_then(Value::as_object) else {
        return Detection::NoEnrichment;
    };
    if enrichment.is_empty() {
        return Detection::NoEnrichment;
    }

    let explicit_version = match rdo.version() {
        Some(marker) => match i32::try_from(marker) {
            Ok(version) => Some(version),
            // Markers beyond i32 are unknown schemas, never truncated.
            Err(_) => {
                return Detection::Unsupported {
                    observed: format!("version marker {marker} out of range"),
                }
            }
        },
        None => None,
    };
    let (scheme, default_version) = if enrichment.contains_key(SCHEME_CCL_V2) {
        (SCHEME_CCL_V2, 2)
    } else if enrichment.contains_key(SCHEME_CCL) {
        (SCHEME_CCL, 2)
    } else if enrichment.contains_key(SCHEME_LEGACY_SCRAPE) {
        (SCHEME_LEGACY_SCRAPE, 1)
    } else {
        let mut observed: Vec<&str> = enrichment.keys().map(String::as_str).collect();
        observed.sort_unstable();
        return Detection::Unsupported {
            observed: observed.join(","),
        };
    };

    Detection::Enrichment(ParserKey::new(
        scheme,
        explicit_version.unwrap_or(default_version),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoEnrichment,
    UnsupportedSchema,
    MalformedBlock,
}

/// One skipped extraction outcome; recorded and counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub reason: SkipReason,
    pub detail: String,
}

impl SkipRecord {
    pub fn new(reason: SkipReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// A contract violation inside a registered parser. Routed to dead-letter
/// by the worker; block-level problems are skips, not errors.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("parser contract violation: {0}")]
    ContractViolation(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub drafts: Vec<EnrichmentDraft>,
    pub skips: Vec<SkipRecord>,
}

/// One extraction strategy per (vendor, schema-version) pair. Parsers must
/// not assume they are the only strategy invoked for a record, and must
/// isolate per-block failures as skips.
pub trait EnrichmentParser: Send + Sync {
    fn key(&self) -> ParserKey;

    fn parse(&self, rdo: &RawObservationRecord) -> Result<ParseOutput, ParserError>;
}

/// The extensibility seam: consumers dispatch through `get` and never
/// branch on vendor/version themselves.
pub struct ParserRegistry {
    parsers: HashMap<ParserKey, Box<dyn EnrichmentParser>>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry populated with the built-in scheme parsers. Legacy v1 is
    /// deliberately not registered; it is an optional extension slot.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(CclV2Parser));
        registry.register(Box::new(CclScrapeResponseParser));
        registry
    }

    pub fn register(&mut self, parser: Box<dyn EnrichmentParser>) {
        let key = parser.key();
        if self.parsers.insert(key.clone(), parser).is_some() {
            warn!(%key, "parser registration replaced an existing strategy");
        }
    }

    pub fn get(&self, key: &ParserKey) -> Option<&dyn EnrichmentParser> {
        self.parsers.get(key).map(|parser| parser.as_ref())
    }

    pub fn registered_keys(&self) -> Vec<ParserKey> {
        let mut keys: Vec<_> = self.parsers.keys().cloned().collect();
        keys.sort_by(|a, b| (&a.vendor, a.version).cmp(&(&b.vendor, b.version)));
        keys
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn i64_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

fn scrape_blocks<'a>(
    rdo: &'a RawObservationRecord,
    scheme: &str,
) -> Result<&'a [Value], ParserError> {
    let scrapes = rdo
        .enrichment()
        .and_then(|e| e.get(scheme))
        .ok_or_else(|| {
            ParserError::ContractViolation(format!("enrichment key {scheme} missing at parse time"))
        })?
        .get("scrapes");
    match scrapes {
        Some(Value::Array(blocks)) => Ok(blocks),
        // A scheme object without a scrapes list carries nothing to extract.
        None => Ok(&[]),
        Some(other) => Err(ParserError::ContractViolation(format!(
            "{scheme}.scrapes is {} rather than an array",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parser for the current `ccl_v2` enrichment scheme: scrapes carry their
/// entities and snapshots directly, already interpreted by the scraper.
pub struct CclV2Parser;

impl CclV2Parser {
    fn parse_block(block: &Value, index: usize) -> Result<EnrichmentDraft, SkipRecord> {
        let obj = block.as_object().ok_or_else(|| {
            SkipRecord::new(
                SkipReason::MalformedBlock,
                format!("ccl_v2 scrape [{index}] is not an object"),
            )
        })?;
        let vendor = str_field(obj, "vendor").ok_or_else(|| {
            SkipRecord::new(
                SkipReason::MalformedBlock,
                format!("ccl_v2 scrape [{index}] is missing vendor"),
            )
        })?;

        let entities = obj
            .get("entities")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|entity| EntityDraft {
                        source_id: str_field(entity, "source_id"),
                        entity_type: str_field(entity, "type").unwrap_or_else(|| "unknown".into()),
                        data: Value::Object(entity.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let snapshots = obj
            .get("snapshots")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|snapshot| SnapshotDraft {
                        source_id: str_field(snapshot, "source_id")
                            .or_else(|| str_field(snapshot, "ad_archive_id")),
                        data: Value::Object(snapshot.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(EnrichmentDraft {
            scrape_uuid: str_field(obj, "ccl_uuid"),
            version: 2,
            vendor,
            platform: str_field(obj, "platform"),
            ad_type: str_field(obj, "ad_type"),
            scrape_started_at: i64_field(obj, "scrape_started_at"),
            scrape_completed_at: i64_field(obj, "scrape_completed_at"),
            entities,
            snapshots,
        })
    }
}

impl EnrichmentParser for CclV2Parser {
    fn key(&self) -> ParserKey {
        ParserKey::new(SCHEME_CCL_V2, 2)
    }

    fn parse(&self, rdo: &RawObservationRecord) -> Result<ParseOutput, ParserError> {
        let mut output = ParseOutput::default();
        for (index, block) in scrape_blocks(rdo, SCHEME_CCL_V2)?.iter().enumerate() {
            match Self::parse_block(block, index) {
                Ok(draft) => output.drafts.push(draft),
                Err(skip) => output.skips.push(skip),
            }
        }
        Ok(output)
    }
}

/// Parser for the older `ccl` key, where scrapes wrap the vendor archive's
/// raw response: rows live at `response.response_interpreted.json_raw[]`
/// and each row mixes page fields with an ad snapshot.
pub struct CclScrapeResponseParser;

impl CclScrapeResponseParser {
    fn parse_block(block: &Value, index: usize) -> Result<EnrichmentDraft, SkipRecord> {
        let obj = block.as_object().ok_or_else(|| {
            SkipRecord::new(
                SkipReason::MalformedBlock,
                format!("ccl scrape [{index}] is not an object"),
            )
        })?;
        let vendor = str_field(obj, "vendor").ok_or_else(|| {
            SkipRecord::new(
                SkipReason::MalformedBlock,
                format!("ccl scrape [{index}] is missing vendor"),
            )
        })?;

        let rows = obj
            .get("response")
            .and_then(|r| r.get("response_interpreted"))
            .and_then(|r| r.get("json_raw"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut entities = Vec::new();
        let mut snapshots = Vec::new();
        let mut seen_pages: BTreeSet<String> = BTreeSet::new();

        for row in rows.iter().filter_map(Value::as_object) {
            let page_id = str_field(row, "page_id");
            // One entity snapshot per page per scrape; rows often repeat the
            // same page across collated ads.
            let is_new_page = match &page_id {
                Some(id) => seen_pages.insert(id.clone()),
                None => false,
            };
            if is_new_page {
                let mut page_data = row.clone();
                page_data.remove("snapshot");
                entities.push(EntityDraft {
                    source_id: page_id,
                    entity_type: "page".to_string(),
                    data: Value::Object(page_data),
                });
            }

            let ad_archive_id = str_field(row, "ad_archive_id");
            if let Some(snapshot) = row.get("snapshot").and_then(Value::as_object) {
                let mut data = snapshot.clone();
                if let Some(id) = &ad_archive_id {
                    data.entry("ad_archive_id".to_string())
                        .or_insert_with(|| Value::String(id.clone()));
                }
                snapshots.push(SnapshotDraft {
                    source_id: ad_archive_id,
                    data: Value::Object(data),
                });
            }
        }

        Ok(EnrichmentDraft {
            scrape_uuid: str_field(obj, "ccl_uuid"),
            version: 2,
            vendor,
            platform: str_field(obj, "platform"),
            ad_type: str_field(obj, "ad_type"),
            scrape_started_at: i64_field(obj, "scrape_started_at"),
            scrape_completed_at: i64_field(obj, "scrape_completed_at"),
            entities,
            snapshots,
        })
    }
}

impl EnrichmentParser for CclScrapeResponseParser {
    fn key(&self) -> ParserKey {
        ParserKey::new(SCHEME_CCL, 2)
    }

    fn parse(&self, rdo: &RawObservationRecord) -> Result<ParseOutput, ParserError> {
        let mut output = ParseOutput::default();
        for (index, block) in scrape_blocks(rdo, SCHEME_CCL)?.iter().enumerate() {
            match Self::parse_block(block, index) {
                Ok(draft) => output.drafts.push(draft),
                Err(skip) => output.skips.push(skip),
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rdo(document: Value) -> RawObservationRecord {
        RawObservationRecord::new(document)
    }

    #[test]
    fn detect_prefers_ccl_v2_over_ccl() {
        let record = rdo(json!({
            "version": 2,
            "enrichment": {"ccl_v2": {"scrapes": []}, "ccl": {"scrapes": []}}
        }));
        assert_eq!(
            detect(&record),
            Detection::Enrichment(ParserKey::new(SCHEME_CCL_V2, 2))
        );
    }

    #[test]
    fn detect_uses_scheme_default_version_when_marker_absent() {
        let record = rdo(json!({"enrichment": {"ccl": {"scrapes": []}}}));
        assert_eq!(
            detect(&record),
            Detection::Enrichment(ParserKey::new(SCHEME_CCL, 2))
        );
        let legacy = rdo(json!({"enrichment": {"meta_adlibrary_scrape": {}}}));
        assert_eq!(
            detect(&legacy),
            Detection::Enrichment(ParserKey::new(SCHEME_LEGACY_SCRAPE, 1))
        );
    }

    #[test]
    fn detect_honours_an_explicit_version_marker() {
        let record = rdo(json!({"version": 3, "enrichment": {"ccl_v2": {}}}));
        assert_eq!(
            detect(&record),
            Detection::Enrichment(ParserKey::new(SCHEME_CCL_V2, 3))
        );
    }

    #[test]
    fn detect_rejects_a_version_marker_beyond_i32() {
        let record = rdo(json!({"version": 8_589_934_594i64, "enrichment": {"ccl_v2": {}}}));
        assert_eq!(
            detect(&record),
            Detection::Unsupported {
                observed: "version marker 8589934594 out of range".to_string()
            }
        );
    }

    #[test]
    fn detect_signals_absence_and_unknown_shapes_distinctly() {
        assert_eq!(detect(&rdo(json!({"observation": {}}))), Detection::NoEnrichment);
        assert_eq!(detect(&rdo(json!({"enrichment": {}}))), Detection::NoEnrichment);
        assert_eq!(
            detect(&rdo(json!({"enrichment": {"acme_adscan": {}}}))),
            Detection::Unsupported {
                observed: "acme_adscan".to_string()
            }
        );
    }

    #[test]
    fn unregistered_key_misses_the_registry() {
        let registry = ParserRegistry::with_builtin();
        assert!(registry.get(&ParserKey::new(SCHEME_CCL_V2, 2)).is_some());
        assert!(registry.get(&ParserKey::new(SCHEME_CCL, 2)).is_some());
        assert!(registry.get(&ParserKey::new(SCHEME_LEGACY_SCRAPE, 1)).is_none());
        assert!(registry.get(&ParserKey::new(SCHEME_CCL_V2, 3)).is_none());
    }

    #[test]
    fn ccl_v2_extracts_entities_and_snapshots_verbatim() {
        let record = rdo(json!({
            "enrichment": {"ccl_v2": {"scrapes": [{
                "ccl_uuid": "scrape-1",
                "vendor": "meta_adlibrary",
                "platform": "facebook",
                "ad_type": "political",
                "scrape_started_at": 1732759316000i64,
                "scrape_completed_at": 1732759317000i64,
                "entities": [
                    {"source_id": "106208145902863", "type": "page", "name": "Some Page"},
                    {"type": "keyword", "keyword": "shoes"}
                ],
                "snapshots": [
                    {"source_id": "1662132171399390", "title": "Ad creative"}
                ]
            }]}}
        }));

        let output = CclV2Parser.parse(&record).expect("parse");
        assert!(output.skips.is_empty());
        assert_eq!(output.drafts.len(), 1);
        let draft = &output.drafts[0];
        assert_eq!(draft.scrape_uuid.as_deref(), Some("scrape-1"));
        assert_eq!(draft.vendor, "meta_adlibrary");
        assert_eq!(draft.entities.len(), 2);
        assert_eq!(draft.entities[0].source_id.as_deref(), Some("106208145902863"));
        assert_eq!(draft.entities[1].source_id, None);
        assert_eq!(draft.entities[1].entity_type, "keyword");
        assert_eq!(draft.entities[1].data["keyword"], "shoes");
        assert_eq!(draft.snapshots.len(), 1);
        assert_eq!(draft.snapshots[0].source_id.as_deref(), Some("1662132171399390"));
    }

    #[test]
    fn ccl_v2_isolates_a_malformed_sibling_block() {
        let record = rdo(json!({
            "enrichment": {"ccl_v2": {"scrapes": [
                {"platform": "facebook"},
                {"vendor": "meta_adlibrary", "entities": [], "snapshots": []}
            ]}}
        }));

        let output = CclV2Parser.parse(&record).expect("parse");
        assert_eq!(output.drafts.len(), 1);
        assert_eq!(output.skips.len(), 1);
        assert_eq!(output.skips[0].reason, SkipReason::MalformedBlock);
        assert!(output.skips[0].detail.contains("[0]"));
    }

    #[test]
    fn ccl_response_rows_become_page_entities_and_snapshots() {
        let record = rdo(json!({
            "enrichment": {"ccl": {"scrapes": [{
                "vendor": "meta_adlibrary",
                "scrape_started_at": 100,
                "response": {"response_interpreted": {"json_raw": [
                    {
                        "page_id": "106208145902863",
                        "page_name": "Some Page",
                        "ad_archive_id": "1662132171399390",
                        "snapshot": {"title": "Ad creative", "cta_type": "SHOP_NOW"}
                    },
                    {
                        "page_id": "106208145902863",
                        "ad_archive_id": "999",
                        "snapshot": {"title": "Second creative"}
                    }
                ]}}
            }]}}
        }));

        let output = CclScrapeResponseParser.parse(&record).expect("parse");
        assert_eq!(output.drafts.len(), 1);
        let draft = &output.drafts[0];
        // Repeated page rows collapse into one entity snapshot per scrape.
        assert_eq!(draft.entities.len(), 1);
        assert_eq!(draft.entities[0].entity_type, "page");
        assert!(draft.entities[0].data.get("snapshot").is_none());
        assert_eq!(draft.snapshots.len(), 2);
        assert_eq!(draft.snapshots[0].data["ad_archive_id"], "1662132171399390");
    }

    #[test]
    fn scrapes_of_the_wrong_shape_are_a_contract_violation() {
        let record = rdo(json!({"enrichment": {"ccl_v2": {"scrapes": "nope"}}}));
        assert!(CclV2Parser.parse(&record).is_err());
    }
}
