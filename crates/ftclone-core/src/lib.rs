//! Core data model for ftclone: operations, checkpoints, events, manifests and status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "ftclone-core";

pub const MAX_OPERATION_ID_LEN: usize = 128;
pub const MAX_FILTER_TIMESTAMP_LEN: usize = 19;

/// Release stage filter understood by the upstream listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planning,
    Tender,
    Award,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Tender => "tender",
            Stage::Award => "award",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planning" => Ok(Stage::Planning),
            "tender" => Ok(Stage::Tender),
            "award" => Ok(Stage::Award),
            other => Err(format!(
                "unknown stage `{other}` (expected planning, tender or award)"
            )),
        }
    }
}

/// How many items a run should ingest. Serialized as a number or `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    Unlimited,
    Limited(u64),
}

impl Quota {
    /// `-1` and `0` mean unlimited; anything below `-1` is rejected.
    pub fn from_total(total: i64) -> Result<Self, String> {
        if total < -1 {
            return Err(format!("total must be -1 (unlimited) or >= 0, got {total}"));
        }
        if total > 0 {
            Ok(Quota::Limited(total as u64))
        } else {
            Ok(Quota::Unlimited)
        }
    }

    pub fn as_total(&self) -> i64 {
        match self {
            Quota::Unlimited => -1,
            Quota::Limited(n) => i64::try_from(*n).unwrap_or(i64::MAX),
        }
    }

    /// Items still allowed after `processed`; `None` means unbounded.
    pub fn remaining(&self, processed: u64) -> Option<u64> {
        match self {
            Quota::Unlimited => None,
            Quota::Limited(n) => Some(n.saturating_sub(processed)),
        }
    }

    pub fn is_satisfied(&self, processed: u64) -> bool {
        matches!(self.remaining(processed), Some(0))
    }
}

impl Serialize for Quota {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Quota::Unlimited => serializer.serialize_str("unlimited"),
            Quota::Limited(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Quota {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Quota::from_total(n).map_err(serde::de::Error::custom),
            Raw::Text(t) if t == "unlimited" => Ok(Quota::Unlimited),
            Raw::Text(t) => Err(serde::de::Error::custom(format!("invalid quota `{t}`"))),
        }
    }
}

/// Request filters forwarded to the upstream listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneFilters {
    #[serde(default)]
    pub stages: Option<Stage>,
    #[serde(default, rename = "updatedFrom")]
    pub updated_from: Option<String>,
    #[serde(default, rename = "updatedTo")]
    pub updated_to: Option<String>,
}

impl CloneFilters {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(value) = &self.updated_from {
            validate_filter_timestamp("updatedFrom", value)?;
        }
        if let Some(value) = &self.updated_to {
            validate_filter_timestamp("updatedTo", value)?;
        }
        Ok(())
    }
}

fn validate_filter_timestamp(name: &str, value: &str) -> Result<(), String> {
    if value.len() > MAX_FILTER_TIMESTAMP_LEN {
        return Err(format!(
            "{name} must be at most {MAX_FILTER_TIMESTAMP_LEN} characters, got {}",
            value.len()
        ));
    }
    let parses = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok();
    if parses {
        Ok(())
    } else {
        Err(format!(
            "{name} must look like YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS, got `{value}`"
        ))
    }
}

/// Caller-supplied ids become directory names, so only a conservative charset is allowed.
pub fn validate_operation_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > MAX_OPERATION_ID_LEN {
        return Err(format!(
            "operation_id must be 1..={MAX_OPERATION_ID_LEN} characters"
        ));
    }
    if id == "." || id == ".." {
        return Err(format!("operation_id `{id}` is not allowed"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(format!(
            "operation_id `{id}` may only contain ASCII letters, digits, '_', '-' and '.'"
        ));
    }
    Ok(())
}

/// Four-digit fingerprint of the request shape used in generated operation ids.
pub fn request_fingerprint(filters: &CloneFilters, quota: Quota) -> u16 {
    let material = format!(
        "{}|{}|{}|{}",
        filters.stages.map(|s| s.as_str()).unwrap_or("-"),
        filters.updated_from.as_deref().unwrap_or("-"),
        filters.updated_to.as_deref().unwrap_or("-"),
        quota.as_total()
    );
    let digest = Sha256::digest(material.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]]) % 10_000
}

/// `clone_<YYYYmmdd_HHMMSS>_<NNNN>`.
pub fn generate_operation_id(now: DateTime<Utc>, filters: &CloneFilters, quota: Quota) -> String {
    format!(
        "clone_{}_{:04}",
        now.format("%Y%m%d_%H%M%S"),
        request_fingerprint(filters, quota)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneStatus {
    Running,
    Completed,
    Failed,
}

impl CloneStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CloneStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneStats {
    #[serde(default)]
    pub pages: u64,
    #[serde(default)]
    pub received_raw: u64,
    #[serde(default)]
    pub processed_total: u64,
    #[serde(default)]
    pub events_written: u64,
    #[serde(default)]
    pub objects_written: u64,
}

/// Resumable cursor state for one operation.
///
/// `fixed_*` values are frozen the first time they are known and must be sent unchanged
/// with every later page request of the same operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub operation_id: String,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub pages: u64,
    #[serde(default)]
    pub received_raw: u64,
    #[serde(default)]
    pub processed_total: u64,
    #[serde(default)]
    pub events_written: u64,
    #[serde(default)]
    pub objects_written: u64,
    #[serde(default)]
    pub fixed_stages: Option<Stage>,
    #[serde(default)]
    pub fixed_updated_from: Option<String>,
    #[serde(default)]
    pub fixed_updated_to: Option<String>,
    /// Set once no further page needs to be requested.
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn fresh(operation_id: impl Into<String>, filters: &CloneFilters) -> Self {
        Self {
            operation_id: operation_id.into(),
            cursor: None,
            pages: 0,
            received_raw: 0,
            processed_total: 0,
            events_written: 0,
            objects_written: 0,
            fixed_stages: filters.stages,
            fixed_updated_from: filters.updated_from.clone(),
            fixed_updated_to: filters.updated_to.clone(),
            exhausted: false,
            warnings: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn frozen_filters(&self) -> CloneFilters {
        CloneFilters {
            stages: self.fixed_stages,
            updated_from: self.fixed_updated_from.clone(),
            updated_to: self.fixed_updated_to.clone(),
        }
    }

    pub fn stats(&self) -> CloneStats {
        CloneStats {
            pages: self.pages,
            received_raw: self.received_raw,
            processed_total: self.processed_total,
            events_written: self.events_written,
            objects_written: self.objects_written,
        }
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

/// One append-only log line per ingested record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneEvent {
    pub fetched_at: DateTime<Utc>,
    pub source: String,
    pub page: u64,
    pub cursor: Option<String>,
    pub ocid: Option<String>,
    pub content_hash: String,
    #[serde(default)]
    pub upstream: BTreeMap<String, JsonValue>,
    pub page_uri: Option<String>,
}

/// Terminal summary of a finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneResult {
    pub status: String,
    pub operation_id: String,
    pub path: String,
    #[serde(flatten)]
    pub stats: CloneStats,
    pub elapsed_seconds: f64,
    pub generated_at: DateTime<Utc>,
    pub resume_supported: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestParams {
    pub total_requested: Quota,
    pub stages: Option<Stage>,
    #[serde(rename = "updatedFrom")]
    pub updated_from: Option<String>,
    #[serde(rename = "updatedTo")]
    pub updated_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestLayout {
    pub objects_dir: String,
    pub events_dir: String,
    pub checkpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub operation_id: String,
    pub source: String,
    pub base_url: String,
    pub version: String,
    pub params: ManifestParams,
    pub stats: CloneStats,
    pub generated_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub layout: ManifestLayout,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Frequently overwritten progress record, readable without the checkpoint or event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub operation_id: String,
    pub status: CloneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_requested: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<CloneFilters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<CloneStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CloneResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(operation_id: impl Into<String>, status: CloneStatus) -> Self {
        Self {
            operation_id: operation_id.into(),
            status,
            started_at: None,
            resumed_at: None,
            total_requested: None,
            filters: None,
            elapsed_seconds: None,
            stats: None,
            cursor: None,
            path: None,
            result: None,
            error: None,
            warnings: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn completed(result: CloneResult) -> Self {
        let mut snapshot = Self::new(result.operation_id.clone(), CloneStatus::Completed);
        snapshot.path = Some(result.path.clone());
        snapshot.stats = Some(result.stats);
        snapshot.elapsed_seconds = Some(result.elapsed_seconds);
        snapshot.warnings = result.warnings.clone();
        snapshot.result = Some(result);
        snapshot
    }

    pub fn failed(operation_id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut snapshot = Self::new(operation_id, CloneStatus::Failed);
        snapshot.error = Some(error.into());
        snapshot
    }
}

/// In-memory mirror of an operation, used for polling before the first status write lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub status: CloneStatus,
    pub started_at: DateTime<Utc>,
    pub path: String,
    pub total_requested: Quota,
    pub filters: CloneFilters,
    pub background: bool,
    pub error: Option<String>,
    pub result: Option<CloneResult>,
}

impl OperationRecord {
    pub fn running(
        operation_id: impl Into<String>,
        path: impl Into<String>,
        total_requested: Quota,
        filters: CloneFilters,
        background: bool,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: CloneStatus::Running,
            started_at: Utc::now(),
            path: path.into(),
            total_requested,
            filters,
            background,
            error: None,
            result: None,
        }
    }

    pub fn to_status_snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::new(self.operation_id.clone(), self.status);
        snapshot.started_at = Some(self.started_at);
        snapshot.total_requested = Some(self.total_requested);
        snapshot.filters = Some(self.filters.clone());
        snapshot.path = Some(self.path.clone());
        snapshot.error = self.error.clone();
        if let Some(result) = &self.result {
            snapshot.stats = Some(result.stats);
            snapshot.elapsed_seconds = Some(result.elapsed_seconds);
            snapshot.result = Some(result.clone());
        }
        snapshot
    }
}
