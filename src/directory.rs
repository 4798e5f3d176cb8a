//! Remote host-group directory boundary.
//!
//! The console is the source of truth for group membership but is expensive
//! and rate-limited to talk to; everything the reconciliation core needs from
//! it goes through the `GroupDirectory` trait so tests can stand in an
//! in-memory directory.
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SgtSyncError};

/// One row of the console's tag list: enough to resolve a name to an id.
#[derive(Clone, Debug, Deserialize)]
pub struct TagSummary {
    #[serde(deserialize_with = "opaque_id")]
    pub id: String,
    pub name: String,
}

/// Full tag document as fetched from the console. The raw document is kept
/// alongside the parsed fields because mutations PUT the whole document back
/// with only `ranges` rewritten; unknown console fields must survive the
/// round trip.
#[derive(Clone, Debug)]
pub struct TagRecord {
    pub id: String,
    pub name: String,
    /// `None` when the console omitted the field entirely, which some
    /// releases do for tags that never held a range.
    pub ranges: Option<Vec<String>>,
    raw: Value,
}

impl TagRecord {
    pub fn from_value(raw: Value) -> Result<Self> {
        let id = raw
            .get("id")
            .map(render_opaque_id)
            .ok_or_else(|| SgtSyncError::RemoteFetch("tag document without id".to_string()))?;
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ranges = raw.get("ranges").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
        Ok(Self {
            id,
            name,
            ranges,
            raw,
        })
    }

    /// Membership is string-exact: the console stores single IPs and CIDR
    /// blocks in the same list and we only ever manage single IPs.
    pub fn contains(&self, ip: &str) -> bool {
        self.ranges
            .as_ref()
            .map(|ranges| ranges.iter().any(|range| range == ip))
            .unwrap_or(false)
    }

    /// The full console document with `ranges` replaced, ready to PUT back.
    pub fn document_with_ranges(&self, ranges: &[String]) -> Value {
        let mut doc = self.raw.clone();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("ranges".to_string(), Value::from(ranges.to_vec()));
        }
        doc
    }
}

/// Remote store operations the reconciliation core drives. Every call may
/// fail with a transport error; `fetch_tag_details` also fails on not-found.
/// Session renewal is the implementation's business and never surfaces here.
#[async_trait]
pub trait GroupDirectory {
    /// Case-sensitive exact name lookup. `None` means the tag does not exist
    /// yet and may be created.
    async fn resolve_tag_id(&mut self, name: &str) -> Result<Option<String>>;

    /// Create a tag named after an SGT, parented per configuration.
    async fn create_tag(&mut self, name: &str) -> Result<String>;

    async fn fetch_tag_details(&mut self, tag_id: &str) -> Result<TagRecord>;

    async fn add_ip_to_tag(&mut self, tag_id: &str, details: &TagRecord, ip: &str) -> Result<()>;

    async fn remove_ip_from_tag(
        &mut self,
        tag_id: &str,
        details: &TagRecord,
        ip: &str,
    ) -> Result<()>;

    /// Current remote-call rate over the client's own trailing window; the
    /// controller gates new work on this.
    fn call_rate(&mut self) -> f64;

    /// Lifetime remote-call count.
    fn call_index(&self) -> u64;
}

/// The console renders tag ids as JSON numbers; other deployments have been
/// seen returning strings. Treat both as opaque strings.
fn render_opaque_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn opaque_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(render_opaque_id(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tag_record_parses_numeric_id() {
        let record = TagRecord::from_value(json!({
            "id": 7,
            "name": "GuestWireless",
            "ranges": ["10.1.1.5", "10.2.0.0/16"],
            "parentId": 3,
            "hostBaselines": false,
        }))
        .unwrap();
        assert_eq!(record.id, "7");
        assert_eq!(record.name, "GuestWireless");
        assert!(record.contains("10.1.1.5"));
        assert!(!record.contains("10.1.1.6"));
        // CIDR entries only match exactly; we never expand them
        assert!(!record.contains("10.2.0.1"));
    }

    #[test]
    fn tag_record_parses_string_id() {
        let record = TagRecord::from_value(json!({"id": "abc-1", "name": "x"})).unwrap();
        assert_eq!(record.id, "abc-1");
    }

    #[test]
    fn tag_record_without_ranges() {
        let record = TagRecord::from_value(json!({"id": 9, "name": "Quarantine"})).unwrap();
        assert!(record.ranges.is_none());
        assert!(!record.contains("10.1.1.5"));
    }

    #[test]
    fn tag_record_without_id_is_an_error() {
        let err = TagRecord::from_value(json!({"name": "x"})).unwrap_err();
        assert!(matches!(err, SgtSyncError::RemoteFetch(_)));
    }

    #[test]
    fn document_round_trip_preserves_unknown_fields() {
        let record = TagRecord::from_value(json!({
            "id": 7,
            "name": "GuestWireless",
            "ranges": ["10.1.1.5"],
            "sendToCta": true,
            "parentId": 3,
        }))
        .unwrap();
        let doc = record.document_with_ranges(&["10.1.1.5".to_string(), "10.1.1.6".to_string()]);
        assert_eq!(doc["sendToCta"], json!(true));
        assert_eq!(doc["parentId"], json!(3));
        assert_eq!(doc["ranges"], json!(["10.1.1.5", "10.1.1.6"]));
    }

    #[test]
    fn tag_summary_accepts_numeric_and_string_ids() {
        let rows: Vec<TagSummary> =
            serde_json::from_value(json!([{"id": 7, "name": "a"}, {"id": "x9", "name": "b"}]))
                .unwrap();
        assert_eq!(rows[0].id, "7");
        assert_eq!(rows[1].id, "x9");
    }
}
