//! Fixed, versioned wire schema for cached usage records.
//!
//! Records are stored as `{"v":1, ...fields}`. Unknown versions are rejected
//! rather than coerced.

use serde::{Deserialize, Serialize};

use crate::CachedUsageRecord;

pub const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported record schema version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid record encoding: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Stored<R> {
    v: u32,
    #[serde(flatten)]
    record: R,
}

#[derive(Deserialize)]
struct VersionProbe {
    v: u32,
}

pub fn encode_record(record: &CachedUsageRecord) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&Stored { v: RECORD_SCHEMA_VERSION, record })?)
}

pub fn decode_record(bytes: &[u8]) -> Result<CachedUsageRecord, CodecError> {
    let probe: VersionProbe = serde_json::from_slice(bytes)?;
    if probe.v != RECORD_SCHEMA_VERSION {
        return Err(CodecError::UnsupportedVersion(probe.v));
    }
    let stored: Stored<CachedUsageRecord> = serde_json::from_slice(bytes)?;
    Ok(stored.record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record() -> CachedUsageRecord {
        let t = Utc.with_ymd_and_hms(2024, 2, 2, 10, 0, 0).unwrap();
        CachedUsageRecord {
            workload_id: "dev-1".into(),
            namespace: "ns-9".into(),
            user_id: 9,
            start_time: t,
            last_update: t + chrono::Duration::seconds(42),
            total_seconds: 42,
        }
    }

    #[test]
    fn encoding_carries_version_tag() {
        let bytes = encode_record(&record()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["v"], 1);
        assert_eq!(v["total_seconds"], 42);
        assert_eq!(decode_record(&bytes).unwrap(), record());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut v: serde_json::Value = serde_json::from_slice(&encode_record(&record()).unwrap()).unwrap();
        v["v"] = serde_json::json!(2);
        let err = decode_record(&serde_json::to_vec(&v).unwrap()).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(2)));
    }

    #[test]
    fn loosely_typed_fields_are_not_coerced() {
        let raw = br#"{"v":1,"workload_id":"w","namespace":"n","user_id":"7","start_time":"2024-01-01T00:00:00Z","last_update":"2024-01-01T00:00:00Z","total_seconds":"10"}"#;
        assert!(matches!(decode_record(raw), Err(CodecError::Invalid(_))));
        assert!(matches!(decode_record(b"{}"), Err(CodecError::Invalid(_))));
    }
}
