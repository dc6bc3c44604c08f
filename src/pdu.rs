//! Protocol data model: the canonical request/response messages.
//!
//! These types cross the wire in MessagePack struct-as-map format via
//! [`PduCodec`]. Creation timestamps are RFC 3339 strings on the wire;
//! [`FilesystemVersion::creation_time`] converts to `chrono` instants and
//! fails cleanly on parse errors. Resume tokens are opaque byte strings
//! whose meaning belongs to the transport below the sender.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapferryError};

/// MessagePack codec for PDU messages.
///
/// Uses `rmp_serde::to_vec_named` so structs serialize as maps with field
/// names; positional encoding would silently couple both peers to field
/// order.
pub struct PduCodec;

impl PduCodec {
    /// Encode a PDU to MessagePack bytes.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MessagePack bytes to a PDU.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// A replicatable filesystem, identified by its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub path: String,
    /// Opaque token of an interrupted prior send on this filesystem;
    /// empty if none.
    #[serde(with = "serde_bytes", default)]
    pub resume_token: Vec<u8>,
}

/// Kind of a filesystem version.
///
/// Snapshots may be pruned; bookmarks are listed but never selected for
/// pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    Snapshot,
    Bookmark,
}

/// A snapshot or bookmark of one filesystem.
///
/// `guid` uniquely identifies the version across a pool; `create_txg`
/// orders versions within one filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemVersion {
    pub kind: VersionType,
    pub name: String,
    pub guid: u64,
    pub create_txg: u64,
    /// RFC 3339 creation timestamp; empty if unset.
    pub creation: String,
}

impl FilesystemVersion {
    /// Construct a snapshot version with an RFC 3339 creation string.
    pub fn snapshot(name: &str, guid: u64, create_txg: u64, creation: DateTime<Utc>) -> Self {
        Self {
            kind: VersionType::Snapshot,
            name: name.to_string(),
            guid,
            create_txg,
            creation: creation.to_rfc3339(),
        }
    }

    /// Construct a bookmark version with an RFC 3339 creation string.
    pub fn bookmark(name: &str, guid: u64, create_txg: u64, creation: DateTime<Utc>) -> Self {
        Self {
            kind: VersionType::Bookmark,
            name: name.to_string(),
            guid,
            create_txg,
            creation: creation.to_rfc3339(),
        }
    }

    /// Version name relative to its filesystem, `@name` for snapshots and
    /// `#name` for bookmarks.
    pub fn rel_name(&self) -> String {
        match self.kind {
            VersionType::Snapshot => format!("@{}", self.name),
            VersionType::Bookmark => format!("#{}", self.name),
        }
    }

    /// Parse the creation timestamp.
    ///
    /// An empty creation field parses to the Unix epoch; anything else
    /// must be valid RFC 3339.
    pub fn creation_time(&self) -> Result<DateTime<Utc>> {
        if self.creation.is_empty() {
            return Ok(DateTime::UNIX_EPOCH);
        }
        DateTime::parse_from_rfc3339(&self.creation)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|source| SnapferryError::InvalidCreation {
                value: self.creation.clone(),
                source,
            })
    }
}

/// Request for a snapshot send.
///
/// Contract: if `resume_token` is nonempty the sender MUST attempt to
/// resume and MUST report [`SendRes::used_resume_token`] accurately; the
/// GUIDs encoded in the token must match `from`/`to` or the call fails.
/// If resuming fails for another reason the sender should discard the
/// token and fall back to a `from`/`to` send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReq {
    pub filesystem: String,
    pub from: String,
    /// Empty `to` requests a full send of `from`.
    #[serde(default)]
    pub to: String,
    #[serde(with = "serde_bytes", default)]
    pub resume_token: Vec<u8>,
    pub compress: bool,
    pub dedup: bool,
    pub dry_run: bool,
}

/// A name/value property of the sent filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRes {
    /// Whether the send resumed from the request's token.
    pub used_resume_token: bool,
    /// Expected stream size in bytes; `0` means unknown.
    pub expected_size: i64,
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveReq {
    pub filesystem: String,
    /// Clear any saved resume token before receiving.
    pub clear_resume_token: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveRes {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySnapshotsReq {
    pub filesystem: String,
    pub snapshots: Vec<FilesystemVersion>,
}

/// Per-version destroy outcome; `error` is empty on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySnapshotRes {
    pub snapshot: FilesystemVersion,
    #[serde(default)]
    pub error: String,
}

/// One result per requested version; per-version failure does not fail
/// the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySnapshotsRes {
    pub results: Vec<DestroySnapshotRes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplicationCursorOp {
    Get,
    Set { snapshot: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCursorReq {
    pub filesystem: String,
    pub op: ReplicationCursorOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReplicationCursorRes {
    Cursor { guid: u64 },
    NotExist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReplicationStatusOp {
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReplicationStatusReq {
    pub filesystem: String,
    pub snapshot: String,
    pub op: SnapshotReplicationStatusOp,
}

/// Replication status of one snapshot as known to the history side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    /// The history side has no record of the snapshot.
    Nonexistent,
    NotReplicated,
    Replicated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReplicationStatusRes {
    pub status: ReplicationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn codec_roundtrip<T>(value: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let bytes = PduCodec::encode(value).unwrap();
        PduCodec::decode(&bytes).unwrap()
    }

    #[test]
    fn test_filesystem_version_wire_roundtrip_is_identity() {
        let creation = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 45).unwrap();
        let v = FilesystemVersion::snapshot("daily_2024-03-09", 0xDEADBEEF, 1234, creation);
        let got: FilesystemVersion = codec_roundtrip(&v);
        assert_eq!(got, v);
        assert_eq!(got.creation_time().unwrap(), creation);
    }

    #[test]
    fn test_bookmark_rel_name() {
        let creation = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = FilesystemVersion::bookmark("cursor", 7, 9, creation);
        assert_eq!(b.rel_name(), "#cursor");
        let s = FilesystemVersion::snapshot("daily", 8, 10, creation);
        assert_eq!(s.rel_name(), "@daily");
    }

    #[test]
    fn test_empty_creation_parses_to_epoch() {
        let v = FilesystemVersion {
            kind: VersionType::Snapshot,
            name: "s".into(),
            guid: 1,
            create_txg: 1,
            creation: String::new(),
        };
        assert_eq!(v.creation_time().unwrap(), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_garbage_creation_fails_cleanly() {
        let v = FilesystemVersion {
            kind: VersionType::Snapshot,
            name: "s".into(),
            guid: 1,
            create_txg: 1,
            creation: "yesterday-ish".into(),
        };
        let err = v.creation_time().unwrap_err();
        assert!(matches!(err, SnapferryError::InvalidCreation { .. }));
        assert!(!err.should_retry());
    }

    #[test]
    fn test_resume_token_encodes_as_binary() {
        let fs = Filesystem {
            path: "tank/data".into(),
            resume_token: vec![0x01, 0x02, 0xFF],
        };
        let bytes = PduCodec::encode(&fs).unwrap();
        let got: Filesystem = PduCodec::decode(&bytes).unwrap();
        assert_eq!(got, fs);
    }

    #[test]
    fn test_send_req_roundtrip() {
        let req = SendReq {
            filesystem: "tank/data".into(),
            from: "daily_1".into(),
            to: "daily_2".into(),
            resume_token: b"opaque".to_vec(),
            compress: true,
            dedup: false,
            dry_run: true,
        };
        assert_eq!(codec_roundtrip(&req), req);
    }

    #[test]
    fn test_destroy_results_roundtrip() {
        let creation = Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap();
        let res = DestroySnapshotsRes {
            results: vec![
                DestroySnapshotRes {
                    snapshot: FilesystemVersion::snapshot("a", 1, 1, creation),
                    error: String::new(),
                },
                DestroySnapshotRes {
                    snapshot: FilesystemVersion::snapshot("b", 2, 2, creation),
                    error: "dataset busy".into(),
                },
            ],
        };
        assert_eq!(codec_roundtrip(&res), res);
    }

    #[test]
    fn test_replication_cursor_variants_roundtrip() {
        let get = ReplicationCursorReq {
            filesystem: "tank/data".into(),
            op: ReplicationCursorOp::Get,
        };
        assert_eq!(codec_roundtrip(&get), get);

        let set = ReplicationCursorReq {
            filesystem: "tank/data".into(),
            op: ReplicationCursorOp::Set {
                snapshot: "daily_2".into(),
            },
        };
        assert_eq!(codec_roundtrip(&set), set);

        let cursor = ReplicationCursorRes::Cursor { guid: 42 };
        assert_eq!(codec_roundtrip(&cursor), cursor);
        let not_exist = ReplicationCursorRes::NotExist;
        assert_eq!(codec_roundtrip(&not_exist), not_exist);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ReplicationStatus::Nonexistent,
            ReplicationStatus::NotReplicated,
            ReplicationStatus::Replicated,
        ] {
            let res = SnapshotReplicationStatusRes { status };
            assert_eq!(codec_roundtrip(&res).status, status);
        }
    }

    #[test]
    fn test_encoding_is_map_format() {
        let fs = Filesystem {
            path: "tank".into(),
            resume_token: Vec::new(),
        };
        let bytes = PduCodec::encode(&fs).unwrap();
        // fixmap marker: struct-as-map, not positional array
        assert_eq!(bytes[0] & 0xF0, 0x80);
    }
}
