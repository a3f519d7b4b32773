//! Profile document model and parser.
//!
//! A profile enumerates the shard files of a dataset together with their
//! sizes and (optionally) sampled digests. Two profiles — one describing the
//! source machine, one the destination — are the planner's only inputs.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One shard file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFile {
    /// Path to the file in the local filesystem.
    pub path: String,

    /// Size of the file in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// 16-char sampled digest, when the profile was generated with digests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// A group of shards carrying offset-aligned content.
///
/// Shard order is semantically meaningful: shards at the same index in the
/// source and destination groups are the paired units for diffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGroup {
    /// Number of bits used for sharding.
    pub sharding_bits: u32,

    /// Ordered shard files.
    pub shards: Vec<ProfileFile>,
}

/// An [`ObjectGroup`] extended with a version and associated large files.
///
/// Maps do not enjoy the prefix invariant and are always copied whole when
/// the version changes. Versions order lexicographically; higher wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapGroup {
    /// Version tag, e.g. `"R"`, `"U"`.
    pub version: String,

    /// Number of bits used for sharding.
    pub sharding_bits: u32,

    /// Ordered shard files.
    pub shards: Vec<ProfileFile>,

    /// Large files associated with the map, keyed by large-key.
    #[serde(default)]
    pub larges: HashMap<String, ProfileFile>,

    /// Data type tags, e.g. `["h", "cs"]`.
    #[serde(default)]
    pub dtypes: Vec<String>,
}

/// The raw profile document as found on disk.
///
/// `maps` values are lists because a dataset may retain several versions of
/// the same map; parsing collapses each list to its latest version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDocument {
    /// Map groups indexed by name, possibly several versions per name.
    #[serde(default)]
    pub maps: HashMap<String, Vec<MapGroup>>,

    /// Object groups indexed by name.
    #[serde(default)]
    pub objects: HashMap<String, ObjectGroup>,
}

/// A parsed profile: one entry per name, maps collapsed to latest version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Latest-version map groups indexed by name.
    pub maps: HashMap<String, MapGroup>,

    /// Object groups indexed by name.
    pub objects: HashMap<String, ObjectGroup>,
}

impl Profile {
    /// Parse a profile from a JSON string.
    ///
    /// When a map name carries multiple entries, the entry with the highest
    /// version string (lexicographic compare) is kept.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::ProfileParse`] on malformed JSON.
    pub fn parse(json: &str) -> Result<Self> {
        let doc: ProfileDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(doc))
    }

    /// Load and parse a profile from a file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Io`] if the file cannot be read and
    /// [`crate::SyncError::ProfileParse`] on malformed JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::parse(&data)
    }

    fn from_document(doc: ProfileDocument) -> Self {
        let maps = doc
            .maps
            .into_iter()
            .filter_map(|(name, versions)| {
                versions
                    .into_iter()
                    .max_by(|a, b| a.version.cmp(&b.version))
                    .map(|latest| (name, latest))
            })
            .collect();
        Self {
            maps,
            objects: doc.objects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "maps": {
            "c2p": [
                {
                    "version": "R",
                    "sharding_bits": 2,
                    "shards": [
                        {"path": "/data/c2pFullR.0.tch", "size": 1024, "digest": "00112233aabbccdd"},
                        {"path": "/data/c2pFullR.1.tch", "size": 2048}
                    ],
                    "larges": {
                        "deadbeef": {"path": "/data/c2pFullR.large.bin", "size": 4096}
                    },
                    "dtypes": ["h", "cs"]
                },
                {
                    "version": "U",
                    "sharding_bits": 2,
                    "shards": [
                        {"path": "/data/c2pFullU.0.tch", "size": 1100},
                        {"path": "/data/c2pFullU.1.tch", "size": 2100}
                    ],
                    "larges": {},
                    "dtypes": ["h", "cs"]
                }
            ]
        },
        "objects": {
            "blob": {
                "sharding_bits": 1,
                "shards": [
                    {"path": "/data/blob_0.bin", "size": 500, "digest": "aaaaaaaaaaaaaaaa"},
                    {"path": "/data/blob_1.bin", "size": 700, "digest": "bbbbbbbbbbbbbbbb"}
                ]
            }
        }
    }"#;

    #[test]
    fn parse_collapses_to_latest_version() {
        let profile = Profile::parse(SAMPLE).unwrap();
        assert_eq!(profile.maps.len(), 1);
        let map = &profile.maps["c2p"];
        assert_eq!(map.version, "U");
        assert_eq!(map.shards.len(), 2);
        assert_eq!(map.shards[0].path, "/data/c2pFullU.0.tch");
    }

    #[test]
    fn parse_keeps_objects() {
        let profile = Profile::parse(SAMPLE).unwrap();
        let group = &profile.objects["blob"];
        assert_eq!(group.sharding_bits, 1);
        assert_eq!(group.shards.len(), 2);
        assert_eq!(group.shards[1].size, Some(700));
        assert_eq!(group.shards[1].digest.as_deref(), Some("bbbbbbbbbbbbbbbb"));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let profile = Profile::parse(
            r#"{"objects": {"x": {"sharding_bits": 0, "shards": [{"path": "/p"}]}}}"#,
        )
        .unwrap();
        let shard = &profile.objects["x"].shards[0];
        assert_eq!(shard.size, None);
        assert_eq!(shard.digest, None);
    }

    #[test]
    fn empty_document_parses() {
        let profile = Profile::parse("{}").unwrap();
        assert!(profile.maps.is_empty());
        assert!(profile.objects.is_empty());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = Profile::parse("{oops").unwrap_err();
        assert!(matches!(err, crate::SyncError::ProfileParse(_)));
    }

    #[test]
    fn version_compare_is_lexicographic() {
        let doc = r#"{
            "maps": {"m": [
                {"version": "T", "sharding_bits": 0, "shards": []},
                {"version": "V", "sharding_bits": 0, "shards": []},
                {"version": "U", "sharding_bits": 0, "shards": []}
            ]}
        }"#;
        let profile = Profile::parse(doc).unwrap();
        assert_eq!(profile.maps["m"].version, "V");
    }

    #[test]
    fn larges_default_to_empty() {
        let doc = r#"{
            "maps": {"m": [{"version": "R", "sharding_bits": 0, "shards": []}]}
        }"#;
        let profile = Profile::parse(doc).unwrap();
        assert!(profile.maps["m"].larges.is_empty());
        assert!(profile.maps["m"].dtypes.is_empty());
    }
}
