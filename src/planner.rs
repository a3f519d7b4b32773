//! Profile diff and task planner.
//!
//! Compares a destination profile against a source profile and produces the
//! minimum set of transfer tasks: nothing when a shard is already complete,
//! an append of the missing suffix when the destination holds a verified
//! prefix of the source, and a full copy otherwise.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::sampled_digest;
use crate::error::{Result, SyncError};
use crate::profile::{Profile, ProfileFile};

/// The unit of work: one byte window of one source file, exposed to the
/// transport under a flat unique name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    /// Flat, separator-free name used in the VFS and the bucket.
    pub virtual_name: String,

    /// Path of the source file on the sending machine.
    pub source_path: String,

    /// Start of the window within the source file.
    pub offset: u64,

    /// Length of the window in bytes.
    pub size: u64,

    /// Where the bytes must land on the destination, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,

    /// Sampled digest of the whole source file, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,

    /// Sampled digest of the destination prefix, for append tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_digest: Option<String>,
}

impl SyncTask {
    /// Whether this task appends a suffix rather than copying whole.
    #[must_use]
    pub fn is_append(&self) -> bool {
        self.offset > 0
    }
}

/// A task plan keyed by virtual name. Ordered for deterministic iteration.
pub type TaskPlan = BTreeMap<String, SyncTask>;

/// One host-path rewrite rule.
///
/// Applies on the named short hostname only: a source path starting with
/// `prefix` has that prefix replaced by `replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRule {
    /// Short hostname (up to the first dot) the rule applies on.
    pub host: String,
    /// Leading path segment to replace.
    pub prefix: String,
    /// Replacement for the leading segment.
    pub replacement: String,
}

/// Host-path remapping table.
///
/// Pure in `(hostname, path)`: a path either passes through unchanged or has
/// a leading segment replaced; no path ever crosses hostnames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostRemap {
    /// Rewrite rules, first match wins.
    #[serde(default)]
    pub rules: Vec<RemapRule>,
}

impl HostRemap {
    /// Rewrite `path` for `hostname`.
    ///
    /// Falls back to stripping a `/<host>_` prefix down to `/` when no rule
    /// matches but the path is prefixed with the short hostname.
    #[must_use]
    pub fn apply(&self, hostname: &str, path: &str) -> String {
        let short = hostname.split('.').next().unwrap_or(hostname);
        if short.is_empty() {
            return path.to_string();
        }
        for rule in &self.rules {
            if rule.host == short {
                if let Some(rest) = path.strip_prefix(&rule.prefix) {
                    return format!("{}{rest}", rule.replacement);
                }
            }
        }
        let host_prefix = format!("/{short}_");
        if let Some(rest) = path.strip_prefix(&host_prefix) {
            return format!("/{rest}");
        }
        path.to_string()
    }
}

/// Options controlling a planning run.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Skip the sampled prefix comparison and emit full copies instead.
    ///
    /// Set on the receiver, which has no access to source files.
    pub skip_partial_digest_check: bool,

    /// Drop tasks whose (remapped) source file is missing or lives on a
    /// network filesystem.
    pub local_only: bool,

    /// Short hostname used by the remapping table; empty disables remapping.
    pub hostname: String,

    /// Host-path rewrite table.
    pub remap: HostRemap,
}

impl PlanOptions {
    fn resolve(&self, path: &str) -> String {
        if self.hostname.is_empty() {
            return path.to_string();
        }
        let resolved = self.remap.apply(&self.hostname, path);
        if resolved != path {
            debug!(from = path, to = %resolved, "Resolved source path");
        }
        resolved
    }
}

/// Diff `src` against `dst` and produce the task plan.
///
/// # Errors
///
/// Fails fast on malformed profiles (missing shard sizes, unequal shard
/// counts in paired object groups) and on I/O errors while computing
/// digests. A missing source file is never fatal: the affected shard
/// downgrades to a full copy with no partial check.
pub fn plan(dst: &Profile, src: &Profile, opts: &PlanOptions) -> Result<TaskPlan> {
    let mut tasks = TaskPlan::new();

    for (name, map_s) in &src.maps {
        let newer = match dst.maps.get(name) {
            None => true,
            Some(map_d) => map_s.version > map_d.version,
        };
        if !newer {
            continue;
        }
        let mut files: Vec<&ProfileFile> = map_s.shards.iter().collect();
        let mut large_keys: Vec<&String> = map_s.larges.keys().collect();
        large_keys.sort();
        files.extend(large_keys.into_iter().map(|k| &map_s.larges[k]));

        let planned = files
            .par_iter()
            .map(|f| full_copy_task(f, None, opts))
            .collect::<Result<Vec<_>>>()?;
        for task in planned.into_iter().flatten() {
            tasks.insert(task.virtual_name.clone(), task);
        }
    }

    for (name, group_s) in &src.objects {
        let planned = match dst.objects.get(name) {
            None => group_s
                .shards
                .par_iter()
                .map(|f| full_copy_task(f, None, opts))
                .collect::<Result<Vec<_>>>()?,
            Some(group_d) => {
                if group_d.shards.len() != group_s.shards.len() {
                    return Err(SyncError::ProfileParse(format!(
                        "object group {name}: shard count mismatch ({} != {})",
                        group_s.shards.len(),
                        group_d.shards.len()
                    )));
                }
                group_s
                    .shards
                    .par_iter()
                    .zip(group_d.shards.par_iter())
                    .map(|(src_f, dst_f)| plan_pair(src_f, dst_f, opts))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        for task in planned.into_iter().flatten() {
            tasks.insert(task.virtual_name.clone(), task);
        }
    }

    if opts.local_only {
        tasks.retain(|name, task| {
            if source_usable(Path::new(&task.source_path)) {
                true
            } else {
                debug!(virtual_name = %name, path = %task.source_path, "Source unusable, dropping task");
                false
            }
        });
    }

    Ok(tasks)
}

/// Plan one paired shard.
fn plan_pair(
    src_f: &ProfileFile,
    dst_f: &ProfileFile,
    opts: &PlanOptions,
) -> Result<Option<SyncTask>> {
    let src_size = require_size(src_f)?;
    let dst_size = require_size(dst_f)?;

    if dst_size > src_size {
        // Destination ahead of source: cannot be a prefix.
        warn!(
            source = %src_f.path,
            source_size = src_size,
            destination = %dst_f.path,
            destination_size = dst_size,
            "Destination larger than source, copying whole"
        );
        return full_copy_task(src_f, Some(dst_f), opts);
    }

    if opts.skip_partial_digest_check {
        return full_copy_task(src_f, Some(dst_f), opts);
    }

    let source_path = opts.resolve(&src_f.path);
    let prefix = match sampled_digest(Path::new(&source_path), 0, dst_size) {
        Ok(d) => d,
        Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %source_path, "Source missing, skipping prefix verification");
            return full_copy_task(src_f, Some(dst_f), opts);
        }
        Err(e) => return Err(e),
    };

    if dst_f.digest.as_deref() != Some(prefix.digest.as_str()) {
        debug!(
            path = %source_path,
            computed = %prefix.digest,
            recorded = dst_f.digest.as_deref().unwrap_or("<missing>"),
            "Prefix digest mismatch, copying whole"
        );
        return full_copy_task(src_f, Some(dst_f), opts);
    }

    if src_size == dst_size {
        // Already complete: same length and verified prefix.
        return Ok(None);
    }

    let virtual_name = format!("{}.offset.{dst_size}", basename(&src_f.path));
    Ok(Some(SyncTask {
        virtual_name,
        source_path,
        offset: dst_size,
        size: src_size - dst_size,
        target_path: Some(dst_f.path.clone()),
        source_digest: materialize_digest(src_f, opts)?,
        target_digest: dst_f.digest.clone(),
    }))
}

/// Build a full-copy task for one shard.
fn full_copy_task(
    src_f: &ProfileFile,
    dst_f: Option<&ProfileFile>,
    opts: &PlanOptions,
) -> Result<Option<SyncTask>> {
    let size = require_size(src_f)?;
    if size == 0 {
        return Ok(None);
    }
    Ok(Some(SyncTask {
        virtual_name: basename(&src_f.path).to_string(),
        source_path: opts.resolve(&src_f.path),
        offset: 0,
        size,
        target_path: dst_f.map(|f| f.path.clone()),
        source_digest: materialize_digest(src_f, opts)?,
        target_digest: None,
    }))
}

/// Digest from the profile, computed when absent.
///
/// Never computed on the receiver (the source files are not reachable
/// there); a missing source file leaves the digest absent rather than
/// failing the plan.
fn materialize_digest(file: &ProfileFile, opts: &PlanOptions) -> Result<Option<String>> {
    if let Some(d) = &file.digest {
        return Ok(Some(d.clone()));
    }
    if opts.skip_partial_digest_check {
        return Ok(None);
    }
    let path = opts.resolve(&file.path);
    match sampled_digest(Path::new(&path), 0, 0) {
        Ok(d) => Ok(Some(d.digest)),
        Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path, "Source missing, leaving digest unset");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn require_size(file: &ProfileFile) -> Result<u64> {
    file.size.ok_or_else(|| SyncError::MissingSize {
        path: file.path.clone(),
    })
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether a source file exists and sits on a local filesystem.
#[cfg(target_os = "linux")]
fn source_usable(path: &Path) -> bool {
    use nix::sys::statfs::{statfs, NFS_SUPER_MAGIC};
    match statfs(path) {
        Ok(fs) => fs.filesystem_type() != NFS_SUPER_MAGIC,
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn source_usable(path: &Path) -> bool {
    path.exists()
}

/// Write a plan as JSONL, one task per line.
///
/// # Errors
///
/// Returns [`SyncError::Io`] on write failure.
pub fn write_plan_jsonl<W: Write>(plan: &TaskPlan, mut out: W) -> Result<()> {
    for task in plan.values() {
        serde_json::to_writer(&mut out, task)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{MapGroup, ObjectGroup};
    use std::collections::HashMap;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn shard(path: &str, size: u64, digest: Option<&str>) -> ProfileFile {
        ProfileFile {
            path: path.to_string(),
            size: Some(size),
            digest: digest.map(String::from),
        }
    }

    fn objects(name: &str, shards: Vec<ProfileFile>) -> Profile {
        let mut profile = Profile::default();
        profile.objects.insert(
            name.to_string(),
            ObjectGroup {
                sharding_bits: 1,
                shards,
            },
        );
        profile
    }

    /// Write a source shard and return (path, full digest, prefix digest).
    fn write_shard(dir: &TempDir, name: &str, data: &[u8], prefix_len: u64) -> (String, String, String) {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        let full = sampled_digest(&path, 0, 0).unwrap().digest;
        let prefix = sampled_digest(&path, 0, prefix_len).unwrap().digest;
        (path.to_string_lossy().into_owned(), full, prefix)
    }

    #[test]
    fn fresh_destination_emits_full_copy() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x11u8; 10_000];
        let (path, full, _) = write_shard(&dir, "blob_0.bin", &data, 1);

        let src = objects("blob", vec![shard(&path, 10_000, None)]);
        let dst = Profile::default();

        let plan = plan(&dst, &src, &PlanOptions::default()).unwrap();
        assert_eq!(plan.len(), 1);
        let task = &plan["blob_0.bin"];
        assert_eq!(task.offset, 0);
        assert_eq!(task.size, 10_000);
        assert_eq!(task.source_digest.as_deref(), Some(full.as_str()));
        assert!(!task.is_append());
        assert_eq!(task.target_path, None);
    }

    #[test]
    fn matching_prefix_emits_append() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..12_000u32).map(|i| (i % 250) as u8).collect();
        let (path, full, prefix) = write_shard(&dir, "blob_0.bin", &data, 10_000);

        let src = objects("blob", vec![shard(&path, 12_000, Some(&full))]);
        let dst = objects("blob", vec![shard("/dst/blob_0.bin", 10_000, Some(&prefix))]);

        let plan = plan(&dst, &src, &PlanOptions::default()).unwrap();
        assert_eq!(plan.len(), 1);
        let task = &plan["blob_0.bin.offset.10000"];
        assert_eq!(task.offset, 10_000);
        assert_eq!(task.size, 2_000);
        assert!(task.is_append());
        assert_eq!(task.target_path.as_deref(), Some("/dst/blob_0.bin"));
        assert_eq!(task.source_digest.as_deref(), Some(full.as_str()));
        assert_eq!(task.target_digest.as_deref(), Some(prefix.as_str()));
    }

    #[test]
    fn mismatched_prefix_emits_full_copy() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x22u8; 12_000];
        let (path, _, _) = write_shard(&dir, "blob_0.bin", &data, 1);

        let src = objects("blob", vec![shard(&path, 12_000, None)]);
        let dst = objects(
            "blob",
            vec![shard("/dst/blob_0.bin", 10_000, Some("0000000000000000"))],
        );

        let plan = plan(&dst, &src, &PlanOptions::default()).unwrap();
        let task = &plan["blob_0.bin"];
        assert_eq!(task.offset, 0);
        assert_eq!(task.size, 12_000);
    }

    #[test]
    fn destination_ahead_emits_full_copy() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x33u8; 500];
        let (path, _, _) = write_shard(&dir, "blob_0.bin", &data, 1);

        let src = objects("blob", vec![shard(&path, 500, None)]);
        let dst = objects("blob", vec![shard("/dst/blob_0.bin", 700, Some("ffffffffffffffff"))]);

        let plan = plan(&dst, &src, &PlanOptions::default()).unwrap();
        let task = &plan["blob_0.bin"];
        assert_eq!(task.offset, 0);
        assert_eq!(task.size, 500);
    }

    #[test]
    fn complete_shard_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..9_000u32).map(|i| (i % 97) as u8).collect();
        let (path, _, prefix) = write_shard(&dir, "blob_0.bin", &data, 9_000);

        let src = objects("blob", vec![shard(&path, 9_000, None)]);
        let dst = objects("blob", vec![shard("/dst/blob_0.bin", 9_000, Some(&prefix))]);

        let plan = plan(&dst, &src, &PlanOptions::default()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn skip_partial_check_never_touches_disk() {
        // Bogus paths: any filesystem access would fail the plan.
        let src = objects(
            "blob",
            vec![shard("/nonexistent/blob_0.bin", 1_000, Some("aaaaaaaaaaaaaaaa"))],
        );
        let dst = objects(
            "blob",
            vec![shard("/dst/blob_0.bin", 400, Some("bbbbbbbbbbbbbbbb"))],
        );

        let opts = PlanOptions {
            skip_partial_digest_check: true,
            ..PlanOptions::default()
        };
        let plan = plan(&dst, &src, &opts).unwrap();
        let task = &plan["blob_0.bin"];
        assert_eq!(task.offset, 0);
        assert_eq!(task.size, 1_000);
        assert_eq!(task.source_digest.as_deref(), Some("aaaaaaaaaaaaaaaa"));
    }

    #[test]
    fn missing_size_is_fatal() {
        let src = objects(
            "blob",
            vec![ProfileFile {
                path: "/src/blob_0.bin".to_string(),
                size: None,
                digest: None,
            }],
        );
        let err = plan(&Profile::default(), &src, &PlanOptions::default()).unwrap_err();
        assert!(matches!(err, SyncError::MissingSize { .. }));
    }

    #[test]
    fn shard_count_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (path, _, _) = write_shard(&dir, "blob_0.bin", &[1u8; 10], 1);
        let src = objects("blob", vec![shard(&path, 10, None)]);
        let dst = objects(
            "blob",
            vec![
                shard("/dst/blob_0.bin", 10, None),
                shard("/dst/blob_1.bin", 10, None),
            ],
        );
        let err = plan(&dst, &src, &PlanOptions::default()).unwrap_err();
        assert!(matches!(err, SyncError::ProfileParse(_)));
    }

    #[test]
    fn newer_map_version_copies_shards_and_larges() {
        let dir = TempDir::new().unwrap();
        let (p0, _, _) = write_shard(&dir, "mapFullU.0.tch", &[9u8; 2_000], 1);
        let (p1, _, _) = write_shard(&dir, "mapFullU.large.bin", &[8u8; 3_000], 1);

        let mut larges = HashMap::new();
        larges.insert("k".to_string(), shard(&p1, 3_000, None));
        let mut src = Profile::default();
        src.maps.insert(
            "map".to_string(),
            MapGroup {
                version: "U".to_string(),
                sharding_bits: 1,
                shards: vec![shard(&p0, 2_000, None)],
                larges,
                dtypes: vec![],
            },
        );

        let mut dst = Profile::default();
        dst.maps.insert(
            "map".to_string(),
            MapGroup {
                version: "R".to_string(),
                sharding_bits: 1,
                shards: vec![shard("/dst/mapFullR.0.tch", 1_500, None)],
                larges: HashMap::new(),
                dtypes: vec![],
            },
        );

        let plan = plan(&dst, &src, &PlanOptions::default()).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.contains_key("mapFullU.0.tch"));
        assert!(plan.contains_key("mapFullU.large.bin"));
        assert!(plan.values().all(|t| !t.is_append()));
    }

    #[test]
    fn same_map_version_emits_nothing() {
        let mut src = Profile::default();
        src.maps.insert(
            "map".to_string(),
            MapGroup {
                version: "R".to_string(),
                sharding_bits: 1,
                shards: vec![shard("/src/mapFullR.0.tch", 2_000, None)],
                larges: HashMap::new(),
                dtypes: vec![],
            },
        );
        let dst = src.clone();
        let plan = plan(&dst, &src, &PlanOptions::default()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn local_only_drops_missing_sources() {
        let src = objects(
            "blob",
            vec![shard("/nonexistent/blob_0.bin", 1_000, Some("aaaaaaaaaaaaaaaa"))],
        );
        let opts = PlanOptions {
            skip_partial_digest_check: true,
            local_only: true,
            ..PlanOptions::default()
        };
        let plan = plan(&Profile::default(), &src, &opts).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn remap_rule_rewrites_matching_host() {
        let remap = HostRemap {
            rules: vec![RemapRule {
                host: "node8".to_string(),
                prefix: "/node8_data".to_string(),
                replacement: "/mnt/array/data".to_string(),
            }],
        };
        assert_eq!(
            remap.apply("node8.cluster.example.edu", "/node8_data/blob_0.bin"),
            "/mnt/array/data/blob_0.bin"
        );
        // Other hosts pass through.
        assert_eq!(
            remap.apply("node3.cluster.example.edu", "/node8_data/blob_0.bin"),
            "/node8_data/blob_0.bin"
        );
    }

    #[test]
    fn remap_default_strips_host_prefix() {
        let remap = HostRemap::default();
        assert_eq!(
            remap.apply("node3", "/node3_data/blob_0.bin"),
            "/data/blob_0.bin"
        );
        assert_eq!(remap.apply("node3", "/other/blob_0.bin"), "/other/blob_0.bin");
    }

    #[test]
    fn plan_jsonl_roundtrip() {
        let mut tasks = TaskPlan::new();
        tasks.insert(
            "a.bin".to_string(),
            SyncTask {
                virtual_name: "a.bin".to_string(),
                source_path: "/src/a.bin".to_string(),
                offset: 0,
                size: 10,
                target_path: None,
                source_digest: Some("aaaaaaaaaaaaaaaa".to_string()),
                target_digest: None,
            },
        );
        let mut buf = Vec::new();
        write_plan_jsonl(&tasks, &mut buf).unwrap();
        let line = String::from_utf8(buf).unwrap();
        let back: SyncTask = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(&back, &tasks["a.bin"]);
    }
}
