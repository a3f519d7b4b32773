//! Offset-view virtual filesystem.
//!
//! Re-presents arbitrary `(source_path, offset, size)` windows as a flat
//! read-only (or read-write) directory of ordinary files, so a generic
//! object-store sync tool can pick the windows up as independent objects.
//!
//! FUSE callbacks are synchronous and stateless: every operation looks the
//! window up, opens the underlying source lazily, performs one positional
//! read or write, and closes it. The window map is frozen at mount time; a
//! read/write lock guards it anyway so lookups stay cheap and any future
//! reconfiguration path stays sound.

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, EACCES, EIO, ENOENT, ENOSPC};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// Attribute cache TTL handed to the kernel.
const TTL: Duration = Duration::from_secs(1);

/// Inode of the mount root.
const ROOT_INO: u64 = 1;

/// One line of the JSONL mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Flat name exposed in the mount root. No path separators.
    pub virtual_path: String,
    /// Underlying file the window maps into.
    pub source_path: String,
    /// Window start within the source file.
    #[serde(default)]
    pub offset: i64,
    /// Window length; `0` maps to the end of the source file.
    #[serde(default)]
    pub size: i64,
    /// Force this entry read-only even on a read-write mount.
    #[serde(default)]
    pub read_only: bool,
}

/// A validated window into a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Flat name exposed in the mount root.
    pub virtual_path: String,
    /// Underlying file the window maps into.
    pub source_path: PathBuf,
    /// Window start within the source file.
    pub offset: u64,
    /// Window length; `0` maps to the end of the source file.
    pub size: u64,
    /// Entry-level read-only flag.
    pub read_only: bool,
}

impl Window {
    /// Size reported for this window given the source file's current size.
    #[must_use]
    pub fn reported_size(&self, file_size: u64) -> u64 {
        match (self.offset, self.size) {
            (0, 0) => file_size,
            (0, s) => file_size.min(s),
            (o, 0) => file_size.saturating_sub(o),
            (o, s) => file_size.saturating_sub(o).min(s),
        }
    }

    /// Read up to `want` bytes at window-relative offset `rel_off`.
    ///
    /// Short reads and reads starting past the virtual end return an empty
    /// buffer, never an error.
    fn read_at(&self, rel_off: u64, want: usize) -> std::result::Result<Vec<u8>, c_int> {
        let file = fs::File::open(&self.source_path).map_err(|e| {
            debug!(path = %self.source_path.display(), error = %e, "Source open failed");
            EIO
        })?;
        let file_size = file.metadata().map_err(|_| EIO)?.len();

        let abs_off = self.offset + rel_off;
        let mut max = want as u64;
        if self.size > 0 {
            let Some(remaining) = self.size.checked_sub(rel_off) else {
                return Ok(Vec::new());
            };
            max = max.min(remaining);
        }
        if abs_off >= file_size {
            return Ok(Vec::new());
        }
        max = max.min(file_size - abs_off);

        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; max as usize];
        file.read_exact_at(&mut buf, abs_off).map_err(|e| {
            debug!(path = %self.source_path.display(), error = %e, "Source read failed");
            EIO
        })?;
        Ok(buf)
    }

    /// Write `data` at window-relative offset `rel_off`, creating the source
    /// file (and parents) when absent.
    ///
    /// Data reaching past a bounded window is truncated; a write starting at
    /// or past the window end is `ENOSPC`. The file is extended before the
    /// positional write so sparse gaps are well-defined.
    fn write_at(&self, rel_off: u64, data: &[u8]) -> std::result::Result<usize, c_int> {
        if let Some(parent) = self.source_path.parent() {
            fs::create_dir_all(parent).map_err(|_| EIO)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.source_path)
            .map_err(|e| {
                debug!(path = %self.source_path.display(), error = %e, "Source open for write failed");
                EIO
            })?;

        let mut data = data;
        if self.size > 0 {
            let allowed = self.size.saturating_sub(rel_off);
            if allowed == 0 {
                return Err(ENOSPC);
            }
            #[allow(clippy::cast_possible_truncation)]
            let allowed = allowed.min(data.len() as u64) as usize;
            data = &data[..allowed];
        }

        let abs_off = self.offset + rel_off;
        let end = abs_off + data.len() as u64;
        let file_size = file.metadata().map_err(|_| EIO)?.len();
        if end > file_size {
            file.set_len(end).map_err(|_| EIO)?;
        }
        file.write_all_at(data, abs_off).map_err(|e| {
            debug!(path = %self.source_path.display(), error = %e, "Source write failed");
            EIO
        })?;
        Ok(data.len())
    }
}

/// Validate one configuration line and convert it to a [`Window`].
///
/// # Errors
///
/// Returns [`SyncError::MountConfig`] on an empty name or source, a name
/// containing a path separator, or a negative offset/size.
#[allow(clippy::cast_sign_loss)]
pub fn validate_config(config: &WindowConfig, line: usize) -> Result<Window> {
    let reject = |reason: String| SyncError::MountConfig { line, reason };
    if config.virtual_path.is_empty() {
        return Err(reject("virtual_path cannot be empty".into()));
    }
    if config.virtual_path.contains('/') || config.virtual_path.contains('\\') {
        return Err(reject(format!(
            "virtual_path cannot contain path separators: {}",
            config.virtual_path
        )));
    }
    if config.source_path.is_empty() {
        return Err(reject("source_path cannot be empty".into()));
    }
    if config.offset < 0 {
        return Err(reject(format!("offset cannot be negative: {}", config.offset)));
    }
    if config.size < 0 {
        return Err(reject(format!("size cannot be negative: {}", config.size)));
    }
    Ok(Window {
        virtual_path: config.virtual_path.clone(),
        source_path: PathBuf::from(&config.source_path),
        offset: config.offset as u64,
        size: config.size as u64,
        read_only: config.read_only,
    })
}

/// Parse a newline-delimited JSON mount configuration.
///
/// Empty lines and lines starting with `#` or `//` are skipped. Duplicate
/// virtual paths and invalid entries are fatal.
///
/// # Errors
///
/// Returns [`SyncError::MountConfig`] naming the offending line.
pub fn parse_window_configs(text: &str) -> Result<FxHashMap<String, Window>> {
    let mut windows = FxHashMap::default();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let config: WindowConfig =
            serde_json::from_str(line).map_err(|e| SyncError::MountConfig {
                line: line_no,
                reason: e.to_string(),
            })?;
        let window = validate_config(&config, line_no)?;
        if windows.contains_key(&window.virtual_path) {
            return Err(SyncError::MountConfig {
                line: line_no,
                reason: format!("duplicate virtual_path: {}", window.virtual_path),
            });
        }
        windows.insert(window.virtual_path.clone(), window);
    }
    if windows.is_empty() {
        return Err(SyncError::MountConfig {
            line: 0,
            reason: "no valid entries in mount configuration".into(),
        });
    }
    Ok(windows)
}

/// Load and parse a JSONL mount configuration file.
///
/// # Errors
///
/// Returns [`SyncError::Io`] if the file cannot be read, otherwise as
/// [`parse_window_configs`].
pub fn load_window_configs(path: &Path) -> Result<FxHashMap<String, Window>> {
    let text = fs::read_to_string(path)?;
    parse_window_configs(&text)
}

/// The offset-view filesystem.
pub struct OffsetFs {
    windows: Arc<RwLock<FxHashMap<String, Window>>>,
    /// Sorted names; `names[i]` owns inode `i + 2`.
    names: Vec<String>,
    read_only: bool,
    uid: u32,
    gid: u32,
}

impl OffsetFs {
    /// Build a filesystem over a frozen window map.
    #[must_use]
    pub fn new(windows: FxHashMap<String, Window>, read_only: bool) -> Self {
        let mut names: Vec<String> = windows.keys().cloned().collect();
        names.sort();
        Self {
            windows: Arc::new(RwLock::new(windows)),
            names,
            read_only,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn name_of(&self, ino: u64) -> Option<&str> {
        let idx = ino.checked_sub(2)?;
        self.names.get(usize::try_from(idx).ok()?).map(String::as_str)
    }

    fn ino_of(&self, name: &str) -> Option<u64> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok().map(|i| i as u64 + 2)
    }

    fn window(&self, ino: u64) -> Option<Window> {
        let name = self.name_of(ino)?;
        self.windows.read().ok()?.get(name).cloned()
    }

    fn entry_read_only(&self, window: &Window) -> bool {
        self.read_only || window.read_only
    }

    fn root_attr(&self) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(&self, ino: u64, window: &Window) -> FileAttr {
        let perm = if self.entry_read_only(window) { 0o444 } else { 0o644 };
        let (size, mtime) = match fs::metadata(&window.source_path) {
            Ok(meta) => {
                let mtime = meta.modified().unwrap_or_else(|_| SystemTime::now());
                (window.reported_size(meta.len()), mtime)
            }
            // Missing source: zero-length entry, current timestamps. It may
            // be created on first write.
            Err(_) => (0, SystemTime::now()),
        };
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::RegularFile,
            perm,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for OffsetFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        match self.ino_of(name) {
            Some(ino) => match self.window(ino) {
                Some(window) => reply.entry(&TTL, &self.file_attr(ino, &window), 0),
                None => reply.error(ENOENT),
            },
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &self.root_attr());
            return;
        }
        match self.window(ino) {
            Some(window) => reply.attr(&TTL, &self.file_attr(ino, &window)),
            None => reply.error(ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(window) = self.window(ino) else {
            reply.error(ENOENT);
            return;
        };
        // Size changes would break the window arithmetic underneath the
        // uploader; never allowed.
        if size.is_some() {
            reply.error(EACCES);
            return;
        }
        if atime.is_some() || mtime.is_some() {
            if self.entry_read_only(&window) {
                reply.error(EACCES);
                return;
            }
            let resolve = |t: Option<TimeOrNow>| match t {
                Some(TimeOrNow::SpecificTime(t)) => Some(t),
                Some(TimeOrNow::Now) => Some(SystemTime::now()),
                None => None,
            };
            let now = SystemTime::now();
            let atime = filetime::FileTime::from_system_time(resolve(atime).unwrap_or(now));
            let mtime = filetime::FileTime::from_system_time(resolve(mtime).unwrap_or(now));
            if let Err(e) = filetime::set_file_times(&window.source_path, atime, mtime) {
                debug!(path = %window.source_path.display(), error = %e, "Timestamp update failed");
                reply.error(EIO);
                return;
            }
        }
        reply.attr(&TTL, &self.file_attr(ino, &window));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(window) = self.window(ino) else {
            reply.error(ENOENT);
            return;
        };
        let wants_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        if wants_write && self.entry_read_only(&window) {
            reply.error(EACCES);
            return;
        }
        match fs::metadata(&window.source_path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Created on first write in read-write mode.
                if self.entry_read_only(&window) {
                    reply.error(ENOENT);
                    return;
                }
            }
            Err(_) => {
                reply.error(EIO);
                return;
            }
        }
        // Stateless: no per-file handle kept.
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(window) = self.window(ino) else {
            reply.error(ENOENT);
            return;
        };
        #[allow(clippy::cast_sign_loss)]
        let rel_off = offset.max(0) as u64;
        match window.read_at(rel_off, size as usize) {
            Ok(buf) => reply.data(&buf),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(window) = self.window(ino) else {
            reply.error(ENOENT);
            return;
        };
        if self.entry_read_only(&window) {
            reply.error(EACCES);
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        let rel_off = offset.max(0) as u64;
        match window.write_at(rel_off, data) {
            #[allow(clippy::cast_possible_truncation)]
            Ok(written) => reply.written(written as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            reply.error(ENOENT);
            return;
        }
        let mut entries: Vec<(u64, FileType, &str)> = vec![
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
        ];
        for (i, name) in self.names.iter().enumerate() {
            entries.push((i as u64 + 2, FileType::RegularFile, name));
        }
        #[allow(clippy::cast_sign_loss)]
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            #[allow(clippy::cast_possible_wrap)]
            if reply.add(ino, i as i64 + 1, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// A mounted offset-view filesystem; dropping the handle unmounts it.
pub struct MountHandle {
    session: BackgroundSession,
    mountpoint: PathBuf,
}

impl MountHandle {
    /// Unmount explicitly, consuming the handle.
    pub fn unmount(self) {
        info!(mountpoint = %self.mountpoint.display(), "Unmounting offset filesystem");
        self.session.join();
    }
}

fn mount_options(read_only: bool, allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("shardsync".to_string()),
        MountOption::DefaultPermissions,
    ];
    if read_only {
        options.push(MountOption::RO);
    }
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Mount in the background; returns once the kernel session is live.
///
/// # Errors
///
/// Returns [`SyncError::Io`] if the mount fails.
pub fn mount_background(
    windows: FxHashMap<String, Window>,
    mountpoint: &Path,
    read_only: bool,
    allow_other: bool,
) -> Result<MountHandle> {
    let fs = OffsetFs::new(windows, read_only);
    info!(
        mountpoint = %mountpoint.display(),
        entries = fs.names.len(),
        read_only,
        "Mounting offset filesystem"
    );
    let session = fuser::spawn_mount2(fs, mountpoint, &mount_options(read_only, allow_other))?;
    Ok(MountHandle {
        session,
        mountpoint: mountpoint.to_path_buf(),
    })
}

/// Mount on the calling thread; blocks until the kernel signals unmount.
///
/// # Errors
///
/// Returns [`SyncError::Io`] if the mount fails.
pub fn mount_blocking(
    windows: FxHashMap<String, Window>,
    mountpoint: &Path,
    read_only: bool,
    allow_other: bool,
) -> Result<()> {
    let fs = OffsetFs::new(windows, read_only);
    info!(
        mountpoint = %mountpoint.display(),
        entries = fs.names.len(),
        read_only,
        "Mounting offset filesystem (foreground)"
    );
    fuser::mount2(fs, mountpoint, &mount_options(read_only, allow_other))?;
    Ok(())
}

/// Best-effort lazy unmount of a possibly stale mount.
pub fn lazy_unmount(mountpoint: &Path) {
    match Command::new("fusermount").arg("-uz").arg(mountpoint).status() {
        Ok(status) if status.success() => {
            debug!(mountpoint = %mountpoint.display(), "Cleared stale mount");
        }
        Ok(_) => {}
        Err(e) => {
            debug!(mountpoint = %mountpoint.display(), error = %e, "fusermount not available");
        }
    }
}

/// Create the mount point directory and clear any stale mount at it.
///
/// # Errors
///
/// Returns [`SyncError::Io`] if the directory cannot be created.
pub fn prepare_mountpoint(mountpoint: &Path) -> Result<()> {
    if mountpoint.exists() {
        lazy_unmount(mountpoint);
    } else {
        fs::create_dir_all(mountpoint)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn window(offset: u64, size: u64, source: &Path) -> Window {
        Window {
            virtual_path: "w".to_string(),
            source_path: source.to_path_buf(),
            offset,
            size,
            read_only: false,
        }
    }

    fn write_source(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    // ==========================================================================
    // REPORTED SIZE TABLE
    // ==========================================================================

    #[test]
    fn reported_size_whole_file() {
        let w = window(0, 0, Path::new("/unused"));
        assert_eq!(w.reported_size(1234), 1234);
    }

    #[test]
    fn reported_size_bounded_from_start() {
        let w = window(0, 100, Path::new("/unused"));
        assert_eq!(w.reported_size(1234), 100);
        assert_eq!(w.reported_size(60), 60);
    }

    #[test]
    fn reported_size_offset_to_end() {
        let w = window(100, 0, Path::new("/unused"));
        assert_eq!(w.reported_size(1234), 1134);
        assert_eq!(w.reported_size(50), 0);
    }

    #[test]
    fn reported_size_offset_and_bound() {
        let w = window(10, 20, Path::new("/unused"));
        assert_eq!(w.reported_size(100), 20);
        assert_eq!(w.reported_size(15), 5);
        assert_eq!(w.reported_size(5), 0);
    }

    // ==========================================================================
    // READ WINDOW
    // ==========================================================================

    #[test]
    fn read_returns_window_bytes() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let src = write_source(&dir, "src.bin", &data);
        let w = window(10, 20, &src);

        let buf = w.read_at(0, 20).unwrap();
        assert_eq!(buf, &data[10..30]);
    }

    #[test]
    fn read_clamps_to_window_end() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let src = write_source(&dir, "src.bin", &data);
        let w = window(10, 20, &src);

        let buf = w.read_at(15, 100).unwrap();
        assert_eq!(buf, &data[25..30]);
    }

    #[test]
    fn read_clamps_to_short_source() {
        // Window (offset=10, size=20) over a 15-byte source: reported size is
        // 5; a read at rel offset 3 of length 100 returns source bytes 13-14.
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..15u8).collect();
        let src = write_source(&dir, "src.bin", &data);
        let w = window(10, 20, &src);

        assert_eq!(w.reported_size(15), 5);
        let buf = w.read_at(3, 100).unwrap();
        assert_eq!(buf, &data[13..15]);
    }

    #[test]
    fn read_past_virtual_end_is_empty() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..15u8).collect();
        let src = write_source(&dir, "src.bin", &data);
        let w = window(10, 20, &src);

        assert!(w.read_at(5, 10).unwrap().is_empty());
        assert!(w.read_at(25, 10).unwrap().is_empty());
    }

    #[test]
    fn read_whole_file_window_passes_offsets_through() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..50u8).collect();
        let src = write_source(&dir, "src.bin", &data);
        let w = window(0, 0, &src);

        let buf = w.read_at(40, 100).unwrap();
        assert_eq!(buf, &data[40..50]);
    }

    #[test]
    fn read_missing_source_is_eio() {
        let w = window(0, 0, Path::new("/nonexistent/src.bin"));
        assert_eq!(w.read_at(0, 10).unwrap_err(), EIO);
    }

    // ==========================================================================
    // WRITE WINDOW
    // ==========================================================================

    #[test]
    fn write_lands_at_window_offset() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", &[0u8; 40]);
        let w = window(10, 20, &src);

        let written = w.write_at(2, b"abc").unwrap();
        assert_eq!(written, 3);
        let content = fs::read(&src).unwrap();
        assert_eq!(&content[12..15], b"abc");
    }

    #[test]
    fn write_truncated_at_window_end() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", &[0u8; 40]);
        let w = window(10, 4, &src);

        let written = w.write_at(2, b"abcdef").unwrap();
        assert_eq!(written, 2);
        let content = fs::read(&src).unwrap();
        assert_eq!(&content[12..14], b"ab");
        assert_eq!(content[14], 0);
    }

    #[test]
    fn write_past_window_end_is_enospc() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", &[0u8; 40]);
        let w = window(10, 4, &src);
        assert_eq!(w.write_at(4, b"x").unwrap_err(), ENOSPC);
    }

    #[test]
    fn write_extends_file_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("deep/nested/out.bin");
        let w = window(100, 0, &src);

        let written = w.write_at(0, b"tail").unwrap();
        assert_eq!(written, 4);
        let content = fs::read(&src).unwrap();
        assert_eq!(content.len(), 104);
        assert_eq!(&content[100..], b"tail");
        // Sparse gap reads back as zeroes.
        assert!(content[..100].iter().all(|&b| b == 0));
    }

    // ==========================================================================
    // CONFIG PARSING
    // ==========================================================================

    #[test]
    fn parse_skips_comments_and_blanks() {
        let text = r#"
# comment
// another comment

{"virtual_path": "a.bin", "source_path": "/src/a.bin", "offset": 0, "size": 10}
{"virtual_path": "b.bin", "source_path": "/src/b.bin", "offset": 5, "size": 0, "read_only": true}
"#;
        let windows = parse_window_configs(text).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows["a.bin"].size, 10);
        assert!(windows["b.bin"].read_only);
    }

    #[test]
    fn parse_rejects_duplicates() {
        let text = r#"
{"virtual_path": "a.bin", "source_path": "/src/a.bin"}
{"virtual_path": "a.bin", "source_path": "/src/other.bin"}
"#;
        let err = parse_window_configs(text).unwrap_err();
        assert!(matches!(err, SyncError::MountConfig { line: 3, .. }));
    }

    #[test]
    fn parse_rejects_separators_in_name() {
        let text = r#"{"virtual_path": "a/b.bin", "source_path": "/src/a.bin"}"#;
        assert!(matches!(
            parse_window_configs(text).unwrap_err(),
            SyncError::MountConfig { .. }
        ));
    }

    #[test]
    fn parse_rejects_negative_offset() {
        let text = r#"{"virtual_path": "a.bin", "source_path": "/s", "offset": -1}"#;
        assert!(matches!(
            parse_window_configs(text).unwrap_err(),
            SyncError::MountConfig { .. }
        ));
    }

    #[test]
    fn parse_rejects_empty_stream() {
        assert!(matches!(
            parse_window_configs("# nothing here\n").unwrap_err(),
            SyncError::MountConfig { .. }
        ));
    }

    // ==========================================================================
    // INODE TABLE
    // ==========================================================================

    #[test]
    fn inode_mapping_is_stable_and_sorted() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", &[0u8; 10]);
        let mut windows = FxHashMap::default();
        for name in ["zeta.bin", "alpha.bin", "mid.bin"] {
            let mut w = window(0, 0, &src);
            w.virtual_path = name.to_string();
            windows.insert(name.to_string(), w);
        }
        let fs = OffsetFs::new(windows, true);
        assert_eq!(fs.name_of(2), Some("alpha.bin"));
        assert_eq!(fs.name_of(3), Some("mid.bin"));
        assert_eq!(fs.name_of(4), Some("zeta.bin"));
        assert_eq!(fs.ino_of("zeta.bin"), Some(4));
        assert_eq!(fs.ino_of("missing.bin"), None);
        assert_eq!(fs.name_of(1), None);
        assert_eq!(fs.name_of(99), None);
    }

    #[test]
    fn file_attr_reflects_window_and_mode() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", &[0u8; 100]);
        let mut windows = FxHashMap::default();
        let mut w = window(10, 20, &src);
        w.virtual_path = "w.bin".to_string();
        windows.insert("w.bin".to_string(), w.clone());

        let ro = OffsetFs::new(windows.clone(), true);
        let attr = ro.file_attr(2, &w);
        assert_eq!(attr.size, 20);
        assert_eq!(attr.perm, 0o444);
        assert_eq!(attr.kind, FileType::RegularFile);

        let rw = OffsetFs::new(windows, false);
        assert_eq!(rw.file_attr(2, &w).perm, 0o644);
    }

    #[test]
    fn file_attr_missing_source_is_empty() {
        let w = window(0, 0, Path::new("/nonexistent/src.bin"));
        let mut windows = FxHashMap::default();
        windows.insert("w".to_string(), w.clone());
        let fs = OffsetFs::new(windows, false);
        assert_eq!(fs.file_attr(2, &w).size, 0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Reported size never exceeds the configured bound or the bytes
        /// available past the offset.
        #[test]
        fn reported_size_bounds(
            offset in 0u64..10_000,
            size in 0u64..10_000,
            file_size in 0u64..20_000
        ) {
            let w = Window {
                virtual_path: "w".into(),
                source_path: PathBuf::from("/unused"),
                offset,
                size,
                read_only: true,
            };
            let reported = w.reported_size(file_size);
            prop_assert!(reported <= file_size.saturating_sub(offset).max(file_size * u64::from(offset == 0)));
            if size > 0 {
                prop_assert!(reported <= size);
            }
            prop_assert!(offset + reported <= file_size.max(offset));
        }
    }
}
