//! File-move / append reconciler.
//!
//! Atomically places a downloaded artifact at its final destination, either
//! overwriting or appending, with digest and size verification. The source
//! file is removed only after the destination is verified; a failed append
//! rolls the destination back to its pre-append length. An advisory
//! whole-file lock on the destination serializes concurrent placements.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, error, info};

use crate::digest::sampled_digest;
use crate::error::{Result, SyncError};

/// How the artifact lands at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Truncate the destination and copy whole.
    Overwrite,
    /// Append to the destination's current end.
    Append,
}

/// Copy buffer size.
const COPY_BUF: usize = 64 * 1024;

/// Interval between progress lines.
const PROGRESS_TICK: Duration = Duration::from_secs(10);

/// Move `src` into `dst`, verifying and cleaning up.
///
/// In [`CopyMode::Overwrite`] with a digest given, the *source* is verified
/// before any byte moves. In [`CopyMode::Append`], the destination size is
/// checked against `expected_dst_size` before the copy and the destination
/// digest against `expected_digest` after it; a post-check mismatch
/// truncates the destination back to its pre-append length.
///
/// On success `dst` holds the intended bytes and `src` is removed. On any
/// failure `src` is left in place.
///
/// # Errors
///
/// [`SyncError::SourceMissing`], [`SyncError::NotARegularFile`],
/// [`SyncError::DigestPrecheck`], [`SyncError::DestSizePrecheck`],
/// [`SyncError::DigestPostcheck`], or [`SyncError::Io`].
pub fn move_file(
    src: &Path,
    dst: &Path,
    mode: CopyMode,
    expected_digest: Option<&str>,
    expected_dst_size: Option<u64>,
) -> Result<()> {
    let src_meta = match fs::metadata(src) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyncError::SourceMissing(src.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if !src_meta.is_file() {
        return Err(SyncError::NotARegularFile(src.to_path_buf()));
    }
    let src_size = src_meta.len();

    if mode == CopyMode::Overwrite {
        if let Some(expected) = expected_digest {
            let actual = sampled_digest(src, 0, 0)?;
            if actual.digest != expected {
                return Err(SyncError::DigestPrecheck {
                    expected: expected.to_string(),
                    actual: actual.digest,
                });
            }
        }
    }

    // Exclusive advisory lock on the destination for the full placement.
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dst)?;
    lock_file.lock_exclusive()?;
    let result = locked_move(src, dst, mode, expected_digest, expected_dst_size, src_size);
    let _ = fs2::FileExt::unlock(&lock_file);
    result
}

fn locked_move(
    src: &Path,
    dst: &Path,
    mode: CopyMode,
    expected_digest: Option<&str>,
    expected_dst_size: Option<u64>,
    src_size: u64,
) -> Result<()> {
    let mut dst_file = match mode {
        CopyMode::Overwrite => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dst)?,
        CopyMode::Append => OpenOptions::new().append(true).create(true).open(dst)?,
    };

    let pre_size = dst_file.metadata()?.len();
    if mode == CopyMode::Append {
        if let Some(expected) = expected_dst_size {
            if pre_size != expected {
                return Err(SyncError::DestSizePrecheck {
                    expected: i64::try_from(expected).unwrap_or(i64::MAX),
                    actual: i64::try_from(pre_size).unwrap_or(i64::MAX),
                });
            }
        }
    }

    let written = copy_with_progress(src, &mut dst_file, src_size)?;
    if written != src_size {
        return Err(SyncError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("copied {written} bytes, expected {src_size}"),
        )));
    }
    dst_file.sync_all()?;

    if mode == CopyMode::Append {
        if let Some(expected) = expected_digest {
            let actual = sampled_digest(dst, 0, 0)?;
            if actual.digest != expected {
                error!(
                    dest = %dst.display(),
                    expected,
                    actual = %actual.digest,
                    "Append verification failed, rolling back"
                );
                dst_file.set_len(pre_size)?;
                return Err(SyncError::DigestPostcheck {
                    expected: expected.to_string(),
                    actual: actual.digest,
                });
            }
        }
    }

    fs::remove_file(src)?;
    info!(source = %src.display(), dest = %dst.display(), bytes = src_size, "Placed file");
    Ok(())
}

/// Stream `src` into `dst_file`, logging an estimated-remaining line every
/// ten seconds.
fn copy_with_progress(src: &Path, dst_file: &mut File, total: u64) -> Result<u64> {
    let copied = Arc::new(AtomicU64::new(0));
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let ticker = {
        let copied = Arc::clone(&copied);
        let src = src.to_path_buf();
        let started = Instant::now();
        std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(PROGRESS_TICK) {
                Err(RecvTimeoutError::Timeout) => {
                    let done = copied.load(Ordering::Relaxed);
                    let remaining = estimate_remaining(started.elapsed(), done, total);
                    debug!(
                        source = %src.display(),
                        copied = done,
                        total,
                        remaining_secs = remaining.map(|d| d.as_secs()),
                        "Copy in progress"
                    );
                }
                _ => break,
            }
        })
    };

    let mut reader = File::open(src)?;
    let mut buf = vec![0u8; COPY_BUF];
    let mut written = 0u64;
    let copy_result = loop {
        match reader.read(&mut buf) {
            Ok(0) => break Ok(written),
            Ok(n) => {
                if let Err(e) = dst_file.write_all(&buf[..n]) {
                    break Err(e);
                }
                written += n as u64;
                copied.store(written, Ordering::Relaxed);
            }
            Err(e) => break Err(e),
        }
    };

    drop(stop_tx);
    let _ = ticker.join();
    copy_result.map_err(SyncError::Io)
}

/// Estimated time remaining, when the copy rate is measurable.
#[allow(clippy::cast_precision_loss)]
fn estimate_remaining(elapsed: Duration, copied: u64, total: u64) -> Option<Duration> {
    if copied == 0 || total <= copied {
        return None;
    }
    let rate = copied as f64 / elapsed.as_secs_f64().max(0.001);
    let secs = ((total - copied) as f64 / rate).max(0.0);
    Some(Duration::from_secs_f64(secs))
}
