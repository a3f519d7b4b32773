//! Sampled content digest.
//!
//! Computes a cheap, stable 16-hex-character fingerprint over a byte window
//! of a file by hashing a small, size-dependent set of 128-byte probes. The
//! first and last 128 bytes plus a logarithmic sprinkling in between are
//! enough to tell apart shards produced by the dataset build tool while
//! touching only a few kilobytes of a multi-gigabyte file.

use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Files at or below this size are hashed whole (typical ext4 block size).
const FULL_HASH_THRESHOLD: u64 = 4096;

/// Bytes fed to the hash per probe.
const PROBE_LEN: u64 = 128;

/// Result of a sampled digest computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampledDigest {
    /// Size of the considered window in bytes.
    pub size: u64,
    /// 16-character lowercase hex digest.
    pub digest: String,
}

impl fmt::Display for SampledDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.digest)
    }
}

/// Number of bits required to represent `n` (`bit_length(0) == 0`).
pub(crate) fn bit_length(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

/// Probe stride for a window of `effective` bytes.
///
/// Chosen so the number of probes stays small (roughly 2-8) and the stride
/// is a power of two.
fn probe_stride(effective: u64) -> u64 {
    1 << (bit_length(effective / u64::from(bit_length(effective))) + 2)
}

/// Compute the sampled digest of the window `[skip, skip + size)` of `path`.
///
/// A `size` of `0` means "from `skip` to the end of the file". Windows at or
/// below 4 KiB are hashed whole; larger windows are sampled: 128 bytes at
/// the window start, 128 bytes every `probe_stride` bytes, and the final 128
/// bytes of the window.
///
/// # Errors
///
/// Returns [`SyncError::RangeOutOfBounds`] if the window extends past the
/// end of the file, and [`SyncError::Io`] on any read failure (including a
/// missing file).
///
/// # Example
///
/// ```no_run
/// use shardsync::digest::sampled_digest;
///
/// let d = sampled_digest("/data/shard.0.bin".as_ref(), 0, 0)?;
/// assert_eq!(d.digest.len(), 16);
/// # Ok::<(), shardsync::SyncError>(())
/// ```
pub fn sampled_digest(path: &Path, skip: u64, size: u64) -> Result<SampledDigest> {
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();

    let effective = if size == 0 {
        file_size.checked_sub(skip).ok_or(SyncError::RangeOutOfBounds {
            skip,
            size,
            file_size,
        })?
    } else {
        size
    };

    if skip + effective > file_size {
        return Err(SyncError::RangeOutOfBounds {
            skip,
            size: effective,
            file_size,
        });
    }

    let mut hasher = Md5::new();

    if effective <= FULL_HASH_THRESHOLD {
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; effective as usize];
        file.read_exact_at(&mut buf, skip)?;
        hasher.update(&buf);
        return Ok(finish(hasher, effective));
    }

    let stride = probe_stride(effective);
    let num_probes = (effective - 2 * PROBE_LEN) / stride;

    let mut buf = [0u8; PROBE_LEN as usize];
    for i in 0..=num_probes {
        file.read_exact_at(&mut buf, skip + i * stride)?;
        hasher.update(buf);
    }

    file.read_exact_at(&mut buf, skip + effective - PROBE_LEN)?;
    hasher.update(buf);

    Ok(finish(hasher, effective))
}

fn finish(hasher: Md5, size: u64) -> SampledDigest {
    let raw = hasher.finalize();
    let hex: String = raw.iter().fold(String::with_capacity(32), |mut acc, b| {
        use fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    });
    SampledDigest {
        size,
        digest: hex[..16].to_string(),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    proptest! {
        /// The digest is a pure function of the byte window.
        #[test]
        fn deterministic(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
            let mut f = NamedTempFile::new().unwrap();
            f.write_all(&data).unwrap();
            f.flush().unwrap();
            let d1 = sampled_digest(f.path(), 0, 0).unwrap();
            let d2 = sampled_digest(f.path(), 0, 0).unwrap();
            prop_assert_eq!(d1, d2);
        }

        /// A prefix window digests identically on the file and on a copy of
        /// the prefix alone.
        #[test]
        fn prefix_law(
            data in prop::collection::vec(any::<u8>(), 1..30_000),
            frac in 0.1f64..1.0
        ) {
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let k = ((data.len() as f64) * frac) as usize;
            prop_assume!(k > 0);

            let mut whole = NamedTempFile::new().unwrap();
            whole.write_all(&data).unwrap();
            whole.flush().unwrap();

            let mut prefix = NamedTempFile::new().unwrap();
            prefix.write_all(&data[..k]).unwrap();
            prefix.flush().unwrap();

            let dw = sampled_digest(whole.path(), 0, k as u64).unwrap();
            let dp = sampled_digest(prefix.path(), 0, 0).unwrap();
            prop_assert_eq!(dw.digest, dp.digest);
            prop_assert_eq!(dw.size, k as u64);
        }

        /// The reported size is the effective window size.
        #[test]
        fn reported_size(len in 0u64..10_000, skip_frac in 0.0f64..1.0) {
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let skip = ((len as f64) * skip_frac) as u64;
            let data = vec![0x5Au8; len as usize];
            let mut f = NamedTempFile::new().unwrap();
            f.write_all(&data).unwrap();
            f.flush().unwrap();
            let d = sampled_digest(f.path(), skip, 0).unwrap();
            prop_assert_eq!(d.size, len - skip);
        }
    }
}
