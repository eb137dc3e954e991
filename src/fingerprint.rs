//! Streaming MD5 fingerprinting with token-gated throughput control.
//!
//! Fingerprints are the 128-bit MD5 digest of a file's contents, encoded as
//! 22 characters of unpadded base64. They identify content, nothing more;
//! collision reports are surfaced by the duplicate engine rather than trusted
//! silently.
//!
//! The service maintains two independent pools: a CPU pool gating the hash
//! loop and an I/O pool gating `stat`/`open`. Both acquisitions observe the
//! shutdown signal, so a call parked behind saturated pools returns
//! [`FingerprintError::Shutdown`] without starting work.

use crate::shutdown::Shutdown;
use crate::tokens::{TokenError, TokenPool};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Length of the base64-encoded fingerprint.
pub const CHECKSUM_LEN: usize = 22;

/// Default number of concurrent hash loops.
pub const DEFAULT_CPU_TOKENS: usize = 2;
/// Default number of concurrent `stat`/`open` calls.
pub const DEFAULT_IO_TOKENS: usize = 16;

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("not a regular file: {0}")]
    NotRegularFile(PathBuf),
    #[error("shutdown requested")]
    Shutdown,
}

impl From<TokenError> for FingerprintError {
    fn from(_: TokenError) -> Self {
        FingerprintError::Shutdown
    }
}

/// Progress callback invoked once per buffer of data read. The first argument
/// is the number of bytes read *since the previous call*; callers accumulate.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, Instant);

/// Computes file fingerprints under bounded CPU and I/O concurrency.
///
/// Cheap to clone; clones share the same token pools.
#[derive(Clone)]
pub struct FingerprintService {
    cpu: TokenPool,
    io: TokenPool,
}

impl Default for FingerprintService {
    fn default() -> Self {
        Self::new(DEFAULT_CPU_TOKENS, DEFAULT_IO_TOKENS)
    }
}

impl FingerprintService {
    pub fn new(cpu_tokens: usize, io_tokens: usize) -> Self {
        FingerprintService {
            cpu: TokenPool::new(cpu_tokens),
            io: TokenPool::new(io_tokens),
        }
    }

    /// Compute the fingerprint of a regular file.
    pub fn compute(&self, path: &Path, shutdown: &Shutdown) -> Result<String, FingerprintError> {
        self.compute_inner(path, shutdown, None)
    }

    /// Like [`compute`](Self::compute), reporting progress per buffer read.
    pub fn compute_with_progress(
        &self,
        path: &Path,
        shutdown: &Shutdown,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<String, FingerprintError> {
        self.compute_inner(path, shutdown, progress)
    }

    fn compute_inner(
        &self,
        path: &Path,
        shutdown: &Shutdown,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<String, FingerprintError> {
        // stat and open are gated by the I/O pool; the token is released
        // before the hash loop starts so slow hashing does not starve other
        // callers of open slots.
        let file = {
            let _io_token = self.io.acquire(shutdown)?;

            let metadata = std::fs::metadata(path).map_err(|e| io_error(e, path))?;
            if !metadata.is_file() {
                return Err(FingerprintError::NotRegularFile(path.to_path_buf()));
            }

            File::open(path).map_err(|e| io_error(e, path))?
        };

        let _cpu_token = self.cpu.acquire(shutdown)?;

        let mut file = file;
        let mut hasher = Md5::new();
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            let bytes_read = file.read(&mut buffer).map_err(FingerprintError::Io)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            if let Some(cb) = progress.as_mut() {
                cb(bytes_read as u64, Instant::now());
            }
        }

        Ok(encode_digest(&hasher.finalize()))
    }
}

fn encode_digest(digest: &[u8]) -> String {
    STANDARD_NO_PAD.encode(digest)
}

fn io_error(e: std::io::Error, path: &Path) -> FingerprintError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        FingerprintError::PermissionDenied(path.to_path_buf())
    } else {
        FingerprintError::Io(e)
    }
}
