//! Compressed byte streams.
//!
//! Two flavors are provided:
//!
//! * [`Compressor`] and [`read_compressed`] work on top of an already
//!   open, block structured sink or source. They are used for the data
//!   blocks embedded in custom format archives, where each compressed
//!   chunk is stored length prefixed and a zero length marks the end of
//!   a block.
//!
//! * [`CompressFileHandle`] wraps a whole file (or stdin/stdout). The
//!   compression algorithm is selected by the file name suffix.

use std::path::{Path, PathBuf};

use pgarch_api_types::CompressionAlgorithm;

mod compressor;
pub use compressor::*;

mod file;
pub use file::*;

/// Buffer size used for compressed output and for reading.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 4096;

/// Order in which suffixes are probed when opening a file for reading.
pub const PROBE_ORDER: [CompressionAlgorithm; 4] = [
    CompressionAlgorithm::None,
    CompressionAlgorithm::Gzip,
    CompressionAlgorithm::Lz4,
    CompressionAlgorithm::Zstd,
];

/// Append the canonical suffix of `algorithm` to `path`.
pub fn suffixed_path<P: AsRef<Path>>(path: P, algorithm: CompressionAlgorithm) -> PathBuf {
    let path = path.as_ref();
    match algorithm.suffix() {
        None => path.to_owned(),
        Some(suffix) => {
            let mut name = path.as_os_str().to_owned();
            name.push(".");
            name.push(suffix);
            PathBuf::from(name)
        }
    }
}

/// Guess the compression of an existing file from its name.
pub fn algorithm_from_path<P: AsRef<Path>>(path: P) -> CompressionAlgorithm {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(CompressionAlgorithm::from_suffix)
        .unwrap_or(CompressionAlgorithm::None)
}

/// Find the file backing `path`, trying the bare name first and then
/// each known suffix.
///
/// Returns the path that exists together with its compression.
pub fn probe_path<P: AsRef<Path>>(path: P) -> Option<(PathBuf, CompressionAlgorithm)> {
    let path = path.as_ref();
    for algorithm in PROBE_ORDER {
        let candidate = suffixed_path(path, algorithm);
        if candidate.exists() {
            let algorithm = match algorithm {
                CompressionAlgorithm::None => algorithm_from_path(&candidate),
                other => other,
            };
            return Some((candidate, algorithm));
        }
    }
    None
}
