use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ApiStringFormat, Schema, StringSchema};

#[api()]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Compression algorithm.
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// Deflate (zlib framing inside data blocks, gzip framing for files).
    Gzip,
    /// LZ4 frame format.
    Lz4,
    /// Zstandard.
    Zstd,
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::None
    }
}

impl CompressionAlgorithm {
    /// Canonical file name suffix (without the dot).
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Gzip => Some("gz"),
            CompressionAlgorithm::Lz4 => Some("lz4"),
            CompressionAlgorithm::Zstd => Some("zst"),
        }
    }

    /// Reverse of [`suffix`](Self::suffix).
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "gz" => Some(CompressionAlgorithm::Gzip),
            "lz4" => Some(CompressionAlgorithm::Lz4),
            "zst" => Some(CompressionAlgorithm::Zstd),
            _ => None,
        }
    }

    /// Code stored in archive headers (since 1.15).
    pub fn code(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Gzip => 1,
            CompressionAlgorithm::Lz4 => 2,
            CompressionAlgorithm::Zstd => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => CompressionAlgorithm::None,
            1 => CompressionAlgorithm::Gzip,
            2 => CompressionAlgorithm::Lz4,
            3 => CompressionAlgorithm::Zstd,
            _ => return None,
        })
    }

    pub fn default_level(self) -> i32 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Gzip => 6,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 3,
        }
    }

    fn level_range(self) -> (i32, i32) {
        match self {
            CompressionAlgorithm::None => (0, 0),
            CompressionAlgorithm::Gzip => (1, 9),
            CompressionAlgorithm::Lz4 => (1, 12),
            CompressionAlgorithm::Zstd => (1, 22),
        }
    }

    fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
/// Compression algorithm together with its level.
///
/// Parsed from `none`, `gzip`, `gzip:9`, `lz4`, `zstd:19` or a bare
/// number, where `0` selects no compression and `1` to `9` select gzip.
pub struct CompressionSpec {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl CompressionSpec {
    pub const NONE: CompressionSpec = CompressionSpec {
        algorithm: CompressionAlgorithm::None,
        level: 0,
    };

    pub fn new(algorithm: CompressionAlgorithm, level: i32) -> Result<Self, Error> {
        let (min, max) = algorithm.level_range();
        if algorithm != CompressionAlgorithm::None && (level < min || level > max) {
            bail!(
                "compression level {} is out of range for {} ({}-{})",
                level,
                algorithm.name(),
                min,
                max
            );
        }
        if algorithm == CompressionAlgorithm::None {
            return Ok(Self::NONE);
        }
        Ok(Self { algorithm, level })
    }

    /// Spec with the default level of `algorithm`.
    pub fn with_default_level(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            level: algorithm.default_level(),
        }
    }

    /// Build a spec from a bare gzip level as stored in old headers,
    /// where `-1` selects the library default.
    pub fn from_gzip_level(level: i32) -> Self {
        if level == -1 {
            return Self::with_default_level(CompressionAlgorithm::Gzip);
        }
        if level <= 0 {
            return Self::NONE;
        }
        Self {
            algorithm: CompressionAlgorithm::Gzip,
            level: level.min(9),
        }
    }

    pub fn is_none(&self) -> bool {
        self.algorithm == CompressionAlgorithm::None
    }
}

impl std::fmt::Display for CompressionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.algorithm {
            CompressionAlgorithm::None => write!(f, "none"),
            other => write!(f, "{}:{}", other.name(), self.level),
        }
    }
}

impl std::str::FromStr for CompressionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Ok(level) = s.parse::<i32>() {
            if level == 0 {
                return Ok(Self::NONE);
            }
            return Self::new(CompressionAlgorithm::Gzip, level);
        }

        let (name, level) = match s.split_once(':') {
            Some((name, level)) => {
                let level = level
                    .parse::<i32>()
                    .map_err(|_| format_err!("invalid compression level '{}'", level))?;
                (name, Some(level))
            }
            None => (s, None),
        };

        let algorithm = match name {
            "none" => CompressionAlgorithm::None,
            "gzip" => CompressionAlgorithm::Gzip,
            "lz4" => CompressionAlgorithm::Lz4,
            "zstd" => CompressionAlgorithm::Zstd,
            _ => bail!("unrecognized compression algorithm '{}'", name),
        };

        match level {
            Some(0) => Ok(Self::NONE),
            Some(level) => Self::new(algorithm, level),
            None => Ok(Self::with_default_level(algorithm)),
        }
    }
}

proxmox_serde::forward_deserialize_to_from_str!(CompressionSpec);
proxmox_serde::forward_serialize_to_display!(CompressionSpec);

impl proxmox_schema::ApiType for CompressionSpec {
    const API_SCHEMA: Schema = StringSchema::new(
        "Compression specification (e.g. 'none', 'gzip:9', 'lz4', 'zstd:3' or a gzip level).",
    )
    .format(&ApiStringFormat::VerifyFn(|text| {
        let _: CompressionSpec = text.parse()?;
        Ok(())
    }))
    .schema();
}
