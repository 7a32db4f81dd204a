//! Basic API types used by the pgarch crates.

use serde::{Deserialize, Serialize};

use proxmox_schema::api;

mod compression;
pub use compression::*;

mod object_class;
pub use object_class::*;

mod restore;
pub use restore::*;

/// Dump identifier, dense and assigned in creation order. `0` is never a valid id.
pub type DumpId = i32;

/// Large object identifier.
pub type Oid = u32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Catalog identifier, carried verbatim from the source database.
pub struct CatalogId {
    /// OID of the system catalog the object lives in
    pub tableoid: Oid,
    /// OID of the object
    pub oid: Oid,
}

impl CatalogId {
    pub const fn new(tableoid: Oid, oid: Oid) -> Self {
        Self { tableoid, oid }
    }
}

impl std::fmt::Display for CatalogId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.tableoid, self.oid)
    }
}

#[api()]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Archive format.
pub enum ArchiveFormat {
    /// Detect the format when opening an archive.
    Unknown,
    /// Monolithic binary archive.
    Custom,
    /// Obsolete per-file format, only recognized to refuse it.
    Files,
    /// POSIX ustar wrapper over the directory layout.
    Tar,
    /// No archive, data dumpers write to the current output.
    Null,
    /// One file per data-bearing entry.
    Directory,
    /// Plain SQL script.
    Plain,
}

impl ArchiveFormat {
    /// Format tag as stored in the archive header.
    pub fn tag(self) -> u8 {
        match self {
            ArchiveFormat::Unknown => 0,
            ArchiveFormat::Custom => 1,
            ArchiveFormat::Files => 2,
            ArchiveFormat::Tar => 3,
            ArchiveFormat::Null => 4,
            ArchiveFormat::Directory => 5,
            ArchiveFormat::Plain => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ArchiveFormat::Unknown,
            1 => ArchiveFormat::Custom,
            2 => ArchiveFormat::Files,
            3 => ArchiveFormat::Tar,
            4 => ArchiveFormat::Null,
            5 => ArchiveFormat::Directory,
            6 => ArchiveFormat::Plain,
            _ => return None,
        })
    }

    /// Name used in TOC summaries.
    pub fn summary_name(self) -> &'static str {
        match self {
            ArchiveFormat::Unknown => "UNKNOWN",
            ArchiveFormat::Custom => "CUSTOM",
            ArchiveFormat::Files => "FILES",
            ArchiveFormat::Tar => "TAR",
            ArchiveFormat::Null => "NULL",
            ArchiveFormat::Directory => "DIRECTORY",
            ArchiveFormat::Plain => "PLAIN",
        }
    }
}

#[api()]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Archive section an entry belongs to.
pub enum Section {
    /// Not part of any section (comments, ACLs of the database, ...).
    None,
    /// Schema objects created before table data is loaded.
    PreData,
    /// Table data, sequence values and large objects.
    Data,
    /// Indexes, constraints and triggers created after the data load.
    PostData,
}

impl Section {
    /// On-disk code, stable across versions.
    pub fn code(self) -> i32 {
        match self {
            Section::None => 1,
            Section::PreData => 2,
            Section::Data => 3,
            Section::PostData => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Section::None,
            2 => Section::PreData,
            3 => Section::Data,
            4 => Section::PostData,
            _ => return None,
        })
    }
}

proxmox_serde::forward_display_to_serialize!(Section);
proxmox_serde::forward_from_str_to_deserialize!(Section);

proxmox_serde::forward_display_to_serialize!(ArchiveFormat);
proxmox_serde::forward_from_str_to_deserialize!(ArchiveFormat);
