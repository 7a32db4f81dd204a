//! Archive engine of pgarch.
//!
//! Reads and writes logical dump archives in the custom, directory, tar
//! and plain formats. An archive is described by its table of contents
//! ([`Toc`]), which is sorted by dependencies before anything is written
//! or restored. Restores either print an SQL script or run the statements
//! through a [`Connection`], optionally with a pool of parallel workers.

pub mod archive;
pub mod codec;
pub mod connection;
pub mod error;
pub mod file_formats;
pub mod format;
pub mod header;
pub mod output;
pub mod parallel;
pub mod restore;
pub mod sort;
pub mod summary;
pub mod toc;

pub use archive::{ArchiveCore, ArchiveHandle, ArchiveMode, DumpContext};
pub use connection::{lock_relation_nowait, CancelToken, Connection, Connector};
pub use error::ArchiveError;
pub use header::ArchiveHeader;
pub use output::OutputKind;
pub use restore::{toc_entry_required, Requirement};
pub use sort::{LoopRepair, SortReport};
pub use toc::{ArchiveEntryOpts, DataDumper, FormatExtra, SortInfo, Toc, TocEntry};
