//! pgarch - logical dump archives
//!
//! Glue between an [`ObjectSource`](source::ObjectSource) describing the
//! objects of a database and the archive engine in `pgarch-archive`.
//!
//! ```no_run
//! # use anyhow::Error;
//! # fn main() -> Result<(), Error> {
//! use pgarch::source::ManifestSource;
//! use pgarch_api_types::{ArchiveFormat, DumpOptions, RestoreOptions};
//! use pgarch_tools::exit::ExitContext;
//!
//! let source = ManifestSource::load("shop.json")?;
//! pgarch::dump::dump_archive(
//!     &source,
//!     "shop.dump",
//!     ArchiveFormat::Custom,
//!     &DumpOptions::default(),
//!     &RestoreOptions::default(),
//!     ExitContext::new("pgarch"),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod dump;
pub mod restore;
pub mod source;
