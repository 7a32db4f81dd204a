//! Script formats.
//!
//! Neither format stores anything. Data dumpers run while the script is
//! printed and their output goes straight to the current output, or into
//! the database when restoring directly.

use anyhow::Error;

use pgarch_api_types::{ArchiveFormat, DumpId, Oid};

use crate::archive::{write_data_chunk, ArchiveCore};
use crate::format::FormatDriver;
use crate::output::OutputKind;
use crate::restore::restore_archive;

/// Restores a TOC built in memory without writing an archive.
#[derive(Default)]
pub struct NullDriver {}

impl NullDriver {
    pub fn new() -> Self {
        Self {}
    }
}

impl FormatDriver for NullDriver {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Null
    }

    fn start_data(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        Ok(())
    }

    fn write_data(&mut self, core: &mut ArchiveCore, data: &[u8]) -> Result<(), Error> {
        core.ahwrite(data)
    }

    fn end_data(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        Ok(())
    }

    fn start_los(&mut self, core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        core.start_restore_los()
    }

    fn start_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        core.start_restore_lo(oid)
    }

    fn end_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        core.end_restore_lo(oid)
    }

    fn end_los(&mut self, core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        core.end_restore_los()
    }

    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        write_data_chunk(core, self, id)
    }

    fn dumps_data_at_close(&self) -> bool {
        false
    }
}

/// Plain SQL script written while the archive is closed.
pub struct PlainDriver {}

impl PlainDriver {
    /// Script output goes to `path`, standard output for `""` or `"-"`.
    pub fn create(core: &mut ArchiveCore, path: &str) -> Result<Self, Error> {
        let compression = core.header.compression;
        core.set_output_file(path, compression)?;
        Ok(Self {})
    }
}

impl FormatDriver for PlainDriver {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Plain
    }

    fn start_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        // COPY rows must not be interleaved with comments
        if core.output_kind == OutputKind::CopyData {
            return Ok(());
        }
        let description = core.entry(id)?.describe();
        core.ahprintf(format_args!("-- data for {}\n", description))
    }

    fn write_data(&mut self, core: &mut ArchiveCore, data: &[u8]) -> Result<(), Error> {
        core.ahwrite(data)
    }

    fn end_data(&mut self, core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        if core.output_kind == OutputKind::CopyData {
            return Ok(());
        }
        core.ahprintf(format_args!("\n"))
    }

    fn start_los(&mut self, core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        core.start_restore_los()
    }

    fn start_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        core.start_restore_lo(oid)
    }

    fn end_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        core.end_restore_lo(oid)
    }

    fn end_los(&mut self, core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        core.end_restore_los()
    }

    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        write_data_chunk(core, self, id)
    }

    fn finish_close(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        if core.script_printed {
            return Ok(());
        }
        let ropts = core.ropts.clone();
        restore_archive(core, self as &mut dyn FormatDriver, &ropts)
    }

    fn dumps_data_at_close(&self) -> bool {
        false
    }
}
