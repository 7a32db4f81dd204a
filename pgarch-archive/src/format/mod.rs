//! Archive format drivers.
//!
//! Each format implements [`FormatDriver`]. The generic archive code in
//! [`crate::archive`] and [`crate::restore`] owns the TOC and the output
//! state ([`ArchiveCore`]) and hands it to the driver for every operation.

use std::fs::File;
use std::io::{Cursor, Read};
use std::os::unix::io::FromRawFd;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use pgarch_api_types::{ArchiveFormat, DumpId, Oid};
use pgarch_tools::compression::probe_path;

use crate::archive::ArchiveCore;
use crate::error::ArchiveError;
use crate::file_formats::*;
use crate::restore::TocDataPrinter;
use crate::toc::TocEntry;

mod custom;
pub use custom::CustomDriver;

mod directory;
pub use directory::DirectoryDriver;

mod tar;
pub use self::tar::TarDriver;

mod null;
pub use null::{NullDriver, PlainDriver};

/// Format specific half of an archive handle.
///
/// Write mode calls [`archive_entry`](FormatDriver::archive_entry) for
/// every new entry, then at close time [`begin_close`](FormatDriver::begin_close),
/// the data callbacks for each entry with a data dumper and finally
/// [`finish_close`](FormatDriver::finish_close). Read mode only uses
/// [`print_toc_data`](FormatDriver::print_toc_data).
pub trait FormatDriver: Send {
    fn format(&self) -> ArchiveFormat;

    /// Attach format specific data to the new entry `id`.
    fn archive_entry(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        Ok(())
    }

    fn start_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error>;

    fn write_data(&mut self, core: &mut ArchiveCore, data: &[u8]) -> Result<(), Error>;

    fn end_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error>;

    /// The data dumper of `id` failed. Leave the archive navigable.
    fn abort_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        self.end_data(core, id)
    }

    fn start_los(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error>;

    fn start_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error>;

    fn end_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error>;

    fn end_los(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error>;

    /// Send the data of entry `id` to the current output.
    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error>;

    /// Format specific details shown for an entry in verbose output.
    fn print_extra_toc(&self, _core: &ArchiveCore, _te: &TocEntry) -> Option<String> {
        None
    }

    /// Called after the TOC is sorted, before any data is dumped.
    fn begin_close(&mut self, _core: &mut ArchiveCore) -> Result<(), Error> {
        Ok(())
    }

    /// Called after all data was dumped.
    fn finish_close(&mut self, _core: &mut ArchiveCore) -> Result<(), Error> {
        Ok(())
    }

    /// Data dumpers run while closing. Script formats run them while the
    /// script is printed instead.
    fn dumps_data_at_close(&self) -> bool {
        true
    }

    fn supports_parallel(&self) -> bool {
        false
    }

    /// Fill in [`TocEntry::data_length`] so big jobs can be started first.
    fn prep_parallel_restore(&mut self, _core: &mut ArchiveCore) -> Result<(), Error> {
        Ok(())
    }

    /// Independent driver for a worker, operating on the same archive.
    fn clone_for_worker(&self, _core: &ArchiveCore) -> Result<Box<dyn FormatDriver>, Error> {
        bail!(
            "parallel operation is not supported with the {} archive format",
            self.format().summary_name()
        );
    }

    /// Reopen the archive for reading after it was written.
    fn reopen(&mut self, _core: &mut ArchiveCore) -> Result<(), Error> {
        bail!(
            "reopening is not supported with the {} archive format",
            self.format().summary_name()
        );
    }
}

impl<'a> TocDataPrinter for dyn FormatDriver + 'a {
    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        FormatDriver::print_toc_data(self, core, id)
    }

    fn print_extra_toc(&self, core: &ArchiveCore, te: &TocEntry) -> Option<String> {
        FormatDriver::print_extra_toc(self, core, te)
    }
}

/// `""` and `"-"` select standard input or output.
pub(crate) fn is_std_stream(path: &str) -> bool {
    path.is_empty() || path == "-"
}

/// Standard output as a file, for formats writing binary data.
pub(crate) fn stdout_file() -> Result<File, Error> {
    let fd = nix::unistd::dup(libc::STDOUT_FILENO)
        .map_err(|err| format_err!("could not open output file: {}", err))?;
    // the duplicated descriptor is owned by the new file
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn format_from_block(block: &[u8]) -> Result<ArchiveFormat, Error> {
    if block.starts_with(ARCHIVE_MAGIC) {
        return Ok(ArchiveFormat::Custom);
    }

    if block.len() >= 265 {
        let magic = &block[257..265];
        if magic == b"ustar\x0000" || magic == b"ustar  \0" || magic == b"ustar00\0" {
            return Ok(ArchiveFormat::Tar);
        }
    }

    if block.starts_with(b"--") || block.starts_with(b"\n--") {
        bail!("input file appears to be a text format dump. Please use psql.");
    }

    if block.len() < TAR_BLOCK_SIZE {
        bail!("input file is too short (read {}, expected 5)", block.len());
    }

    Err(ArchiveError::BadMagic.into())
}

fn read_block(reader: &mut dyn Read) -> Result<Vec<u8>, Error> {
    let mut block = Vec::with_capacity(TAR_BLOCK_SIZE);
    reader
        .take(TAR_BLOCK_SIZE as u64)
        .read_to_end(&mut block)
        .map_err(|err| format_err!("could not read input file: {}", err))?;
    Ok(block)
}

/// Detect the format of the archive at `path`.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat, Error> {
    if path.is_dir() {
        if probe_path(path.join(TOC_FILE_NAME)).is_some() {
            return Ok(ArchiveFormat::Directory);
        }
        bail!(
            "directory \"{}\" does not appear to be a valid archive (\"{}\" does not exist)",
            path.display(),
            TOC_FILE_NAME
        );
    }

    let mut file = File::open(path)
        .map_err(|err| format_err!("could not open input file \"{}\": {}", path.display(), err))?;
    let block = read_block(&mut file)?;
    format_from_block(&block)
}

/// Detect the format of a stream. The inspected bytes are put back in
/// front of the returned reader.
pub fn detect_stream_format(
    mut input: Box<dyn Read + Send>,
) -> Result<(ArchiveFormat, Box<dyn Read + Send>), Error> {
    let block = read_block(&mut input)?;
    let format = format_from_block(&block)?;
    Ok((format, Box::new(Cursor::new(block).chain(input))))
}
