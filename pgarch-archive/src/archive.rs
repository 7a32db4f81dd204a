//! Archive handles.
//!
//! An [`ArchiveHandle`] combines the format independent state
//! ([`ArchiveCore`]: header, TOC, output and restore state) with the
//! [`FormatDriver`] of the archive format. Drivers always receive the core
//! as a separate argument, so both halves can be borrowed at the same time.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Error};

use pgarch_api_types::{
    ArchiveFormat, CompressionSpec, DumpId, DumpOptions, ObjectClass, Oid, RestoreOptions, Section,
};
use pgarch_tools::compression::CompressFileHandle;
use pgarch_tools::exit::ExitContext;

use crate::connection::{Connection, Connector};
use crate::error::ArchiveError;
use crate::format::{
    detect_format, detect_stream_format, is_std_stream, CustomDriver, DirectoryDriver,
    FormatDriver, NullDriver, PlainDriver, TarDriver,
};
use crate::header::ArchiveHeader;
use crate::output::OutputKind;
use crate::sort::{sort_toc, SortReport};
use crate::toc::{ArchiveEntryOpts, Toc, TocEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveMode {
    Read,
    Write,
}

/// Format independent archive state.
pub struct ArchiveCore {
    pub(crate) mode: ArchiveMode,
    pub(crate) header: ArchiveHeader,
    pub(crate) toc: Toc,
    pub(crate) exit: ExitContext,
    pub(crate) connection: Option<Box<dyn Connection>>,
    pub(crate) connector: Option<Arc<dyn Connector>>,
    pub(crate) output: Option<CompressFileHandle>,
    pub(crate) output_kind: OutputKind,
    pub(crate) sql_buffer: String,
    pub(crate) copy_failed: bool,
    pub(crate) writing_lo: Option<Oid>,
    /// The large object being restored could not be created.
    pub(crate) lo_failed: bool,
    pub(crate) ropts: RestoreOptions,
    /// A full restore is running, entries are printed in TOC order.
    pub(crate) restoring: bool,
    pub(crate) n_errors: usize,
    pub(crate) current_user: Option<String>,
    pub(crate) current_schema: Option<String>,
    pub(crate) sort_report: SortReport,
    pub(crate) sorted: bool,
    pub(crate) jobs: usize,
    /// A complete script was printed from this handle.
    pub(crate) script_printed: bool,
}

impl ArchiveCore {
    pub(crate) fn new(mode: ArchiveMode, header: ArchiveHeader, exit: ExitContext) -> Self {
        Self {
            mode,
            header,
            toc: Toc::new(),
            exit,
            connection: None,
            connector: None,
            output: None,
            output_kind: OutputKind::SqlCmds,
            sql_buffer: String::new(),
            copy_failed: false,
            writing_lo: None,
            lo_failed: false,
            ropts: RestoreOptions::default(),
            restoring: false,
            n_errors: 0,
            current_user: None,
            current_schema: None,
            sort_report: SortReport::default(),
            sorted: false,
            jobs: 1,
            script_printed: false,
        }
    }

    pub fn mode(&self) -> ArchiveMode {
        self.mode
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn toc(&self) -> &Toc {
        &self.toc
    }

    pub fn toc_mut(&mut self) -> &mut Toc {
        &mut self.toc
    }

    pub fn exit_context(&self) -> &ExitContext {
        &self.exit
    }

    pub fn connection(&mut self) -> Option<&mut (dyn Connection + 'static)> {
        self.connection.as_deref_mut()
    }

    pub(crate) fn entry(&self, id: DumpId) -> Result<&TocEntry, Error> {
        match self.toc.get(id) {
            Some(te) => Ok(te),
            None => bail!("could not find entry for ID {}", id),
        }
    }

    pub(crate) fn entry_mut(&mut self, id: DumpId) -> Result<&mut TocEntry, Error> {
        match self.toc.get_mut(id) {
            Some(te) => Ok(te),
            None => bail!("could not find entry for ID {}", id),
        }
    }

    /// Add the section boundary entries and the edges tying every entry
    /// to its section.
    fn add_boundaries(&mut self) -> Result<(), Error> {
        let pre_id = self.toc.max_dump_id() + 1;
        let post_id = pre_id + 1;

        let ids = self.toc.ids();
        let mut pre_deps = Vec::new();
        let mut post_deps = Vec::new();

        for id in ids {
            let te = self.entry_mut(id)?;
            match te.section {
                Section::PreData => pre_deps.push(id),
                Section::Data => {
                    te.add_dependency(pre_id);
                    post_deps.push(id);
                }
                Section::PostData => te.add_dependency(post_id),
                Section::None => {}
            }
        }

        // every post-data entry must also follow the pre-data boundary
        post_deps.push(pre_id);

        let pre = ArchiveEntryOpts::new(ObjectClass::PreDataBoundary, "PRE-DATA BOUNDARY")
            .deps(&pre_deps)
            .into_entry(pre_id);
        let post = ArchiveEntryOpts::new(ObjectClass::PostDataBoundary, "POST-DATA BOUNDARY")
            .deps(&post_deps)
            .into_entry(post_id);
        self.toc.push(pre)?;
        self.toc.push(post)?;
        Ok(())
    }

    /// Sort the TOC, repairing dependency loops on the way.
    pub(crate) fn sort(&mut self) -> Result<(), Error> {
        if self.mode == ArchiveMode::Write && !self.sorted {
            self.add_boundaries()?;
        }
        let report = sort_toc(&mut self.toc)?;
        self.sort_report.repairs.extend(report.repairs);
        self.sorted = true;
        Ok(())
    }

    /// Copy of the state a worker needs. Output and sessions are not
    /// shared.
    pub(crate) fn clone_for_worker(&self) -> ArchiveCore {
        let mut core = ArchiveCore::new(self.mode, self.header.clone(), self.exit.clone());
        core.toc = self.toc.clone();
        core.ropts = self.ropts.clone();
        core.restoring = self.restoring;
        core.sorted = self.sorted;
        core
    }
}

/// Data dumper view of the archive.
///
/// Only exists while a [`DataDumper`](crate::DataDumper) runs, so data can
/// not be written outside of one.
pub struct DumpContext<'a> {
    pub(crate) core: &'a mut ArchiveCore,
    pub(crate) driver: &'a mut dyn FormatDriver,
    pub(crate) id: DumpId,
}

impl<'a> DumpContext<'a> {
    pub fn dump_id(&self) -> DumpId {
        self.id
    }

    pub fn entry(&self) -> Option<&TocEntry> {
        self.core.toc.get(self.id)
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        self.driver.write_data(self.core, data)
    }

    fn check_blobs_entry(&self) -> Result<(), Error> {
        match self.entry() {
            Some(te) if te.class == ObjectClass::Blobs => Ok(()),
            _ => bail!("large objects can only be written by a BLOBS entry"),
        }
    }

    pub fn start_lo(&mut self, oid: Oid) -> Result<(), Error> {
        self.check_blobs_entry()?;
        if oid == 0 {
            bail!("invalid OID for large object");
        }
        self.driver.start_lo(self.core, oid)
    }

    pub fn end_lo(&mut self, oid: Oid) -> Result<(), Error> {
        self.check_blobs_entry()?;
        self.driver.end_lo(self.core, oid)
    }

    /// Session of the dumping connection, if any.
    pub fn connection(&mut self) -> Option<&mut (dyn Connection + 'static)> {
        self.core.connection.as_deref_mut()
    }

    pub fn is_aborting(&self) -> bool {
        self.core.exit.is_aborting()
    }
}

impl<'a> std::io::Write for DumpContext<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_data(buf)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run the data dumper of `id` through `driver`.
pub(crate) fn write_data_chunk(
    core: &mut ArchiveCore,
    driver: &mut dyn FormatDriver,
    id: DumpId,
) -> Result<(), Error> {
    let te = core.entry(id)?;
    let dumper = match te.dumper.clone() {
        Some(dumper) => dumper,
        None => return Ok(()),
    };
    let is_blobs = te.class == ObjectClass::Blobs;

    log::debug!("dumping contents of {}", te.describe());

    if is_blobs {
        driver.start_los(core, id)?;
    } else {
        driver.start_data(core, id)?;
    }

    let result = {
        let mut ctx = DumpContext {
            core: &mut *core,
            driver: &mut *driver,
            id,
        };
        dumper.dump(&mut ctx)
    };

    match result {
        Ok(()) => {
            if is_blobs {
                driver.end_los(core, id)
            } else {
                driver.end_data(core, id)
            }
        }
        Err(err) => {
            if let Err(abort_err) = driver.abort_data(core, id) {
                log::error!("could not finish data of entry {}: {}", id, abort_err);
            }
            Err(err)
        }
    }
}

/// Open archive, either being written or being read.
pub struct ArchiveHandle {
    pub(crate) core: ArchiveCore,
    pub(crate) driver: Box<dyn FormatDriver>,
    closed: bool,
}

impl ArchiveHandle {
    /// Create a new archive at `path`. `""` or `"-"` writes to standard
    /// output where the format allows it.
    pub fn create(
        path: &str,
        format: ArchiveFormat,
        options: &DumpOptions,
        exit: ExitContext,
    ) -> Result<Self, Error> {
        let mut header = ArchiveHeader::new(format, options.compression);
        header.dbname = options.dbname.clone();
        header.server_version = options.server_version.clone();

        let mut core = ArchiveCore::new(ArchiveMode::Write, header, exit);
        core.jobs = options.jobs.max(1);

        let driver: Box<dyn FormatDriver> = match format {
            ArchiveFormat::Custom => Box::new(CustomDriver::create(&mut core, path)?),
            ArchiveFormat::Directory => Box::new(DirectoryDriver::create(&mut core, path)?),
            ArchiveFormat::Tar => Box::new(TarDriver::create(&mut core, path)?),
            ArchiveFormat::Plain => Box::new(PlainDriver::create(&mut core, path)?),
            ArchiveFormat::Null => Box::new(NullDriver::new()),
            ArchiveFormat::Files | ArchiveFormat::Unknown => {
                return Err(ArchiveError::UnsupportedFormat(format.to_string()).into())
            }
        };

        Ok(Self {
            core,
            driver,
            closed: false,
        })
    }

    /// Open an existing archive. [`ArchiveFormat::Unknown`] detects the
    /// format, `""` or `"-"` reads standard input.
    pub fn open(path: &str, format: ArchiveFormat, exit: ExitContext) -> Result<Self, Error> {
        if is_std_stream(path) {
            return Self::open_stream(Box::new(std::io::stdin()), format, exit);
        }

        let format = match format {
            ArchiveFormat::Unknown => detect_format(Path::new(path))?,
            other => other,
        };

        let mut core = ArchiveCore::new(
            ArchiveMode::Read,
            ArchiveHeader::new(format, CompressionSpec::NONE),
            exit,
        );

        let driver: Box<dyn FormatDriver> = match format {
            ArchiveFormat::Custom => Box::new(CustomDriver::open(&mut core, path)?),
            ArchiveFormat::Directory => Box::new(DirectoryDriver::open(&mut core, path)?),
            ArchiveFormat::Tar => Box::new(TarDriver::open(&mut core, path)?),
            ArchiveFormat::Plain | ArchiveFormat::Null => {
                bail!("this format cannot be read")
            }
            ArchiveFormat::Files | ArchiveFormat::Unknown => {
                return Err(ArchiveError::UnsupportedFormat(format.to_string()).into())
            }
        };

        Self::finish_open(core, driver)
    }

    /// Open an archive from a non-seekable stream. Only the custom and
    /// tar formats can be read this way.
    pub fn open_stream(
        input: Box<dyn Read + Send>,
        format: ArchiveFormat,
        exit: ExitContext,
    ) -> Result<Self, Error> {
        let (format, input) = match format {
            ArchiveFormat::Unknown => detect_stream_format(input)?,
            other => (other, input),
        };

        let mut core = ArchiveCore::new(
            ArchiveMode::Read,
            ArchiveHeader::new(format, CompressionSpec::NONE),
            exit,
        );

        let driver: Box<dyn FormatDriver> = match format {
            ArchiveFormat::Custom => Box::new(CustomDriver::open_stream(&mut core, input)?),
            ArchiveFormat::Tar => Box::new(TarDriver::open_stream(&mut core, input)?),
            ArchiveFormat::Directory => bail!("directory archives can not be read from a stream"),
            ArchiveFormat::Plain | ArchiveFormat::Null => bail!("this format cannot be read"),
            ArchiveFormat::Files | ArchiveFormat::Unknown => {
                return Err(ArchiveError::UnsupportedFormat(format.to_string()).into())
            }
        };

        Self::finish_open(core, driver)
    }

    fn finish_open(mut core: ArchiveCore, driver: Box<dyn FormatDriver>) -> Result<Self, Error> {
        log::debug!(
            "archive version {}, format {}, {} TOC entries",
            core.header.version_string(),
            core.header.format.summary_name(),
            core.toc.len()
        );
        core.sort()?;
        Ok(Self {
            core,
            driver,
            closed: false,
        })
    }

    pub fn format(&self) -> ArchiveFormat {
        self.driver.format()
    }

    pub fn mode(&self) -> ArchiveMode {
        self.core.mode
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.core.header
    }

    pub fn toc(&self) -> &Toc {
        &self.core.toc
    }

    pub fn toc_mut(&mut self) -> &mut Toc {
        &mut self.core.toc
    }

    pub fn sort_report(&self) -> &SortReport {
        &self.core.sort_report
    }

    /// Number of errors ignored during the last restore.
    pub fn error_count(&self) -> usize {
        self.core.n_errors
    }

    pub fn exit_context(&self) -> &ExitContext {
        &self.core.exit
    }

    /// Restore into this session instead of printing a script.
    pub fn set_connection(&mut self, connection: Box<dyn Connection>) {
        self.core.connection = Some(connection);
    }

    pub fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
        self.core.connection.take()
    }

    /// Source of sessions for parallel workers.
    pub fn set_connector(&mut self, connector: Arc<dyn Connector>) {
        self.core.connector = Some(connector);
    }

    /// Options used when a plain archive prints its script on close.
    pub fn set_restore_options(&mut self, ropts: &RestoreOptions) {
        self.core.ropts = ropts.clone();
    }

    pub fn set_jobs(&mut self, jobs: usize) {
        self.core.jobs = jobs.max(1);
    }

    /// Print script output to `path`.
    pub fn set_output_file(&mut self, path: &str, compression: CompressionSpec) -> Result<(), Error> {
        self.core.set_output_file(path, compression)?;
        Ok(())
    }

    /// Print script output to `writer`.
    pub fn set_output_writer(
        &mut self,
        writer: Box<dyn std::io::Write + Send>,
        compression: CompressionSpec,
    ) -> Result<(), Error> {
        self.core.set_output(CompressFileHandle::to_writer(writer, compression)?);
        Ok(())
    }

    /// Add a new entry at the end of the TOC and return its dump id.
    pub fn archive_entry(&mut self, opts: ArchiveEntryOpts) -> Result<DumpId, Error> {
        if self.core.mode != ArchiveMode::Write {
            bail!("cannot add entries to an archive opened for reading");
        }
        if self.core.sorted {
            bail!("cannot add entries after the TOC was sorted");
        }
        let id = self.core.toc.max_dump_id() + 1;
        self.core.toc.push(opts.into_entry(id))?;
        self.driver.archive_entry(&mut self.core, id)?;
        Ok(id)
    }

    /// Sort the TOC, adding the section boundaries when writing.
    ///
    /// Closing and restoring sort implicitly.
    pub fn sort_toc(&mut self) -> Result<(), Error> {
        self.core.sort()
    }

    fn write_data_chunks(&mut self) -> Result<(), Error> {
        if self.core.jobs > 1 && self.driver.supports_parallel() {
            return crate::parallel::dump_parallel(self);
        }

        let ids: Vec<DumpId> = self
            .core
            .toc
            .iter()
            .filter(|te| te.dumper.is_some())
            .map(|te| te.dump_id)
            .collect();

        let mut failed = 0;
        for id in ids {
            if self.core.exit.is_aborting() {
                bail!("terminated by user");
            }
            if let Err(err) = write_data_chunk(&mut self.core, &mut *self.driver, id) {
                log::error!("dumping data of entry {} failed: {}", id, err);
                failed += 1;
            }
        }

        if failed > 0 {
            bail!("{} data dumpers failed", failed);
        }
        Ok(())
    }

    /// Finish the archive.
    ///
    /// In write mode the TOC is sorted, written together with the data of
    /// every entry, and the file is finalized even if some data dumpers
    /// failed. Their failure is reported afterwards.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }

        let result = match self.core.mode {
            ArchiveMode::Read => Ok(()),
            ArchiveMode::Write => {
                if !self.core.sorted {
                    self.core.sort()?;
                }
                self.driver.begin_close(&mut self.core)?;
                let data_result = if self.driver.dumps_data_at_close() {
                    self.write_data_chunks()
                } else {
                    Ok(())
                };
                self.driver.finish_close(&mut self.core)?;
                data_result
            }
        };
        // only set once the driver finished, a failed close can be retried
        self.closed = true;

        self.core.close_output()?;
        result
    }

    /// Reopen a finished archive for reading.
    pub fn reopen(&mut self) -> Result<(), Error> {
        if !self.closed {
            self.close()?;
        }
        self.driver.reopen(&mut self.core)?;
        self.core.mode = ArchiveMode::Read;
        self.closed = false;
        Ok(())
    }

    /// Restore the selected entries, either as a script to the current
    /// output or into the connected database.
    pub fn restore(&mut self, ropts: &RestoreOptions) -> Result<(), Error> {
        match (self.core.mode, self.driver.format()) {
            (ArchiveMode::Read, _) => {}
            (ArchiveMode::Write, ArchiveFormat::Null | ArchiveFormat::Plain) => {
                if !self.core.sorted {
                    self.core.sort()?;
                }
            }
            (ArchiveMode::Write, _) => bail!("archive opened for writing cannot be restored"),
        }

        let mut ropts = ropts.clone();
        if let Some(list) = ropts.toc_file.clone() {
            ropts.id_wanted = Some(self.sort_toc_from_file(&list)?);
        }

        if self.core.jobs > 1 {
            if self.core.connection.is_none() {
                bail!("parallel restore is only supported when restoring into a database");
            }
            if !self.driver.supports_parallel() {
                bail!(
                    "parallel restore is not supported with the {} archive format",
                    self.driver.format().summary_name()
                );
            }
            return crate::parallel::restore_parallel(self, &ropts);
        }

        crate::restore::restore_archive(&mut self.core, &mut *self.driver, &ropts)
    }

    /// Print the data of a single entry to the current output.
    pub fn print_entry_data(&mut self, id: DumpId) -> Result<(), Error> {
        if self.core.mode != ArchiveMode::Read {
            bail!("archive is not open for reading");
        }
        self.core.entry(id)?;
        self.core.restoring = false;
        self.driver.print_toc_data(&mut self.core, id)?;
        self.core.flush_output()
    }

    pub fn prep_parallel_restore(&mut self) -> Result<(), Error> {
        self.driver.prep_parallel_restore(&mut self.core)
    }

    /// Handle for a worker thread: same TOC, own driver state, no output.
    pub(crate) fn clone_for_worker(&self) -> Result<ArchiveHandle, Error> {
        let core = self.core.clone_for_worker();
        let driver = self.driver.clone_for_worker(&core)?;
        Ok(ArchiveHandle {
            core,
            driver,
            closed: false,
        })
    }
}

impl Drop for ArchiveHandle {
    fn drop(&mut self) {
        if let Err(err) = self.core.close_output() {
            log::error!("closing output failed: {}", err);
        }
    }
}
