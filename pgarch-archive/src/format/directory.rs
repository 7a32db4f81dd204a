//! Directory format: `toc.dat` plus one (optionally compressed) file per
//! data-bearing entry.
//!
//! Large objects are stored as `blob_<oid>.dat` files, listed in a
//! `blobs_<id>.toc` file per BLOBS entry.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use pgarch_api_types::{ArchiveFormat, CompressionSpec, DumpId, ObjectClass, Oid};
use pgarch_tools::compression::{probe_path, CompressFileHandle, DEFAULT_IO_BUFFER_SIZE};
use pgarch_tools::fs::{create_empty_dir, fsync_dir_recursive};

use crate::archive::ArchiveCore;
use crate::codec::map_write_error;
use crate::file_formats::*;
use crate::format::{is_std_stream, FormatDriver};
use crate::header::{read_file_extra, read_toc, write_file_extra, write_toc, ArchiveHeader};
use crate::toc::{FormatExtra, TocEntry};

lazy_static! {
    static ref BLOBS_TOC_LINE: Regex = Regex::new(r"^(\d+) (\S+)\s*$").unwrap();
}

/// Parse one `<oid> <file name>` line of a large object TOC.
pub(crate) fn parse_blobs_toc_line(line: &str) -> Option<(Oid, String)> {
    let caps = BLOBS_TOC_LINE.captures(line)?;
    let oid: Oid = caps[1].parse().ok()?;
    Some((oid, caps[2].to_string()))
}

/// Send the whole content of `handle` to the restore output.
pub(crate) fn copy_to_output(core: &mut ArchiveCore, handle: &mut CompressFileHandle) -> Result<(), Error> {
    let mut buf = vec![0u8; DEFAULT_IO_BUFFER_SIZE * 4];
    loop {
        let count = handle
            .read(&mut buf)
            .map_err(|err| format_err!("could not read input file: {}", err))?;
        if count > 0 {
            core.ahwrite(&buf[..count])?;
        }
        if count < buf.len() {
            return Ok(());
        }
    }
}

/// Driver of the directory archive format.
pub struct DirectoryDriver {
    dir: PathBuf,
    data_file: Option<CompressFileHandle>,
    blobs_toc: Option<BufWriter<File>>,
}

impl DirectoryDriver {
    pub fn create(core: &mut ArchiveCore, path: &str) -> Result<Self, Error> {
        if is_std_stream(path) {
            bail!("no output directory specified");
        }
        create_empty_dir(path)?;
        log::debug!(
            "writing directory archive to {} with {} compression",
            path,
            core.header.compression
        );
        Ok(Self::with_dir(PathBuf::from(path)))
    }

    pub fn open(core: &mut ArchiveCore, path: &str) -> Result<Self, Error> {
        let dir = PathBuf::from(path);
        let mut toc_file = CompressFileHandle::open_read(dir.join(TOC_FILE_NAME))?;
        let header = ArchiveHeader::read(&mut toc_file, ArchiveFormat::Directory)?;
        let codec = header.codec();
        core.header = header;
        core.toc = read_toc(&codec, &mut toc_file, &mut read_file_extra)?;
        Ok(Self::with_dir(dir))
    }

    fn with_dir(dir: PathBuf) -> Self {
        Self {
            dir,
            data_file: None,
            blobs_toc: None,
        }
    }

    fn data_path(&self, core: &ArchiveCore, id: DumpId) -> Result<PathBuf, Error> {
        match core.entry(id)?.data_file() {
            Some(name) => Ok(self.dir.join(name)),
            None => bail!("no data file name for entry {}", id),
        }
    }

    fn data_file(&mut self) -> Result<&mut CompressFileHandle, Error> {
        match self.data_file.as_mut() {
            Some(handle) => Ok(handle),
            None => bail!("no data file is open"),
        }
    }

    fn close_data_file(&mut self) -> Result<(), Error> {
        if let Some(mut handle) = self.data_file.take() {
            handle
                .close()
                .map_err(|err| format_err!("could not close data file: {}", err))?;
        }
        Ok(())
    }

    /// Open the large object TOC of `te`, falling back to the single
    /// file name used by old versions.
    fn open_blobs_toc(&self, te: &TocEntry) -> Result<CompressFileHandle, Error> {
        let name = te
            .data_file()
            .map(String::from)
            .unwrap_or_else(|| blobs_toc_name(te.dump_id));
        match CompressFileHandle::open_read(self.dir.join(&name)) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                let legacy = self.dir.join(LEGACY_BLOBS_TOC_NAME);
                if probe_path(&legacy).is_some() {
                    return CompressFileHandle::open_read(legacy);
                }
                Err(format_err!("could not open large object TOC file \"{}\" for input: {}", name, err))
            }
        }
    }

    fn print_blobs(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let te = core.entry(id)?.clone();
        let mut toc = self.open_blobs_toc(&te)?;

        core.start_restore_los()?;
        let mut line = String::new();
        while toc
            .gets(&mut line)
            .map_err(|err| format_err!("could not read large object TOC file: {}", err))?
        {
            let (oid, name) = match parse_blobs_toc_line(&line) {
                Some(entry) => entry,
                None => bail!(
                    "invalid line in large object TOC file \"{}\": \"{}\"",
                    te.data_file().unwrap_or(LEGACY_BLOBS_TOC_NAME),
                    line.trim_end()
                ),
            };
            core.start_restore_lo(oid)?;
            let mut blob = CompressFileHandle::open_read(self.dir.join(&name))?;
            copy_to_output(core, &mut blob)?;
            core.end_restore_lo(oid)?;
        }
        core.end_restore_los()
    }
}

fn file_size(path: &Path) -> u64 {
    match probe_path(path) {
        Some((found, _)) => std::fs::metadata(found).map(|meta| meta.len()).unwrap_or(0),
        None => 0,
    }
}

impl FormatDriver for DirectoryDriver {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Directory
    }

    fn archive_entry(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let te = core.entry_mut(id)?;
        let filename = if te.dumper.is_none() {
            None
        } else if te.class == ObjectClass::Blobs {
            Some(blobs_toc_name(id))
        } else {
            Some(data_file_name(id))
        };
        te.extra = FormatExtra::File { filename };
        Ok(())
    }

    fn start_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let path = self.data_path(core, id)?;
        self.data_file = Some(CompressFileHandle::open_write(path, core.header.compression)?);
        Ok(())
    }

    fn write_data(&mut self, _core: &mut ArchiveCore, data: &[u8]) -> Result<(), Error> {
        self.data_file()?
            .write_all(data)
            .map_err(|err| format_err!("could not write to output file: {}", err))
    }

    fn end_data(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        self.close_data_file()
    }

    fn abort_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let path = self.data_file.as_ref().and_then(|handle| handle.path().map(PathBuf::from));
        self.close_data_file()?;
        self.blobs_toc = None;

        if let Some(path) = path {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("could not remove \"{}\": {}", path.display(), err);
            }
        }

        // the entry is written without data
        let te = core.entry_mut(id)?;
        te.extra = FormatExtra::File { filename: None };
        te.dumper = None;
        te.had_dumper = false;
        Ok(())
    }

    fn start_los(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let path = self.data_path(core, id)?;
        let file = File::create(&path).map_err(|err| {
            format_err!("could not open output file \"{}\": {}", path.display(), err)
        })?;
        self.blobs_toc = Some(BufWriter::new(file));
        Ok(())
    }

    fn start_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        let path = self.dir.join(blob_file_name(oid));
        self.data_file = Some(CompressFileHandle::open_write(path, core.header.compression)?);
        Ok(())
    }

    fn end_lo(&mut self, _core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        self.close_data_file()?;
        let toc = match self.blobs_toc.as_mut() {
            Some(toc) => toc,
            None => bail!("large object TOC file is not open"),
        };
        writeln!(toc, "{} {}", oid, blob_file_name(oid)).map_err(map_write_error)
    }

    fn end_los(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        if let Some(mut toc) = self.blobs_toc.take() {
            toc.flush()
                .map_err(|err| format_err!("could not close large object TOC file: {}", err))?;
        }
        Ok(())
    }

    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        if core.entry(id)?.class == ObjectClass::Blobs {
            return self.print_blobs(core, id);
        }
        let name = match core.entry(id)?.data_file() {
            Some(name) => name.to_string(),
            None => return Ok(()),
        };
        let mut handle = CompressFileHandle::open_read(self.dir.join(&name))?;
        copy_to_output(core, &mut handle)
    }

    fn print_extra_toc(&self, _core: &ArchiveCore, te: &TocEntry) -> Option<String> {
        te.data_file().map(|name| format!("File: {}", name))
    }

    fn finish_close(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        self.close_data_file()?;

        // the TOC itself is never compressed
        let path = self.dir.join(TOC_FILE_NAME);
        let mut toc_file = CompressFileHandle::open_write_exact(&path, CompressionSpec::NONE)?;
        core.header.write(&mut toc_file)?;
        write_toc(&core.header.codec(), &core.toc, &mut toc_file, &mut write_file_extra)?;
        toc_file
            .close()
            .map_err(|err| format_err!("could not close TOC file: {}", err))?;

        fsync_dir_recursive(&self.dir)
    }

    fn supports_parallel(&self) -> bool {
        true
    }

    fn prep_parallel_restore(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        for id in core.toc.ids() {
            let te = core.entry(id)?;
            let name = match te.data_file() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let mut size = file_size(&self.dir.join(name));
            if te.class == ObjectClass::Blobs {
                size *= BLOBS_SIZE_FACTOR;
            }
            core.entry_mut(id)?.data_length = size;
        }
        Ok(())
    }

    fn clone_for_worker(&self, _core: &ArchiveCore) -> Result<Box<dyn FormatDriver>, Error> {
        Ok(Box::new(DirectoryDriver::with_dir(self.dir.clone())))
    }

    fn reopen(&mut self, _core: &mut ArchiveCore) -> Result<(), Error> {
        self.close_data_file()?;
        self.blobs_toc = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blobs_toc_lines() {
        assert_eq!(
            parse_blobs_toc_line("16401 blob_16401.dat\n"),
            Some((16401, "blob_16401.dat".to_string()))
        );
        assert_eq!(parse_blobs_toc_line("garbage\n"), None);
        assert_eq!(parse_blobs_toc_line("-1 blob.dat\n"), None);
    }
}
