//! Tar format: the directory layout wrapped in a ustar archive.
//!
//! Members are `toc.dat`, one `<id>.dat` per data entry, the large
//! objects with their `blobs_<id>.toc`, and a `restore.sql` script which
//! restores everything from the extracted files. Data is never
//! compressed.
//!
//! Reading is strictly sequential: a member that was passed can not be
//! read again, so data has to be restored in archive order.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};

use pgarch_api_types::{ArchiveFormat, CompressionSpec, DumpId, ObjectClass, Oid, RestoreOptions};
use pgarch_tools::compression::{CompressFileHandle, DEFAULT_IO_BUFFER_SIZE};
use pgarch_tools::fs::create_tmpfile;

use crate::archive::ArchiveCore;
use crate::codec::map_write_error;
use crate::error::ArchiveError;
use crate::file_formats::*;
use crate::format::{is_std_stream, stdout_file, FormatDriver};
use crate::header::{read_file_extra, read_toc, write_file_extra, write_toc, ArchiveHeader};
use crate::restore::{restore_archive, toc_entry_required, Requirement, TocDataPrinter};
use crate::toc::{FormatExtra, TocEntry};

const MEMBER_MODE: u32 = 0o600;
const MEMBER_UID: u64 = 0o4000;
const MEMBER_GID: u64 = 0o2000;
const MEMBER_OWNER: &str = "postgres";

const RESTORE_SCRIPT_NOTE: &str = "--\n\
-- NOTE:\n\
--\n\
-- File paths need to be edited. Search for $$PATH$$ and\n\
-- replace it with the path to the directory containing\n\
-- the extracted data files.\n\
--\n";

/// Member being written, staged in an anonymous temporary file until
/// its size is known.
struct StagedMember {
    name: String,
    file: BufWriter<File>,
}

impl StagedMember {
    fn new(name: String) -> Result<Self, Error> {
        Ok(Self {
            name,
            file: BufWriter::new(create_tmpfile()?),
        })
    }

    /// Flush and rewind, returning the file and its size.
    fn into_file(self) -> Result<(String, File, u64), Error> {
        let mut file = self
            .file
            .into_inner()
            .map_err(|err| format_err!("could not write to temporary file: {}", err.error()))?;
        let size = file
            .stream_position()
            .map_err(|err| format_err!("could not determine seek position in file: {}", err))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|err| format_err!("could not seek in temporary file: {}", err))?;
        Ok((self.name, file, size))
    }
}

struct MemberHeader {
    name: String,
    size: u64,
}

fn padded(size: u64) -> u64 {
    let block = TAR_BLOCK_SIZE as u64;
    (size + block - 1) / block * block
}

/// Checksum `header` should carry, counting the checksum field as spaces.
fn computed_checksum(header: &::tar::Header) -> u64 {
    let mut copy = header.clone();
    copy.set_cksum();
    copy.cksum().map(u64::from).unwrap_or(0)
}

/// Dump id encoded in a data member name like `12.dat`.
fn member_dump_id(name: &str) -> Option<DumpId> {
    name.split('.').next()?.parse().ok()
}

/// Sequential reader of tar members.
struct TarReader {
    input: Box<dyn Read + Send>,
    pos: u64,
    next_member: u64,
    passed: HashSet<String>,
}

impl TarReader {
    fn new(input: Box<dyn Read + Send>) -> Self {
        Self {
            input,
            pos: 0,
            next_member: 0,
            passed: HashSet::new(),
        }
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut done = 0;
        while done < buf.len() {
            match self.input.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(count) => done += count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => bail!("could not read from input file: {}", err),
            }
        }
        self.pos += done as u64;
        Ok(done)
    }

    /// Skip the rest of the current member and its padding.
    fn skip_to_next_member(&mut self) -> Result<(), Error> {
        if self.pos >= self.next_member {
            return Ok(());
        }
        let count = self.next_member - self.pos;
        let skipped = io::copy(&mut (&mut self.input).take(count), &mut io::sink())
            .map_err(|err| format_err!("could not read from input file: {}", err))?;
        self.pos += skipped;
        if skipped < count {
            return Err(ArchiveError::TruncatedFile.into());
        }
        Ok(())
    }

    /// Read the next member header. `None` at the end of the archive.
    fn next_header(&mut self) -> Result<Option<MemberHeader>, Error> {
        self.skip_to_next_member()?;

        let mut block = [0u8; TAR_BLOCK_SIZE];
        loop {
            let header_pos = self.pos;
            let count = self.read_raw(&mut block)?;
            if count == 0 {
                return Ok(None);
            }
            if count != TAR_BLOCK_SIZE {
                bail!("incomplete tar header found ({} byte)", count);
            }
            // end of archive markers
            if block.iter().all(|b| *b == 0) {
                continue;
            }

            let header = ::tar::Header::from_byte_slice(&block);
            let name = header
                .path()
                .map(|path| path.to_string_lossy().into_owned())
                .map_err(|err| {
                    format_err!("invalid member name in tar header at position {}: {}", header_pos, err)
                })?;

            let expected = header.cksum().map(u64::from).unwrap_or(0);
            let computed = computed_checksum(header);
            if expected != computed {
                return Err(ArchiveError::CorruptTarHeader {
                    name,
                    expected,
                    computed,
                    pos: header_pos,
                }
                .into());
            }

            let size = header
                .entry_size()
                .map_err(|err| format_err!("invalid size in tar header of \"{}\": {}", name, err))?;

            log::trace!("tar member {} at {} (length {})", name, header_pos, size);

            self.next_member = self.pos + padded(size);
            self.passed.insert(name.clone());
            return Ok(Some(MemberHeader { name, size }));
        }
    }

    /// Move to the member `name`. While restoring, passing a member whose
    /// data is still needed is an error.
    fn position_to(&mut self, core: &ArchiveCore, name: &str) -> Result<MemberHeader, Error> {
        if self.passed.contains(name) {
            return Err(ArchiveError::out_of_order_tar().into());
        }

        loop {
            let header = match self.next_header()? {
                Some(header) => header,
                None => bail!("could not find header for file \"{}\" in tar archive", name),
            };
            if header.name == name {
                return Ok(header);
            }

            log::debug!("skipping tar member {}", header.name);

            if core.restoring {
                if let Some(te) = member_dump_id(&header.name).and_then(|id| core.toc.get(id)) {
                    if !te.printed && toc_entry_required(te, &core.ropts).contains(Requirement::DATA) {
                        return Err(ArchiveError::OutOfOrder(format!(
                            "restoring data out of order is not supported in this archive format: \"{}\" is required, but comes before \"{}\" in the archive file.",
                            header.name, name
                        ))
                        .into());
                    }
                }
            }
        }
    }

    /// Pass the data of the current member to `output`.
    fn read_member<F>(&mut self, header: &MemberHeader, mut output: F) -> Result<(), Error>
    where
        F: FnMut(&[u8]) -> Result<(), Error>,
    {
        let mut buf = vec![0u8; DEFAULT_IO_BUFFER_SIZE * 4];
        let mut remaining = header.size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let count = self.read_raw(&mut buf[..want])?;
            if count < want {
                return Err(ArchiveError::TruncatedFile.into());
            }
            output(&buf[..count])?;
            remaining -= count as u64;
        }
        Ok(())
    }

    fn read_member_to_vec(&mut self, header: &MemberHeader) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(header.size as usize);
        self.read_member(header, |buf| {
            data.extend_from_slice(buf);
            Ok(())
        })?;
        Ok(data)
    }
}

/// Prints `restore.sql`: data is loaded from the extracted member files.
struct ScriptPrinter<'a> {
    blobs: &'a HashMap<DumpId, Vec<Oid>>,
}

impl<'a> TocDataPrinter for ScriptPrinter<'a> {
    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        if core.entry(id)?.class != ObjectClass::Blobs {
            return Ok(());
        }
        let oids = match self.blobs.get(&id) {
            Some(oids) => oids,
            None => return Ok(()),
        };

        core.start_restore_los()?;
        for oid in oids {
            if core.ropts.drop_schema {
                core.ahprintf(format_args!(
                    "SELECT pg_catalog.lo_unlink(oid) FROM pg_catalog.pg_largeobject_metadata WHERE oid = '{}';\n",
                    oid
                ))?;
            }
            core.ahprintf(format_args!(
                "SELECT pg_catalog.lo_from_bytea('{}', pg_catalog.pg_read_binary_file('{}/{}'));\n\n",
                oid,
                TAR_PATH_PLACEHOLDER,
                blob_file_name(*oid)
            ))?;
        }
        core.end_restore_los()
    }

    fn data_file_reference(&self, te: &TocEntry) -> Option<String> {
        if te.class == ObjectClass::Blobs {
            return None;
        }
        te.data_file().map(String::from)
    }
}

/// Driver of the tar archive format.
pub struct TarDriver {
    path: Option<PathBuf>,
    builder: Option<::tar::Builder<BufWriter<File>>>,
    staged: Option<StagedMember>,
    blobs_toc: Option<StagedMember>,
    /// Large objects written per BLOBS entry, for `restore.sql`.
    blobs: HashMap<DumpId, Vec<Oid>>,
    current_blobs: Option<DumpId>,
    mtime: u64,
    reader: Option<TarReader>,
}

impl TarDriver {
    fn empty(path: Option<PathBuf>) -> Self {
        Self {
            path,
            builder: None,
            staged: None,
            blobs_toc: None,
            blobs: HashMap::new(),
            current_blobs: None,
            mtime: 0,
            reader: None,
        }
    }

    pub fn create(core: &mut ArchiveCore, path: &str) -> Result<Self, Error> {
        if !core.header.compression.is_none() {
            bail!("compression is not supported by tar archive format");
        }

        let (file, path) = if is_std_stream(path) {
            (stdout_file()?, None)
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|err| ArchiveError::CannotOpenOutput {
                    path: path.to_string(),
                    reason: err.to_string(),
                })?;
            (file, Some(PathBuf::from(path)))
        };

        let mut driver = Self::empty(path);
        driver.builder = Some(::tar::Builder::new(BufWriter::new(file)));
        driver.mtime = core.header.create_date.max(0) as u64;
        Ok(driver)
    }

    fn read_toc_member(core: &mut ArchiveCore, reader: &mut TarReader) -> Result<(), Error> {
        let header = reader.position_to(core, TOC_FILE_NAME)?;
        let data = reader.read_member_to_vec(&header)?;
        let mut cursor = Cursor::new(data);
        let archive_header = ArchiveHeader::read(&mut cursor, ArchiveFormat::Tar)?;
        let codec = archive_header.codec();
        core.header = archive_header;
        core.toc = read_toc(&codec, &mut cursor, &mut read_file_extra)?;
        Ok(())
    }

    pub fn open(core: &mut ArchiveCore, path: &str) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| format_err!("could not open input file \"{}\": {}", path, err))?;
        let mut driver = Self::open_stream(core, Box::new(BufReader::new(file)))?;
        driver.path = Some(PathBuf::from(path));
        Ok(driver)
    }

    pub fn open_stream(core: &mut ArchiveCore, input: Box<dyn Read + Send>) -> Result<Self, Error> {
        let mut reader = TarReader::new(input);
        Self::read_toc_member(core, &mut reader)?;
        let mut driver = Self::empty(None);
        driver.reader = Some(reader);
        Ok(driver)
    }

    fn builder(&mut self) -> Result<&mut ::tar::Builder<BufWriter<File>>, Error> {
        match self.builder.as_mut() {
            Some(builder) => Ok(builder),
            None => bail!("archive is not open for writing"),
        }
    }

    fn append_member(&mut self, name: &str, data: &mut dyn Read, size: u64) -> Result<(), Error> {
        let mut header = ::tar::Header::new_ustar();
        header.set_path(name)?;
        header.set_size(size);
        header.set_mode(MEMBER_MODE);
        header.set_uid(MEMBER_UID);
        header.set_gid(MEMBER_GID);
        header.set_mtime(self.mtime);
        header.set_entry_type(::tar::EntryType::Regular);
        header.set_username(MEMBER_OWNER)?;
        header.set_groupname(MEMBER_OWNER)?;
        header.set_cksum();

        self.builder()?
            .append(&header, data)
            .map_err(|err| format_err!("could not write tar member \"{}\": {}", name, err))
    }

    fn append_staged(&mut self, staged: StagedMember) -> Result<(), Error> {
        let (name, mut file, size) = staged.into_file()?;
        self.append_member(&name, &mut file, size)
    }

    fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<(), Error> {
        let mut cursor = Cursor::new(data);
        self.append_member(name, &mut cursor, data.len() as u64)
    }

    fn staged(&mut self) -> Result<&mut StagedMember, Error> {
        match self.staged.as_mut() {
            Some(staged) => Ok(staged),
            None => bail!("no tar member is open"),
        }
    }

    fn reader(&mut self) -> Result<&mut TarReader, Error> {
        match self.reader.as_mut() {
            Some(reader) => Ok(reader),
            None => bail!("archive is not open for reading"),
        }
    }

    fn load_blobs(&mut self, core: &mut ArchiveCore, te: &TocEntry) -> Result<(), Error> {
        let blobs_toc = te.data_file().map(String::from);
        let mut found = false;

        core.start_restore_los()?;
        loop {
            let reader = self.reader()?;
            let header = match reader.next_header()? {
                Some(header) => header,
                None => break,
            };

            let oid: Option<Oid> = header
                .name
                .strip_prefix("blob_")
                .and_then(|rest| rest.split('.').next())
                .and_then(|oid| oid.parse().ok())
                .filter(|oid| *oid != 0);

            match oid {
                Some(oid) => {
                    core.start_restore_lo(oid)?;
                    reader.read_member(&header, |data| core.ahwrite(data))?;
                    core.end_restore_lo(oid)?;
                    found = true;
                }
                None => {
                    // the large object TOC follows the objects
                    if found || blobs_toc.as_deref() == Some(header.name.as_str()) {
                        break;
                    }
                }
            }
        }
        core.end_restore_los()
    }

    fn write_restore_script(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        let staged = StagedMember::new(RESTORE_SCRIPT_NAME.to_string())?;
        let script_file = staged
            .file
            .get_ref()
            .try_clone()
            .map_err(|err| format_err!("could not duplicate temporary file: {}", err))?;

        let previous = core.set_output(CompressFileHandle::to_writer(
            Box::new(script_file),
            CompressionSpec::NONE,
        )?);
        // the script never talks to a database
        let connection = core.connection.take();

        let result = (|| -> Result<(), Error> {
            core.ahprintf(format_args!("{}", RESTORE_SCRIPT_NOTE))?;
            let ropts = RestoreOptions {
                drop_schema: true,
                ..Default::default()
            };
            let blobs = std::mem::take(&mut self.blobs);
            let mut printer = ScriptPrinter { blobs: &blobs };
            let result = restore_archive(core, &mut printer, &ropts);
            self.blobs = blobs;
            result?;
            core.close_output()
        })();

        core.connection = connection;
        core.output = previous;
        result?;

        self.append_staged(staged)
    }
}

impl FormatDriver for TarDriver {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Tar
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
        let name = match core.entry(id)?.data_file() {
            Some(name) => name.to_string(),
            None => bail!("no data file name for entry {}", id),
        };
        self.staged = Some(StagedMember::new(name)?);
        Ok(())
    }

    fn write_data(&mut self, _core: &mut ArchiveCore, data: &[u8]) -> Result<(), Error> {
        self.staged()?.file.write_all(data).map_err(map_write_error)
    }

    fn end_data(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        match self.staged.take() {
            Some(staged) => self.append_staged(staged),
            None => bail!("no tar member is open"),
        }
    }

    fn abort_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        // the TOC is already written, keep the member but leave it empty
        let names: Vec<String> = [self.staged.take(), self.blobs_toc.take()]
            .into_iter()
            .flatten()
            .map(|staged| staged.name)
            .collect();
        for name in names {
            self.append_bytes(&name, &[])?;
        }
        self.current_blobs = None;
        self.blobs.remove(&id);

        // no data for restore.sql
        let te = core.entry_mut(id)?;
        te.dumper = None;
        te.had_dumper = false;
        Ok(())
    }

    fn start_los(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let name = match core.entry(id)?.data_file() {
            Some(name) => name.to_string(),
            None => bail!("no data file name for entry {}", id),
        };
        self.blobs_toc = Some(StagedMember::new(name)?);
        self.current_blobs = Some(id);
        self.blobs.insert(id, Vec::new());
        Ok(())
    }

    fn start_lo(&mut self, _core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        self.staged = Some(StagedMember::new(blob_file_name(oid))?);
        Ok(())
    }

    fn end_lo(&mut self, _core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        match self.staged.take() {
            Some(staged) => self.append_staged(staged)?,
            None => bail!("no tar member is open"),
        }
        let toc = match self.blobs_toc.as_mut() {
            Some(toc) => toc,
            None => bail!("large object TOC file is not open"),
        };
        writeln!(toc.file, "{} {}", oid, blob_file_name(oid)).map_err(map_write_error)?;
        if let Some(id) = self.current_blobs {
            self.blobs.entry(id).or_default().push(oid);
        }
        Ok(())
    }

    fn end_los(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        self.current_blobs = None;
        match self.blobs_toc.take() {
            Some(toc) => self.append_staged(toc),
            None => bail!("large object TOC file is not open"),
        }
    }

    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let te = core.entry(id)?.clone();
        let name = match te.data_file() {
            Some(name) => name.to_string(),
            None => return Ok(()),
        };

        if te.class == ObjectClass::Blobs {
            return self.load_blobs(core, &te);
        }

        let reader = self.reader()?;
        let header = reader.position_to(core, &name)?;
        reader.read_member(&header, |data| core.ahwrite(data))
    }

    fn print_extra_toc(&self, _core: &ArchiveCore, te: &TocEntry) -> Option<String> {
        te.data_file().map(|name| format!("File: {}", name))
    }

    fn begin_close(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        let mut toc = Vec::new();
        core.header.write(&mut toc)?;
        write_toc(&core.header.codec(), &core.toc, &mut toc, &mut write_file_extra)?;
        self.append_bytes(TOC_FILE_NAME, &toc)
    }

    fn finish_close(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        self.write_restore_script(core)?;

        let builder = match self.builder.take() {
            Some(builder) => builder,
            None => return Ok(()),
        };
        // writes the end of archive blocks
        let mut output = builder
            .into_inner()
            .map_err(|err| format_err!("could not write null block at end of tar archive: {}", err))?;
        output.flush().map_err(map_write_error)
    }

    fn reopen(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => bail!("cannot reopen stdin"),
        };
        if self.builder.is_some() {
            bail!("cannot reopen an archive that is still being written");
        }
        let file = File::open(&path)
            .map_err(|err| format_err!("could not open input file \"{}\": {}", path.display(), err))?;
        let mut reader = TarReader::new(Box::new(BufReader::new(file)));
        // positions the reader behind the TOC member
        let header = reader.position_to(core, TOC_FILE_NAME)?;
        let data = reader.read_member_to_vec(&header)?;
        core.header = ArchiveHeader::read(&mut Cursor::new(data), ArchiveFormat::Tar)?;
        self.reader = Some(reader);
        Ok(())
    }
}
