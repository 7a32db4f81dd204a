//! Custom format: one file holding header, TOC and data blocks.
//!
//! Layout: header, TOC, then one block per data-bearing entry in TOC
//! order. A data block is the block type byte, the dump id and a series
//! of length prefixed compressed chunks ended by a zero length. A large
//! object block holds, per object, the OID followed by such a chunk
//! series, and ends with OID 0.
//!
//! The TOC is written before the data, with unknown data offsets, and
//! rewritten in place once all data is written if the output is seekable.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};

use pgarch_api_types::{ArchiveFormat, DumpId, ObjectClass, Oid};
use pgarch_tools::compression::{read_compressed, Compressor, ReadChunk, WriteChunk};

use crate::archive::ArchiveCore;
use crate::codec::{map_write_error, Codec};
use crate::error::ArchiveError;
use crate::file_formats::*;
use crate::format::{is_std_stream, stdout_file, FormatDriver};
use crate::header::{read_toc, write_toc, ArchiveHeader};
use crate::restore::{toc_entry_required, Requirement};
use crate::toc::{FormatExtra, TocEntry};

fn io_error(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// Output file keeping track of the write position.
struct BlockWriter {
    inner: BufWriter<File>,
    pos: u64,
    seekable: bool,
}

impl BlockWriter {
    fn new(file: File) -> Self {
        let seekable = file
            .metadata()
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(false);
        Self {
            inner: BufWriter::new(file),
            pos: 0,
            seekable,
        }
    }

    /// Move to `pos`, only used to rewrite the TOC.
    fn seek_to(&mut self, pos: u64) -> Result<(), Error> {
        self.inner
            .seek(SeekFrom::Start(pos))
            .map_err(|err| format_err!("error during file seek: {}", err))?;
        self.pos = pos;
        Ok(())
    }

    fn finish(mut self) -> Result<(), Error> {
        self.inner.flush().map_err(map_write_error)?;
        let file = self
            .inner
            .into_inner()
            .map_err(|err| format_err!("could not write to output file: {}", err.error()))?;
        if self.seekable {
            nix::unistd::fsync(file.as_raw_fd())
                .map_err(|err| format_err!("could not fsync output file: {}", err))?;
        }
        Ok(())
    }
}

impl Write for BlockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.pos += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes compressed chunks into the archive file.
struct ChunkSink {
    writer: BlockWriter,
    codec: Codec,
}

impl WriteChunk for ChunkSink {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.codec
            .write_int(&mut self.writer, data.len() as i32)
            .map_err(io_error)?;
        self.writer.write_all(data)
    }
}

/// Reads length prefixed chunks of one block.
struct ChunkSource<'a> {
    reader: &'a mut dyn Read,
    codec: Codec,
}

impl<'a> ReadChunk for ChunkSource<'a> {
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        let len = self.codec.read_int(self.reader).map_err(io_error)?;
        if len == 0 {
            return Ok(false);
        }
        if len < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid data chunk length {}", len),
            ));
        }
        buf.resize(len as usize, 0);
        self.reader.read_exact(buf)?;
        Ok(true)
    }
}

enum Input {
    File(BufReader<File>),
    Stream(BufReader<Box<dyn Read + Send>>),
}

impl Input {
    fn reader(&mut self) -> &mut dyn Read {
        match self {
            Input::File(reader) => reader,
            Input::Stream(reader) => reader,
        }
    }
}

/// Driver of the custom archive format.
pub struct CustomDriver {
    path: Option<PathBuf>,
    output: Option<BlockWriter>,
    compressor: Option<Compressor<ChunkSink>>,
    toc_pos: u64,
    input: Option<Input>,
    /// Position of the first data block.
    data_start: u64,
}

fn offset_of(te: &TocEntry) -> (u8, u64) {
    match te.extra {
        FormatExtra::Offset { state, pos } => (state, pos),
        _ if te.has_data() => (K_OFFSET_POS_NOT_SET, 0),
        _ => (K_OFFSET_NO_DATA, 0),
    }
}

fn read_offset_extra(codec: &Codec, reader: &mut dyn Read) -> Result<FormatExtra, Error> {
    let (state, pos) = codec.read_offset(reader)?;
    Ok(FormatExtra::Offset { state, pos })
}

fn write_offset_extra(codec: &Codec, te: &TocEntry, writer: &mut dyn Write) -> Result<(), Error> {
    let (state, pos) = offset_of(te);
    codec.write_offset(writer, state, pos)
}

impl CustomDriver {
    pub fn create(core: &mut ArchiveCore, path: &str) -> Result<Self, Error> {
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

        log::debug!(
            "writing custom archive with {} compression",
            core.header.compression
        );

        Ok(Self {
            path,
            output: Some(BlockWriter::new(file)),
            compressor: None,
            toc_pos: 0,
            input: None,
            data_start: 0,
        })
    }

    fn read_archive(core: &mut ArchiveCore, reader: &mut dyn Read) -> Result<(), Error> {
        let header = ArchiveHeader::read(reader, ArchiveFormat::Custom)?;
        let codec = header.codec();
        core.header = header;
        core.toc = read_toc(&codec, reader, &mut read_offset_extra)?;
        Ok(())
    }

    pub fn open(core: &mut ArchiveCore, path: &str) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| format_err!("could not open input file \"{}\": {}", path, err))?;
        let seekable = file
            .metadata()
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(false);

        let mut driver = Self {
            path: Some(PathBuf::from(path)),
            output: None,
            compressor: None,
            toc_pos: 0,
            input: None,
            data_start: 0,
        };

        if seekable {
            let mut reader = BufReader::new(file);
            Self::read_archive(core, &mut reader)?;
            driver.data_start = reader
                .stream_position()
                .map_err(|err| format_err!("could not determine seek position in archive file: {}", err))?;
            driver.input = Some(Input::File(reader));
        } else {
            // named pipe or similar
            let mut reader: BufReader<Box<dyn Read + Send>> = BufReader::new(Box::new(file));
            Self::read_archive(core, &mut reader)?;
            driver.input = Some(Input::Stream(reader));
        }

        Ok(driver)
    }

    pub fn open_stream(core: &mut ArchiveCore, input: Box<dyn Read + Send>) -> Result<Self, Error> {
        let mut reader = BufReader::new(input);
        Self::read_archive(core, &mut reader)?;
        Ok(Self {
            path: None,
            output: None,
            compressor: None,
            toc_pos: 0,
            input: Some(Input::Stream(reader)),
            data_start: 0,
        })
    }

    fn writer(&mut self) -> Result<&mut BlockWriter, Error> {
        match self.output.as_mut() {
            Some(writer) => Ok(writer),
            None => bail!("archive is not open for writing"),
        }
    }

    fn write_toc(&mut self, core: &ArchiveCore) -> Result<(), Error> {
        let codec = core.header.codec();
        let writer = self.writer()?;
        write_toc(&codec, &core.toc, writer, &mut write_offset_extra)
    }

    /// Start a block, recording its position in the TOC entry.
    fn start_block(&mut self, core: &mut ArchiveCore, id: DumpId, block_type: u8) -> Result<(), Error> {
        let codec = core.header.codec();
        let writer = self.writer()?;
        let pos = writer.pos;
        codec.write_byte(writer, block_type)?;
        codec.write_int(writer, id)?;
        core.entry_mut(id)?.extra = FormatExtra::Offset {
            state: K_OFFSET_POS_SET,
            pos,
        };
        Ok(())
    }

    fn start_compressor(&mut self, core: &ArchiveCore) -> Result<(), Error> {
        let writer = match self.output.take() {
            Some(writer) => writer,
            None => bail!("archive is not open for writing"),
        };
        let sink = ChunkSink {
            writer,
            codec: core.header.codec(),
        };
        self.compressor = Some(Compressor::new(sink, core.header.compression)?);
        Ok(())
    }

    /// Flush the compressor and terminate the chunk series.
    fn end_compressor(&mut self) -> Result<(), Error> {
        let compressor = match self.compressor.take() {
            Some(compressor) => compressor,
            None => bail!("no data block is open"),
        };
        let mut sink = compressor.end()?;
        sink.codec.write_int(&mut sink.writer, 0)?;
        self.output = Some(sink.writer);
        Ok(())
    }

    fn input(&mut self) -> Result<&mut Input, Error> {
        match self.input.as_mut() {
            Some(input) => Ok(input),
            None => bail!("archive is not open for reading"),
        }
    }

    fn is_seekable(&self) -> bool {
        matches!(self.input, Some(Input::File(_)))
    }

    /// Read the next block header. `None` at the end of the archive.
    fn read_block_header(&mut self, codec: &Codec) -> Result<Option<(u8, DumpId)>, Error> {
        let reader = self.input()?.reader();
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => bail!("could not read from input file: {}", err),
            }
        }
        let id = codec.read_int(reader)?;
        Ok(Some((byte[0], id)))
    }

    fn skip_chunks(reader: &mut dyn Read, codec: &Codec) -> Result<(), Error> {
        loop {
            let len = codec.read_int(reader)?;
            if len <= 0 {
                return Ok(());
            }
            let copied = io::copy(&mut (&mut *reader).take(len as u64), &mut io::sink())
                .map_err(|err| format_err!("could not read from input file: {}", err))?;
            if copied < len as u64 {
                return Err(ArchiveError::TruncatedFile.into());
            }
        }
    }

    fn skip_block(&mut self, codec: &Codec, block_type: u8) -> Result<(), Error> {
        let reader = self.input()?.reader();
        match block_type {
            BLK_DATA => Self::skip_chunks(reader, codec),
            BLK_BLOBS => loop {
                let oid = codec.read_int(reader)?;
                if oid == 0 {
                    return Ok(());
                }
                Self::skip_chunks(reader, codec)?;
            },
            other => bail!("unrecognized data block type ({}) while searching archive", other),
        }
    }

    /// Position the input at the data block of `id` and consume its
    /// header.
    fn find_block(&mut self, core: &ArchiveCore, id: DumpId) -> Result<u8, Error> {
        let codec = core.header.codec();
        let (state, pos) = offset_of(core.entry(id)?);

        if self.is_seekable() {
            let target = if state == K_OFFSET_POS_SET {
                pos
            } else {
                self.data_start
            };
            if let Input::File(reader) = self.input()? {
                reader
                    .seek(SeekFrom::Start(target))
                    .map_err(|err| format_err!("error during file seek: {}", err))?;
            }
        }

        loop {
            let (block_type, block_id) = match self.read_block_header(&codec)? {
                Some(header) => header,
                None => {
                    let msg = if self.is_seekable() {
                        format!(
                            "could not find block ID {} in archive -- possibly due to out-of-order restore request, which cannot be handled due to lack of data offsets in archive",
                            id
                        )
                    } else {
                        format!(
                            "could not find block ID {} in archive -- possibly due to out-of-order restore request, which cannot be handled due to non-seekable input file",
                            id
                        )
                    };
                    return Err(ArchiveError::OutOfOrder(msg).into());
                }
            };

            if block_id == id {
                return Ok(block_type);
            }

            if self.is_seekable() && state == K_OFFSET_POS_SET {
                bail!(
                    "found unexpected block ID ({}) when reading data -- expected {}",
                    block_id,
                    id
                );
            }

            // a block we pass now cannot be read later from a stream
            if !self.is_seekable() && core.restoring {
                if let Some(skipped) = core.toc.get(block_id) {
                    if !skipped.printed
                        && toc_entry_required(skipped, &core.ropts).contains(Requirement::DATA)
                    {
                        return Err(ArchiveError::OutOfOrder(
                            "dumping a specific TOC data block out of order is not supported without ID on this input stream (fseek required)"
                                .to_string(),
                        )
                        .into());
                    }
                }
            }

            log::debug!("skipping data block of entry {}", block_id);
            self.skip_block(&codec, block_type)?;
        }
    }

    fn print_blobs(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        let codec = core.header.codec();
        let algorithm = core.header.compression.algorithm;

        core.start_restore_los()?;
        loop {
            let reader = self.input()?.reader();
            let oid = codec.read_int(reader)?;
            if oid == 0 {
                break;
            }
            core.start_restore_lo(oid as Oid)?;
            let mut source = ChunkSource { reader, codec };
            read_compressed(&mut source, algorithm, |data| core.ahwrite(data))?;
            core.end_restore_lo(oid as Oid)?;
        }
        core.end_restore_los()
    }
}

impl FormatDriver for CustomDriver {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Custom
    }

    fn archive_entry(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let te = core.entry_mut(id)?;
        let state = if te.dumper.is_some() {
            K_OFFSET_POS_NOT_SET
        } else {
            K_OFFSET_NO_DATA
        };
        te.extra = FormatExtra::Offset { state, pos: 0 };
        Ok(())
    }

    fn start_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        self.start_block(core, id, BLK_DATA)?;
        self.start_compressor(core)
    }

    fn write_data(&mut self, _core: &mut ArchiveCore, data: &[u8]) -> Result<(), Error> {
        match self.compressor.as_mut() {
            Some(compressor) => compressor.write_data(data),
            None => bail!("no data block is open"),
        }
    }

    fn end_data(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        self.end_compressor()
    }

    fn abort_data(&mut self, _core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        // terminate whatever is open so the following blocks stay readable
        if self.compressor.is_some() {
            self.end_compressor()?;
        }
        Ok(())
    }

    fn start_los(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        self.start_block(core, id, BLK_BLOBS)
    }

    fn start_lo(&mut self, core: &mut ArchiveCore, oid: Oid) -> Result<(), Error> {
        let codec = core.header.codec();
        codec.write_int(self.writer()?, oid as i32)?;
        self.start_compressor(core)
    }

    fn end_lo(&mut self, _core: &mut ArchiveCore, _oid: Oid) -> Result<(), Error> {
        self.end_compressor()
    }

    fn end_los(&mut self, core: &mut ArchiveCore, _id: DumpId) -> Result<(), Error> {
        if self.compressor.is_some() {
            self.end_compressor()?;
        }
        let codec = core.header.codec();
        codec.write_int(self.writer()?, 0)
    }

    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error> {
        let (state, _) = offset_of(core.entry(id)?);
        if state == K_OFFSET_NO_DATA {
            return Ok(());
        }

        let block_type = self.find_block(core, id)?;
        let codec = core.header.codec();
        let algorithm = core.header.compression.algorithm;
        let is_blobs = core.entry(id)?.class == ObjectClass::Blobs;

        match block_type {
            BLK_DATA => {
                let reader = self.input()?.reader();
                let mut source = ChunkSource { reader, codec };
                read_compressed(&mut source, algorithm, |data| core.ahwrite(data))
            }
            BLK_BLOBS if is_blobs => self.print_blobs(core),
            BLK_BLOBS => bail!("large object block found for non BLOBS entry {}", id),
            other => bail!("unrecognized data block type {} while restoring archive", other),
        }
    }

    fn print_extra_toc(&self, _core: &ArchiveCore, te: &TocEntry) -> Option<String> {
        match offset_of(te) {
            (K_OFFSET_POS_SET, pos) => Some(format!("Data Pos: {}", pos)),
            _ => None,
        }
    }

    fn begin_close(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        let writer = self.writer()?;
        core.header.write(writer)?;
        let toc_pos = writer.pos;
        self.toc_pos = toc_pos;
        self.write_toc(core)
    }

    fn finish_close(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        if self.compressor.is_some() {
            self.end_compressor()?;
        }

        let toc_pos = self.toc_pos;
        let seekable = self.writer()?.seekable;
        if seekable {
            // offsets are fixed width, the new TOC has the same size
            self.writer()?.seek_to(toc_pos)?;
            self.write_toc(core)?;
        } else {
            log::debug!("output is not seekable, data offsets stay unknown");
        }

        match self.output.take() {
            Some(writer) => writer.finish(),
            None => Ok(()),
        }
    }

    fn supports_parallel(&self) -> bool {
        // only restores, all data blocks go through one writer
        self.output.is_none() && self.is_seekable() && self.path.is_some()
    }

    fn prep_parallel_restore(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        let mut positions: Vec<(u64, DumpId)> = core
            .toc
            .iter()
            .filter_map(|te| match offset_of(te) {
                (K_OFFSET_POS_SET, pos) => Some((pos, te.dump_id)),
                _ => None,
            })
            .collect();
        positions.sort_unstable();

        let end = match &self.path {
            Some(path) => std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0),
            None => 0,
        };

        for i in 0..positions.len() {
            let (pos, id) = positions[i];
            let next = positions.get(i + 1).map(|(pos, _)| *pos).unwrap_or(end);
            core.entry_mut(id)?.data_length = next.saturating_sub(pos);
        }
        Ok(())
    }

    fn clone_for_worker(&self, _core: &ArchiveCore) -> Result<Box<dyn FormatDriver>, Error> {
        let path = match &self.path {
            Some(path) if self.is_seekable() => path,
            _ => bail!("parallel restore from standard input is not supported"),
        };
        let file = File::open(path)
            .map_err(|err| format_err!("could not open input file \"{}\": {}", path.display(), err))?;
        Ok(Box::new(CustomDriver {
            path: Some(path.clone()),
            output: None,
            compressor: None,
            toc_pos: 0,
            input: Some(Input::File(BufReader::new(file))),
            data_start: self.data_start,
        }))
    }

    fn reopen(&mut self, core: &mut ArchiveCore) -> Result<(), Error> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => bail!("cannot reopen stdin"),
        };
        if self.output.is_some() {
            bail!("cannot reopen an archive that is still being written");
        }

        let file = File::open(&path)
            .map_err(|err| format_err!("could not open input file \"{}\": {}", path.display(), err))?;
        let mut reader = BufReader::new(file);
        // skip header and TOC, the entries are already known
        let header = ArchiveHeader::read(&mut reader, ArchiveFormat::Custom)?;
        read_toc(&header.codec(), &mut reader, &mut read_offset_extra)?;
        self.data_start = reader
            .stream_position()
            .map_err(|err| format_err!("could not determine seek position in archive file: {}", err))?;
        self.input = Some(Input::File(reader));

        core.header = header;
        Ok(())
    }
}
