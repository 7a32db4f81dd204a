use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use flate2::Compression;

use pgarch_api_types::{CompressionAlgorithm, CompressionSpec};

use super::{probe_path, suffixed_path, DEFAULT_IO_BUFFER_SIZE};

type BoxedWriter = BufWriter<Box<dyn Write + Send>>;

enum FileWriter {
    Plain(BoxedWriter),
    Gzip(flate2::write::GzEncoder<BoxedWriter>),
    Lz4(lz4_flex::frame::FrameEncoder<BoxedWriter>),
    Zstd(zstd::stream::write::Encoder<'static, BoxedWriter>),
}

impl FileWriter {
    fn new(output: Box<dyn Write + Send>, spec: CompressionSpec) -> io::Result<Self> {
        let output = BufWriter::with_capacity(DEFAULT_IO_BUFFER_SIZE * 16, output);
        Ok(match spec.algorithm {
            CompressionAlgorithm::None => FileWriter::Plain(output),
            CompressionAlgorithm::Gzip => FileWriter::Gzip(flate2::write::GzEncoder::new(
                output,
                Compression::new(spec.level as u32),
            )),
            CompressionAlgorithm::Lz4 => FileWriter::Lz4(lz4_flex::frame::FrameEncoder::new(output)),
            CompressionAlgorithm::Zstd => {
                FileWriter::Zstd(zstd::stream::write::Encoder::new(output, spec.level)?)
            }
        })
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            FileWriter::Plain(writer) => writer,
            FileWriter::Gzip(writer) => writer,
            FileWriter::Lz4(writer) => writer,
            FileWriter::Zstd(writer) => writer,
        }
    }

    fn finish(self) -> io::Result<()> {
        let mut output = match self {
            FileWriter::Plain(writer) => writer,
            FileWriter::Gzip(writer) => writer.finish()?,
            FileWriter::Lz4(writer) => writer
                .finish()
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?,
            FileWriter::Zstd(writer) => writer.finish()?,
        };
        output.flush()
    }
}

enum HandleState {
    Reader(Box<dyn BufRead + Send>),
    Writer(FileWriter),
    Closed,
}

/// Byte stream handle over a (possibly compressed) file.
///
/// Read handles return short counts at end of file. Write handles must
/// be closed with [`close`](Self::close) to write the compression
/// trailer; dropping an open write handle finishes the stream but
/// ignores errors.
pub struct CompressFileHandle {
    path: Option<PathBuf>,
    algorithm: CompressionAlgorithm,
    state: HandleState,
    eof: bool,
    error: Option<String>,
}

fn algorithm_name(algorithm: CompressionAlgorithm) -> &'static str {
    match algorithm {
        CompressionAlgorithm::None => "file",
        CompressionAlgorithm::Gzip => "gzip",
        CompressionAlgorithm::Lz4 => "lz4",
        CompressionAlgorithm::Zstd => "zstd",
    }
}

fn reader_for(
    input: Box<dyn Read + Send>,
    algorithm: CompressionAlgorithm,
) -> io::Result<Box<dyn BufRead + Send>> {
    let capacity = DEFAULT_IO_BUFFER_SIZE * 16;
    Ok(match algorithm {
        CompressionAlgorithm::None => Box::new(BufReader::with_capacity(capacity, input)),
        CompressionAlgorithm::Gzip => Box::new(BufReader::with_capacity(
            capacity,
            flate2::read::MultiGzDecoder::new(input),
        )),
        CompressionAlgorithm::Lz4 => Box::new(BufReader::with_capacity(
            capacity,
            lz4_flex::frame::FrameDecoder::new(input),
        )),
        CompressionAlgorithm::Zstd => Box::new(BufReader::with_capacity(
            capacity,
            zstd::stream::read::Decoder::new(input)?,
        )),
    })
}

impl CompressFileHandle {
    /// Open `path` for reading, probing the bare name and then each
    /// known suffix. The compression is derived from the suffix found.
    pub fn open_read<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let (path, algorithm) = match probe_path(path) {
            Some(found) => found,
            None => bail!("could not open input file \"{}\": No such file or directory", path.display()),
        };
        Self::open_read_exact(&path, algorithm)
    }

    /// Open exactly `path` for reading with the given compression.
    pub fn open_read_exact<P: AsRef<Path>>(
        path: P,
        algorithm: CompressionAlgorithm,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| format_err!("could not open input file \"{}\": {}", path.display(), err))?;
        let reader = reader_for(Box::new(file), algorithm)
            .map_err(|err| format_err!("could not open input file \"{}\": {}", path.display(), err))?;
        Ok(Self {
            path: Some(path.to_owned()),
            algorithm,
            state: HandleState::Reader(reader),
            eof: false,
            error: None,
        })
    }

    /// Read from an already open stream, e.g. stdin.
    pub fn from_reader(
        input: Box<dyn Read + Send>,
        algorithm: CompressionAlgorithm,
    ) -> Result<Self, Error> {
        let reader = reader_for(input, algorithm)
            .map_err(|err| format_err!("could not open input stream: {}", err))?;
        Ok(Self {
            path: None,
            algorithm,
            state: HandleState::Reader(reader),
            eof: false,
            error: None,
        })
    }

    /// Create `path` with the suffix of `spec` appended.
    pub fn open_write<P: AsRef<Path>>(path: P, spec: CompressionSpec) -> Result<Self, Error> {
        let path = suffixed_path(path, spec.algorithm);
        Self::open_write_exact(path, spec)
    }

    /// Create exactly `path`, even if its suffix does not match `spec`.
    pub fn open_write_exact<P: AsRef<Path>>(path: P, spec: CompressionSpec) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| format_err!("could not open output file \"{}\": {}", path.display(), err))?;
        let writer = FileWriter::new(Box::new(file), spec)
            .map_err(|err| format_err!("could not open output file \"{}\": {}", path.display(), err))?;
        Ok(Self {
            path: Some(path.to_owned()),
            algorithm: spec.algorithm,
            state: HandleState::Writer(writer),
            eof: false,
            error: None,
        })
    }

    /// Write to an already open stream, e.g. stdout.
    pub fn to_writer(output: Box<dyn Write + Send>, spec: CompressionSpec) -> Result<Self, Error> {
        let writer = FileWriter::new(output, spec)
            .map_err(|err| format_err!("could not open output stream: {}", err))?;
        Ok(Self {
            path: None,
            algorithm: spec.algorithm,
            state: HandleState::Writer(writer),
            eof: false,
            error: None,
        })
    }

    /// Path of the underlying file, including the suffix actually used.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    fn record_error(&mut self, err: io::Error) -> io::Error {
        let msg = format!("{}: {}", algorithm_name(self.algorithm), err);
        self.error = Some(msg.clone());
        io::Error::new(err.kind(), msg)
    }

    fn reader(&mut self) -> io::Result<&mut Box<dyn BufRead + Send>> {
        match &mut self.state {
            HandleState::Reader(reader) => Ok(reader),
            HandleState::Writer(_) => proxmox_lang::io_bail!("stream is not open for reading"),
            HandleState::Closed => proxmox_lang::io_bail!("stream is already closed"),
        }
    }

    /// Fill as much of `buf` as possible. A short count means end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let res = self.reader()?.read(&mut buf[done..]);
            match res {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(count) => done += count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.record_error(err)),
            }
        }
        Ok(done)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let res = match &mut self.state {
            HandleState::Writer(writer) => writer.writer().write_all(buf),
            HandleState::Reader(_) => proxmox_lang::io_bail!("stream is not open for writing"),
            HandleState::Closed => proxmox_lang::io_bail!("stream is already closed"),
        };
        res.map_err(|err| self.record_error(err))
    }

    /// Read one line (including the newline) into `line`.
    ///
    /// Returns `false` at end of file.
    pub fn gets(&mut self, line: &mut String) -> io::Result<bool> {
        line.clear();
        let res = self.reader()?.read_line(line);
        match res {
            Ok(0) => {
                self.eof = true;
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(err) => Err(self.record_error(err)),
        }
    }

    /// Read a single byte, `None` at end of file.
    pub fn getc(&mut self) -> io::Result<Option<u8>> {
        let res = self.reader()?.fill_buf().map(|buf| buf.first().copied());
        match res {
            Ok(Some(byte)) => {
                self.reader()?.consume(1);
                Ok(Some(byte))
            }
            Ok(None) => {
                self.eof = true;
                Ok(None)
            }
            Err(err) => Err(self.record_error(err)),
        }
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Last error reported by the compression library or the file.
    pub fn get_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Finish the stream. Calling this more than once is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, HandleState::Closed) {
            HandleState::Writer(writer) => writer.finish().map_err(|err| self.record_error(err)),
            HandleState::Reader(_) | HandleState::Closed => Ok(()),
        }
    }
}

impl Read for CompressFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.reader()?.read(buf);
        match res {
            Ok(0) if !buf.is_empty() => {
                self.eof = true;
                Ok(0)
            }
            Ok(count) => Ok(count),
            Err(err) => Err(self.record_error(err)),
        }
    }
}

impl Write for CompressFileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        CompressFileHandle::write_all(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            HandleState::Writer(FileWriter::Plain(writer)) => writer.flush(),
            // compressed streams are flushed on close
            _ => Ok(()),
        }
    }
}

impl Drop for CompressFileHandle {
    fn drop(&mut self) {
        if let HandleState::Writer(_) = self.state {
            if let Err(err) = self.close() {
                log::error!("closing compressed stream failed - {}", err);
            }
        }
    }
}
