use std::io::{self, Read, Write};

use anyhow::{format_err, Error};
use flate2::Compression;

use proxmox_io::ByteBuffer;

use pgarch_api_types::{CompressionAlgorithm, CompressionSpec};

use super::DEFAULT_IO_BUFFER_SIZE;

/// Destination of compressed chunks.
pub trait WriteChunk {
    /// Store one chunk. Never called with an empty slice, because a zero
    /// length chunk terminates a block on disk.
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Source of compressed chunks.
pub trait ReadChunk {
    /// Replace the contents of `buf` with the next chunk.
    ///
    /// Returns `false` when the end-of-block marker was read.
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<bool>;
}

impl<T: WriteChunk + ?Sized> WriteChunk for &mut T {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_chunk(data)
    }
}

impl<T: ReadChunk + ?Sized> ReadChunk for &mut T {
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        (**self).read_chunk(buf)
    }
}

/// Collects compressor output into a bounded buffer and hands it to the
/// sink whenever the buffer is full.
struct ChunkBuffer<S> {
    sink: S,
    buffer: ByteBuffer,
}

impl<S: WriteChunk> ChunkBuffer<S> {
    fn new(sink: S) -> Self {
        Self {
            sink,
            buffer: ByteBuffer::with_capacity(DEFAULT_IO_BUFFER_SIZE),
        }
    }

    fn flush_chunk(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sink.write_chunk(&self.buffer)?;
        let len = self.buffer.len();
        self.buffer.consume(len);
        Ok(())
    }

    fn finish(mut self) -> io::Result<S> {
        self.flush_chunk()?;
        Ok(self.sink)
    }
}

impl<S: WriteChunk> Write for ChunkBuffer<S> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buffer.is_full() {
            self.flush_chunk()?;
        }
        let count = self.buffer.free_size().min(data.len());
        self.buffer.get_free_mut_slice()[..count].copy_from_slice(&data[..count]);
        self.buffer.add_size(count);
        if self.buffer.is_full() {
            self.flush_chunk()?;
        }
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        // partial chunks are only written at the end of the block
        Ok(())
    }
}

enum CompressorState<S: WriteChunk> {
    Plain(ChunkBuffer<S>),
    Gzip(flate2::write::ZlibEncoder<ChunkBuffer<S>>),
    Lz4(lz4_flex::frame::FrameEncoder<ChunkBuffer<S>>),
    Zstd(zstd::stream::write::Encoder<'static, ChunkBuffer<S>>),
}

/// Streaming compressor writing length prefixed chunks to a sink.
///
/// Memory use is bounded by one output buffer plus the state of the
/// compression library.
pub struct Compressor<S: WriteChunk> {
    state: CompressorState<S>,
}

impl<S: WriteChunk> Compressor<S> {
    pub fn new(sink: S, spec: CompressionSpec) -> Result<Self, Error> {
        let buffer = ChunkBuffer::new(sink);
        let state = match spec.algorithm {
            CompressionAlgorithm::None => CompressorState::Plain(buffer),
            CompressionAlgorithm::Gzip => CompressorState::Gzip(flate2::write::ZlibEncoder::new(
                buffer,
                Compression::new(spec.level as u32),
            )),
            CompressionAlgorithm::Lz4 => {
                CompressorState::Lz4(lz4_flex::frame::FrameEncoder::new(buffer))
            }
            CompressionAlgorithm::Zstd => CompressorState::Zstd(
                zstd::stream::write::Encoder::new(buffer, spec.level)
                    .map_err(|err| format_err!("could not initialize compression library: {}", err))?,
            ),
        };
        Ok(Self { state })
    }

    /// Compress `data` and emit full chunks to the sink.
    pub fn write_data(&mut self, data: &[u8]) -> Result<(), Error> {
        let res = match &mut self.state {
            CompressorState::Plain(buffer) => buffer.write_all(data),
            CompressorState::Gzip(encoder) => encoder.write_all(data),
            CompressorState::Lz4(encoder) => encoder.write_all(data),
            CompressorState::Zstd(encoder) => encoder.write_all(data),
        };
        res.map_err(|err| format_err!("could not compress data: {}", err))
    }

    /// Flush all pending output and return the sink.
    pub fn end(self) -> Result<S, Error> {
        let buffer = match self.state {
            CompressorState::Plain(buffer) => buffer,
            CompressorState::Gzip(encoder) => encoder
                .finish()
                .map_err(|err| format_err!("could not close compression stream: {}", err))?,
            CompressorState::Lz4(encoder) => encoder
                .finish()
                .map_err(|err| format_err!("could not end compression: {}", err))?,
            CompressorState::Zstd(encoder) => encoder
                .finish()
                .map_err(|err| format_err!("could not close compression stream: {}", err))?,
        };
        Ok(buffer.finish()?)
    }
}

/// Adapts a chunk source to `std::io::Read`.
struct ChunkReader<R> {
    source: R,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: ReadChunk> ChunkReader<R> {
    fn new(source: R) -> Self {
        Self {
            source,
            chunk: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    /// Skip everything up to and including the end-of-block marker.
    fn drain(&mut self) -> io::Result<()> {
        while !self.done {
            if !self.source.read_chunk(&mut self.chunk)? {
                self.done = true;
            }
        }
        self.chunk.clear();
        self.pos = 0;
        Ok(())
    }
}

impl<R: ReadChunk> Read for ChunkReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            if self.done {
                return Ok(0);
            }
            self.pos = 0;
            if !self.source.read_chunk(&mut self.chunk)? {
                self.done = true;
                self.chunk.clear();
                return Ok(0);
            }
        }
        let count = buf.len().min(self.chunk.len() - self.pos);
        buf[..count].copy_from_slice(&self.chunk[self.pos..(self.pos + count)]);
        self.pos += count;
        Ok(count)
    }
}

fn pump<D: Read, F>(decoder: &mut D, output: &mut F) -> Result<(), Error>
where
    F: FnMut(&[u8]) -> Result<(), Error>,
{
    let mut buf = vec![0u8; DEFAULT_IO_BUFFER_SIZE * 4];
    loop {
        let count = decoder
            .read(&mut buf)
            .map_err(|err| format_err!("could not uncompress data: {}", err))?;
        if count == 0 {
            return Ok(());
        }
        output(&buf[..count])?;
    }
}

/// Read one block of chunks from `source`, decompress it and pass the
/// result to `output`.
///
/// The source is always consumed up to and including its end-of-block
/// marker, so it is positioned at whatever follows the block.
pub fn read_compressed<R, F>(
    source: &mut R,
    algorithm: CompressionAlgorithm,
    mut output: F,
) -> Result<(), Error>
where
    R: ReadChunk + ?Sized,
    F: FnMut(&[u8]) -> Result<(), Error>,
{
    let reader = ChunkReader::new(source);

    match algorithm {
        CompressionAlgorithm::None => {
            let mut reader = reader;
            let mut chunk = Vec::new();
            while reader.source.read_chunk(&mut chunk)? {
                if !chunk.is_empty() {
                    output(&chunk)?;
                }
            }
        }
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::ZlibDecoder::new(reader);
            pump(&mut decoder, &mut output)?;
            decoder.get_mut().drain()?;
        }
        CompressionAlgorithm::Lz4 => {
            let mut decoder = lz4_flex::frame::FrameDecoder::new(reader);
            pump(&mut decoder, &mut output)?;
            decoder.get_mut().drain()?;
        }
        CompressionAlgorithm::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|err| format_err!("could not initialize compression library: {}", err))?;
            pump(&mut decoder, &mut output)?;
            decoder.get_mut().get_mut().drain()?;
        }
    }

    Ok(())
}
