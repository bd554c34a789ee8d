use std::io::{self, Write};

use flate2::write::GzEncoder;

use crate::model::{Compression, CompressionType};

/// Transparent compression stage of the write chain.
pub enum CompressionWriter<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressionWriter<W> {
    pub fn new(inner: W, c: &Compression) -> io::Result<Self> {
        Ok(match c.kind {
            CompressionType::None => CompressionWriter::None(inner),
            CompressionType::Gzip => CompressionWriter::Gzip(GzEncoder::new(inner, flate2::Compression::new(c.level() as u32))),
            CompressionType::Zstd => CompressionWriter::Zstd(zstd::stream::write::Encoder::new(inner, c.level())?),
        })
    }

    pub fn get_mut(&mut self) -> &mut W {
        match self {
            CompressionWriter::None(w) => w,
            CompressionWriter::Gzip(e) => e.get_mut(),
            CompressionWriter::Zstd(e) => e.get_mut(),
        }
    }

    /// Writes the stream trailer and returns the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressionWriter::None(w) => Ok(w),
            CompressionWriter::Gzip(e) => e.finish(),
            CompressionWriter::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for CompressionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressionWriter::None(w) => w.write(buf),
            CompressionWriter::Gzip(e) => e.write(buf),
            CompressionWriter::Zstd(e) => e.write(buf),
        }
    }

    /// Compressors emit everything buffered so far as a complete block.
    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressionWriter::None(w) => w.flush(),
            CompressionWriter::Gzip(e) => e.flush(),
            CompressionWriter::Zstd(e) => e.flush(),
        }
    }
}
