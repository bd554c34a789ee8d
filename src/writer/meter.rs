use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts bytes passing through; the counter can be read without the chain lock.
pub struct SizeMeter<W> {
    inner: W,
    bytes: Arc<AtomicU64>,
}

impl<W: Write> SizeMeter<W> {
    pub fn new(inner: W, initial: u64) -> Self { Self { inner, bytes: Arc::new(AtomicU64::new(initial)) } }

    pub fn counter(&self) -> Arc<AtomicU64> { self.bytes.clone() }

    pub fn size(&self) -> u64 { self.bytes.load(Ordering::Acquire) }

    pub fn get_mut(&mut self) -> &mut W { &mut self.inner }

    pub fn into_inner(self) -> W { self.inner }
}

impl<W: Write> Write for SizeMeter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}
