use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Payload file at the end of the write chain.
pub trait SliceFile: Write + Send {
    /// fsync
    fn sync(&mut self) -> io::Result<()>;

    /// Reserves disk space without changing the file length.
    /// `Ok(false)` if the platform or filesystem does not support it.
    fn allocate(&mut self, size: u64) -> io::Result<bool>;

    fn len(&self) -> io::Result<u64>;
}

/// Opens payload files; tests swap it to observe or fail disk operations.
pub trait FileOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn SliceFile>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileOpener;

impl FileOpener for OsFileOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn SliceFile>> {
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o640);
        }
        Ok(Box::new(OsFile(opts.open(path)?)))
    }
}

pub struct OsFile(File);

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.0.write(buf) }
    fn flush(&mut self) -> io::Result<()> { self.0.flush() }
}

impl SliceFile for OsFile {
    fn sync(&mut self) -> io::Result<()> { self.0.sync_data() }

    #[cfg(target_os = "linux")]
    fn allocate(&mut self, size: u64) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;
        let len = libc::off_t::try_from(size).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "allocation size overflow"))?;
        // SAFETY: the descriptor is owned by `self.0` and stays open for the duration of the call.
        let rc = unsafe { libc::fallocate(self.0.as_raw_fd(), libc::FALLOC_FL_KEEP_SIZE, 0, len) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => Ok(false),
            _ => Err(err),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn allocate(&mut self, _size: u64) -> io::Result<bool> { Ok(false) }

    fn len(&self) -> io::Result<u64> { Ok(self.0.metadata()?.len()) }
}
