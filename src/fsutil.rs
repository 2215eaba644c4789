use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Create a file with restrictive permissions where supported.
///
/// On Unix, this maps to 0o600. On Windows, the default inherits ACLs; we just avoid world-writable flags.
///
/// # Errors
/// Returns an error if the file cannot be created/opened.
pub fn create_secure(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new().read(true).write(true).create(true).truncate(false).mode(0o600).open(path)
    }
    #[cfg(not(unix))]
    {
        OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)
    }
}

/// Open a file for read/write without truncation.
///
/// # Errors
/// Returns an error if the file cannot be opened.
pub fn open_rw_no_trunc(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)
}

/// Positional write that does not move the file cursor, so concurrent
/// appenders can fill disjoint reservations.
///
/// # Errors
/// Returns an error if the write fails or comes up short.
pub fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = file.seek_write(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "seek_write wrote 0 bytes"));
            }
            written += n;
        }
        Ok(())
    }
}

/// Positional read of exactly `buf.len()` bytes.
///
/// # Errors
/// Returns an error if the read fails or hits end of file early.
pub fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "seek_read hit EOF"));
            }
            read += n;
        }
        Ok(())
    }
}

/// Atomically replace `dst` with `src`. On Windows the destination must be
/// removed first; a crash between the remove and the rename leaves `src`
/// intact for manual recovery.
///
/// # Errors
/// Returns an error if the rename fails.
pub fn atomic_replace(src: &Path, dst: &Path) -> io::Result<()> {
    #[cfg(windows)]
    if dst.exists() {
        std::fs::remove_file(dst)?;
    }
    std::fs::rename(src, dst)
}
