//! Flat-file persistence shared by both caches.
//!
//! The cache files are the single authoritative state the same binary
//! may revisit across runs, and several processes may share them, so
//! every load-modify-save cycle holds an advisory `flock` on the backing
//! file. Loads are skipped entirely when the file's modification time is
//! unchanged since the last parse.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::error;

use crate::error::Error;

/// What a call to `load` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No backing file is configured, or the file does not exist; the
    /// store keeps its current contents.
    NoFile,
    /// The file has not changed since the last parse; nothing was
    /// re-read.
    Unchanged,
    /// The file was parsed.
    Loaded,
}

/// Read the backing file line by line, skipping blank lines and `#`
/// comments, handing everything else to `on_line`.
///
/// Returns [`LoadOutcome::Unchanged`] without touching the file contents
/// when its mtime equals the last recorded parse time. Holds a shared
/// advisory lock while reading.
pub fn load_lines<F>(path: Option<&Path>, last_load: &AtomicI64, mut on_line: F) -> Result<LoadOutcome, Error>
where
    F: FnMut(&str),
{
    let Some(path) = path else {
        return Ok(LoadOutcome::NoFile);
    };
    let file = match File::open(path) {
        Ok(f) => f,
        // An absent cache file is an empty store, not an error.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LoadOutcome::NoFile),
        Err(e) => return Err(Error::Io(e)),
    };
    flock(&file, false)?;

    let mtime = mtime_secs(&file)?;
    if mtime == last_load.load(Ordering::Acquire) {
        return Ok(LoadOutcome::Unchanged);
    }
    last_load.store(mtime, Ordering::Release);

    if let Err(e) = parse_from(&file, &mut on_line) {
        error!(path = %path.display(), %e, "failed to read cache file");
        // Force a re-parse on the next load attempt.
        last_load.store(0, Ordering::Release);
        return Err(Error::Io(e));
    }
    Ok(LoadOutcome::Loaded)
}

/// Rewrite the backing file atomically with respect to other processes.
///
/// Takes an exclusive advisory lock for the whole cycle: any records
/// another process wrote since our last parse are first fed through
/// `reload_line` (the same merge-on-add path as a load), then the file is
/// truncated and `write` emits the merged state.
pub fn update_file<F, W>(path: Option<&Path>, last_load: &AtomicI64, mut reload_line: F, write: W) -> Result<(), Error>
where
    F: FnMut(&str),
    W: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let Some(path) = path else {
        return Err(Error::NoBackingFile);
    };
    let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    flock(&file, true)?;

    let mtime = mtime_secs(&file)?;
    if mtime != last_load.load(Ordering::Acquire) {
        parse_from(&file, &mut reload_line)?;
    }

    file.set_len(0)?;
    (&file).seek(SeekFrom::Start(0))?;
    let mut writer = BufWriter::new(&file);
    if let Err(e) = write(&mut writer).and_then(|()| writer.flush()) {
        error!(path = %path.display(), %e, "failed to write cache file");
        last_load.store(0, Ordering::Release);
        return Err(Error::Io(e));
    }
    drop(writer);

    last_load.store(mtime_secs(&file)?, Ordering::Release);
    Ok(())
}

fn parse_from(file: &File, on_line: &mut impl FnMut(&str)) -> io::Result<()> {
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line?;
        // Strips trailing \r as well as surrounding whitespace.
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        on_line(line);
    }
    Ok(())
}

fn mtime_secs(file: &File) -> io::Result<i64> {
    let modified = file.metadata()?.modified()?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0))
}

/// Advisory lock on an open cache file: shared for loads, exclusive for
/// read-modify-write save cycles. Blocking; released when the file is
/// closed.
fn flock(file: &File, exclusive: bool) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        // SAFETY: flock is a plain POSIX call on a valid descriptor
        // owned by `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (file, exclusive);
    }
    Ok(())
}
