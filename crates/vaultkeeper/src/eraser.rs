//! Overwrite-then-unlink deletion for files that held plaintext
//!
//! Best effort: on SSDs and copy-on-write filesystems the old blocks may
//! survive. Failures degrade to a plain unlink and are reported as an
//! [`Advisory`]; nothing here returns an error.

use crate::error::Advisory;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

/// Minimum number of random overwrite passes
pub const MIN_PASSES: u32 = 3;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Shred `path` with the minimum number of passes
pub fn secure_delete(path: &Path) -> Advisory {
    secure_delete_with_passes(path, MIN_PASSES)
}

/// Shred `path` with `passes` random overwrites (never fewer than [`MIN_PASSES`])
pub fn secure_delete_with_passes(path: &Path, passes: u32) -> Advisory {
    shred(path, passes.max(MIN_PASSES), overwrite)
}

fn shred(path: &Path, passes: u32, scrub: impl FnOnce(&Path, u32) -> io::Result<()>) -> Advisory {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Advisory::Completed,
        Err(e) => return plain_delete(path, &format!("stat failed: {e}")),
        Ok(meta) if !meta.is_file() => {
            return Advisory::failure(format!("{} is not a regular file", path.display()))
        }
        Ok(_) => {}
    }

    if let Err(e) = scrub(path, passes) {
        tracing::warn!(path = %path.display(), error = %e, "overwrite failed, falling back to plain delete");
        return plain_delete(path, &format!("overwrite failed: {e}"));
    }

    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), passes, "securely deleted");
            Advisory::Completed
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Advisory::Completed,
        Err(e) => Advisory::failure(format!("unlink of {} failed: {e}", path.display())),
    }
}

fn plain_delete(path: &Path, cause: &str) -> Advisory {
    match fs::remove_file(path) {
        Ok(()) => Advisory::failure(format!("{cause}; {} removed without shredding", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Advisory::Completed,
        Err(e) => Advisory::failure(format!("{cause}; plain delete of {} failed: {e}", path.display())),
    }
}

/// Overwrite the full length of the file `passes` times, syncing each pass
fn overwrite(path: &Path, passes: u32) -> io::Result<()> {
    let len = fs::metadata(path)?.len();
    let mut file = OpenOptions::new().write(true).open(path)?;
    let mut buf = vec![0u8; usize::try_from(len).map_or(CHUNK_SIZE, |l| l.min(CHUNK_SIZE))];
    let mut rng = rand::thread_rng();

    for _ in 0..passes {
        file.seek(SeekFrom::Start(0))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
            rng.fill_bytes(&mut buf[..n]);
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    Ok(())
}
