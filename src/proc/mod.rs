//! `/proc` enumeration and file reading.
//!
//! The sampler is single-threaded, so one [`ProcReader`] with one reusable
//! buffer serves every procfs read in steady state. PIDs vanishing between
//! enumeration and read are normal churn and surface as
//! [`CollectError::PidVanished`].

pub mod pidstat;
pub mod system;

use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::MetadataExt;

use crate::error::CollectError;

const READ_BUF_CAPACITY: usize = 8192;

/// Reusable buffer for small procfs files. No stat call before reading; the
/// buffer grows to the largest file seen and stays there.
pub struct ProcReader {
    buf: Vec<u8>,
}

impl ProcReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(READ_BUF_CAPACITY),
        }
    }

    /// Reads `path` in full, returning the bytes as a borrow of the internal
    /// buffer.
    pub fn read<'a>(&'a mut self, path: &str) -> std::io::Result<&'a [u8]> {
        let mut f = File::open(path)?;
        self.buf.clear();
        f.read_to_end(&mut self.buf)?;
        Ok(&self.buf)
    }

    /// Like [`read`], but also returns the owning UID taken from the open
    /// file's metadata, avoiding a separate path lookup.
    ///
    /// [`read`]: ProcReader::read
    pub fn read_with_uid<'a>(&'a mut self, path: &str) -> std::io::Result<(&'a [u8], u32)> {
        let mut f = File::open(path)?;
        let uid = f.metadata()?.uid();
        self.buf.clear();
        f.read_to_end(&mut self.buf)?;
        Ok((&self.buf, uid))
    }
}

impl Default for ProcReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Refills `list` with the numeric entries of `/proc`, preserving directory
/// order. The kernel returns PIDs in increasing order, which is what keeps
/// process sample lists sorted.
///
/// Returns `true` when more than `max_procs` processes exist and the list was
/// truncated.
pub fn pid_list(list: &mut Vec<u32>, max_procs: usize) -> Result<bool, CollectError> {
    list.clear();

    let entries = fs::read_dir("/proc").map_err(|source| CollectError::SystemRead {
        path: "/proc",
        source,
    })?;

    let mut truncated = false;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let name = entry.file_name();
        let pid: u32 = match name.to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        if list.len() >= max_procs {
            truncated = true;
            break;
        }

        list.push(pid);
    }

    Ok(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reuses_buffer() {
        let mut reader = ProcReader::new();
        // /proc/self/stat always exists on the platforms we build for.
        let first_ptr = reader.read("/proc/self/stat").expect("read").as_ptr();
        let second_ptr = reader.read("/proc/self/stat").expect("read").as_ptr();
        assert_eq!(first_ptr, second_ptr);
    }

    #[test]
    fn test_reader_missing_file() {
        let mut reader = ProcReader::new();
        assert!(reader.read("/proc/0/stat").is_err());
    }

    #[test]
    fn test_read_with_uid_self() {
        let mut reader = ProcReader::new();
        let (data, _uid) = reader.read_with_uid("/proc/self/stat").expect("read");
        assert!(!data.is_empty());
    }

    #[test]
    fn test_pid_list_contains_self() {
        let mut list = Vec::new();
        let truncated = pid_list(&mut list, 100_000).expect("enumerate /proc");
        assert!(!truncated);
        let me = std::process::id();
        assert!(list.contains(&me));
    }

    #[test]
    fn test_pid_list_truncates() {
        let mut list = Vec::new();
        let truncated = pid_list(&mut list, 1).expect("enumerate /proc");
        assert!(truncated);
        assert_eq!(list.len(), 1);
    }
}
