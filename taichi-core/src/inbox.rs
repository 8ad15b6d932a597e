//! Local mirror of a subscribed tree. Paths are relative to the inbox root
//! and may not escape it.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("refusing unsafe path {0:?}")]
    UnsafePath(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct Inbox {
    root: PathBuf,
    open: HashMap<String, File>,
}

impl Inbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Inbox {
            root: root.into(),
            open: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel: &str) -> Result<PathBuf, InboxError> {
        let path = Path::new(rel);
        let safe = !rel.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(InboxError::UnsafePath(rel.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn handle(&mut self, rel: &str, truncate: bool) -> Result<&mut File, InboxError> {
        if !self.open.contains_key(rel) {
            let path = self.resolve(rel)?;
            let io_err = |source| InboxError::Io {
                path: path.clone(),
                source,
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(truncate)
                .open(&path)
                .map_err(io_err)?;
            self.open.insert(rel.to_string(), file);
        }
        self.open
            .get_mut(rel)
            .ok_or_else(|| InboxError::UnsafePath(rel.to_string()))
    }

    /// Write `data` at `offset`, opening the file on first use. A transfer
    /// starting at offset 0 replaces any previous content.
    pub fn write(&mut self, rel: &str, offset: u64, data: &[u8]) -> Result<(), InboxError> {
        let path = self.resolve(rel)?;
        let file = self.handle(rel, offset == 0)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|source| InboxError::Io { path, source })
    }

    /// End of file: flush and release the handle. A file that never got a
    /// chunk is created empty.
    pub fn close(&mut self, rel: &str) -> Result<(), InboxError> {
        let path = self.resolve(rel)?;
        let file = self.handle(rel, false)?;
        let res = file.flush();
        self.open.remove(rel);
        res.map_err(|source| InboxError::Io { path, source })
    }

    /// Delete the file. Missing files are not an error.
    pub fn remove(&mut self, rel: &str) -> Result<(), InboxError> {
        let path = self.resolve(rel)?;
        self.open.remove(rel);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(InboxError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_at_offsets_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbox = Inbox::new(dir.path());
        inbox.write("sub/a.txt", 0, b"AB").unwrap();
        inbox.write("sub/a.txt", 2, b"CD").unwrap();
        assert_eq!(inbox.open.len(), 1);
        inbox.close("sub/a.txt").unwrap();
        assert_eq!(inbox.open.len(), 0);
        assert_eq!(fs::read(dir.path().join("sub/a.txt")).unwrap(), b"ABCD");
    }

    #[test]
    fn restart_at_zero_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbox = Inbox::new(dir.path());
        inbox.write("f", 0, b"long content").unwrap();
        inbox.close("f").unwrap();
        inbox.write("f", 0, b"new").unwrap();
        inbox.close("f").unwrap();
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"new");
    }

    #[test]
    fn close_without_data_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbox = Inbox::new(dir.path());
        inbox.close("empty").unwrap();
        assert_eq!(fs::read(dir.path().join("empty")).unwrap(), b"");
    }

    #[test]
    fn remove_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbox = Inbox::new(dir.path());
        inbox.remove("nope").unwrap();
        inbox.write("x", 0, b"1").unwrap();
        inbox.remove("x").unwrap();
        assert!(!dir.path().join("x").exists());
        assert_eq!(inbox.open.len(), 0);
    }

    #[test]
    fn rejects_escaping_paths() {
        let inbox = Inbox::new("/tmp/inbox");
        assert!(inbox.resolve("../etc/passwd").is_err());
        assert!(inbox.resolve("a/../../b").is_err());
        assert!(inbox.resolve("/abs").is_err());
        assert!(inbox.resolve("").is_err());
        assert!(inbox.resolve("ok/file").is_ok());
    }
}
