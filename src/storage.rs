//! Whole-file persistence for containers, restored plaintext, watermark
//! previews and the attempt ledger.
//!
//! Every write goes to a randomly named sibling first and is then renamed
//! over the target, so a crash leaves either the old bytes or the new ones.

use getrandom::fill;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file is missing or unreadable.
    pub fn load(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    /// Reads the whole file, or `None` if it has not been written yet.
    pub fn load_if_present(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the file with `data`, creating missing parent directories.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] on any filesystem failure; the previous content is left
    /// in place and the temporary sibling is removed.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let staged = self.staging_path()?;
        if let Err(e) = write_synced(&staged, data).and_then(|()| self.replace_with(&staged)) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        // the rename itself must reach the disk
        #[cfg(not(target_os = "windows"))]
        if let Some(dir) = parent {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    /// `<name>.tmp.<16 hex digits>` next to the target.
    fn staging_path(&self) -> Result<PathBuf> {
        let name = self.path.file_name().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} does not name a file", self.path.display()),
            ))
        })?;

        let mut suffix = [0u8; 8];
        fill(&mut suffix).map_err(|_| Error::Crypto("OS random generator unavailable".into()))?;
        let suffix: String = suffix.iter().map(|b| format!("{b:02x}")).collect();

        Ok(self
            .path
            .with_file_name(format!("{}.tmp.{suffix}", name.to_string_lossy())))
    }

    #[cfg(not(target_os = "windows"))]
    fn replace_with(&self, staged: &Path) -> Result<()> {
        Ok(fs::rename(staged, &self.path)?)
    }

    /// `ReplaceFileW` with write-through when the target exists, a plain
    /// rename for a first write.
    #[cfg(target_os = "windows")]
    fn replace_with(&self, staged: &Path) -> Result<()> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

        if !self.path.exists() {
            return Ok(fs::rename(staged, &self.path)?);
        }

        fn wide(s: &OsStr) -> Vec<u16> {
            s.encode_wide().chain(std::iter::once(0)).collect()
        }
        let target = wide(self.path.as_os_str());
        let source = wide(staged.as_os_str());

        // SAFETY: both buffers are NUL-terminated UTF-16 that outlive the
        // call, and the optional arguments are null.
        let replaced = unsafe {
            ReplaceFileW(
                target.as_ptr(),
                source.as_ptr(),
                std::ptr::null(),
                REPLACEFILE_WRITE_THROUGH,
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        if replaced == 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn container_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("notes.txt.enc"));

        storage.save(b"BIOL sealed bytes").unwrap();
        assert_eq!(storage.load().unwrap(), b"BIOL sealed bytes");
        assert_eq!(names_in(dir.path()), ["notes.txt.enc"]);
    }

    #[test]
    fn ledger_replaced_in_place() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("attempts.json"));

        storage.save(b"{\"a\":1}").unwrap();
        storage.save(b"{}").unwrap();

        assert_eq!(fs::read(storage.path()).unwrap(), b"{}");
        assert_eq!(names_in(dir.path()), ["attempts.json"]);
    }

    #[test]
    fn unwritten_ledger_loads_as_none() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("attempts.json"));

        assert!(storage.load_if_present().unwrap().is_none());
        match storage.load() {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected NotFound, got: {other:?}"),
        }

        storage.save(b"[]").unwrap();
        assert_eq!(storage.load_if_present().unwrap().as_deref(), Some(&b"[]"[..]));
    }

    #[test]
    fn unreadable_target_is_an_error_not_absent() {
        let dir = tempdir().unwrap();
        // a directory where the ledger file should be
        let storage = Storage::new(dir.path().to_path_buf());
        assert!(matches!(storage.load_if_present(), Err(Error::Io(_))));
    }

    #[test]
    fn missing_vault_directory_is_created() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("vault").join("2026").join("scan.png.enc");

        Storage::new(target.clone()).save(&[7u8; 4096]).unwrap();
        assert_eq!(fs::read(target).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn staging_names_are_random_siblings() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("decrypted_notes.txt");
        let storage = Storage::new(target.clone());

        let a = storage.staging_path().unwrap();
        let b = storage.staging_path().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, target);
        assert_eq!(a.parent(), target.parent());
        assert!(
            a.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("decrypted_notes.txt.tmp.")
        );
    }

    #[test]
    fn failed_write_keeps_previous_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("notes.txt.enc");
        let storage = Storage::new(target.clone());
        storage.save(b"first").unwrap();

        // renaming a file over a non-empty directory fails
        let blocked = Storage::new(dir.path().join("sub"));
        fs::create_dir(blocked.path()).unwrap();
        fs::write(blocked.path().join("inner"), b"x").unwrap();
        assert!(blocked.save(b"second").is_err());

        assert_eq!(fs::read(&target).unwrap(), b"first");
        assert_eq!(names_in(dir.path()), ["notes.txt.enc", "sub"]);
    }

    #[test]
    fn path_without_file_name_is_rejected() {
        let storage = Storage::new(PathBuf::from("/"));
        assert!(matches!(storage.save(b"data"), Err(Error::Io(_))));
    }
}
