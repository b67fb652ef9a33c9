//! Per-recipient Maildir tree: `<root>/<domain>/<user>/Maildir/{tmp,new,cur}`.
//!
//! Writers create files in `tmp/`, then atomically `rename` them into
//! `new/` on commit, and hard-link the canonical file into every other
//! recipient's `new/` for O(1) multi-recipient delivery of a single
//! on-disk artifact.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};

use crate::error::StorageError;

const DIR_MODE: u32 = 0o777;
const FILE_MODE: u32 = 0o644;

/// Matches the original's fixed `char __path[PATH_SIZE]` buffer
/// (`maildir.h`'s `PATH_SIZE`); a recipient address that would overflow
/// it is rejected up front instead of truncated.
const PATH_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Maildir {
    path: PathBuf,
}

impl Maildir {
    /// Derive the Maildir root for `recipient` (a full `user@domain`
    /// address) under `maildir_root`, creating `tmp/`, `new/`, `cur/`
    /// if they do not already exist.
    pub async fn init(maildir_root: &Path, recipient: &str) -> Result<Self, StorageError> {
        let at = recipient
            .find('@')
            .ok_or_else(|| StorageError::NoDomain(recipient.to_string()))?;
        let (user, domain) = (&recipient[..at], &recipient[at + 1..]);

        let path = maildir_root.join(domain).join(user).join("Maildir");
        if path.as_os_str().len() >= PATH_SIZE {
            return Err(StorageError::PathTooLong(path));
        }

        for sub in ["tmp", "new", "cur"] {
            let dir = path.join(sub);
            create_dir_all_mode(&dir).await.map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(Maildir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self, filename: &str) -> PathBuf {
        self.path.join("tmp").join(filename)
    }

    fn new_path(&self, filename: &str) -> PathBuf {
        self.path.join("new").join(filename)
    }

    /// Create `tmp/<filename>` exclusively; fails if it already exists.
    pub async fn create_file(&self, filename: &str) -> Result<File, StorageError> {
        let path = self.tmp_path(filename);
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            opts.mode(FILE_MODE);
        }
        let file = opts
            .open(&path)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(file)
    }

    /// Atomically publish `tmp/<filename>` as `new/<filename>`.
    pub async fn move_to_new(&self, filename: &str) -> Result<(), StorageError> {
        let from = self.tmp_path(filename);
        let to = self.new_path(filename);
        fs::rename(&from, &to)
            .await
            .map_err(|source| StorageError::Io { path: from, source })
    }

    /// Hard-link `src`'s already-published `new/<filename>` into this
    /// Maildir's `new/<filename>`. Assumes both live on the same
    /// filesystem.
    pub async fn clone_file(&self, src: &Maildir, filename: &str) -> Result<(), StorageError> {
        let from = src.new_path(filename);
        let to = self.new_path(filename);
        fs::hard_link(&from, &to)
            .await
            .map_err(|source| StorageError::Io { path: to, source })
    }

    /// Unlink a partially-written `tmp/<filename>`.
    pub async fn remove_file(&self, filename: &str) -> Result<(), StorageError> {
        let path = self.tmp_path(filename);
        fs::remove_file(&path)
            .await
            .map_err(|source| StorageError::Io { path, source })
    }
}

async fn create_dir_all_mode(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    set_mode(dir, DIR_MODE).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn init_creates_tmp_new_cur() {
        let root = tempfile::tempdir().unwrap();
        let md = Maildir::init(root.path(), "alice@example.org").await.unwrap();
        assert!(md.path().join("tmp").is_dir());
        assert!(md.path().join("new").is_dir());
        assert!(md.path().join("cur").is_dir());
        assert_eq!(
            md.path(),
            root.path().join("example.org").join("alice").join("Maildir")
        );
    }

    #[tokio::test]
    async fn create_write_move_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let md = Maildir::init(root.path(), "bob@example.org").await.unwrap();
        let mut f = md.create_file("msg1.eml").await.unwrap();
        f.write_all(b"hello world").await.unwrap();
        drop(f);
        md.move_to_new("msg1.eml").await.unwrap();
        let contents = tokio::fs::read(md.path().join("new").join("msg1.eml"))
            .await
            .unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn clone_file_hardlinks_into_peer() {
        let root = tempfile::tempdir().unwrap();
        let first = Maildir::init(root.path(), "a@x.org").await.unwrap();
        let second = Maildir::init(root.path(), "b@x.org").await.unwrap();

        let mut f = first.create_file("m.eml").await.unwrap();
        f.write_all(b"body").await.unwrap();
        drop(f);
        first.move_to_new("m.eml").await.unwrap();
        second.clone_file(&first, "m.eml").await.unwrap();

        use std::os::unix::fs::MetadataExt;
        let m1 = std::fs::metadata(first.path().join("new").join("m.eml")).unwrap();
        let m2 = std::fs::metadata(second.path().join("new").join("m.eml")).unwrap();
        assert_eq!(m1.ino(), m2.ino());
    }

    #[tokio::test]
    async fn overlong_path_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let huge_domain = "d".repeat(PATH_SIZE);
        let recipient = format!("user@{huge_domain}");
        let err = Maildir::init(root.path(), &recipient).await.unwrap_err();
        assert!(matches!(err, StorageError::PathTooLong(_)));
    }

    #[tokio::test]
    async fn remove_file_unlinks_tmp() {
        let root = tempfile::tempdir().unwrap();
        let md = Maildir::init(root.path(), "c@x.org").await.unwrap();
        md.create_file("gone.eml").await.unwrap();
        md.remove_file("gone.eml").await.unwrap();
        assert!(!md.path().join("tmp").join("gone.eml").exists());
    }
}
