//! Local file store rooted at `<data_dir>/fs`.
//!
//! Script paths are `/`-separated and relative to the root; a leading `/`
//! is ignored. Paths that climb out of the root are rejected.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// Metadata returned by `stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time: String,
    pub is_dir: bool,
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a script path onto the local filesystem.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let mut out = self.root.clone();
        for component in Path::new(name.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "path escapes the file store: {name}"
                    )));
                }
            }
        }
        Ok(out)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        if path.is_dir() {
            return Err(Error::Validation(format!("is a directory: {name}")));
        }
        Ok(std::fs::read(path)?)
    }

    /// Write `content`, creating parent directories as needed.
    pub fn write(&self, name: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;
        if path == self.root {
            return Err(Error::Validation("cannot write to the file store root".to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Remove a file, or a directory with everything below it.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        if path == self.root {
            return Err(Error::Validation("cannot remove the file store root".to_string()));
        }
        if std::fs::symlink_metadata(&path)?.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn stat(&self, name: &str) -> Result<FileStat> {
        let path = self.resolve(name)?;
        let meta = std::fs::metadata(&path)?;
        let mod_time: DateTime<Utc> = meta.modified()?.into();
        let name = path
            .file_name()
            .map_or_else(|| "/".to_string(), |n| n.to_string_lossy().into_owned());
        Ok(FileStat {
            name,
            size: meta.len(),
            mode: permission_bits(&meta),
            mod_time: mod_time.to_rfc3339(),
            is_dir: meta.is_dir(),
        })
    }

    /// Walk `path` in lexical order, root first. Without `recursive` only
    /// the root and its direct children are visited. `include` decides
    /// whether a visited path is returned; it never prunes the walk.
    pub fn walk<F>(&self, path: &str, recursive: bool, mut include: F) -> Result<Vec<String>>
    where
        F: FnMut(&str) -> Result<bool>,
    {
        let start = path.trim_end_matches('/');
        let start = if start.is_empty() { "." } else { start };
        let local = self.resolve(start)?;
        let meta = std::fs::metadata(&local)?;

        let mut out = Vec::new();
        if include(start)? {
            out.push(start.to_string());
        }
        if meta.is_dir() {
            walk_dir(&local, start, recursive, &mut include, &mut out)?;
        }
        Ok(out)
    }
}

fn walk_dir<F>(dir: &Path, shown: &str, recursive: bool, include: &mut F, out: &mut Vec<String>) -> Result<()>
where
    F: FnMut(&str) -> Result<bool>,
{
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let child = if shown == "." {
            file_name.into_owned()
        } else {
            format!("{shown}/{file_name}")
        };
        if include(&child)? {
            out.push(child.clone());
        }
        if recursive && entry.file_type()?.is_dir() {
            walk_dir(&entry.path(), &child, recursive, include, out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("fs")).unwrap();
        (dir, store)
    }

    fn populate(store: &FileStore) {
        store.write("docs/b.txt", b"b").unwrap();
        store.write("docs/a.txt", b"a").unwrap();
        store.write("docs/sub/c.txt", b"c").unwrap();
        store.write("top.txt", b"t").unwrap();
    }

    #[test]
    fn write_read_remove() {
        let (_dir, store) = store();
        store.write("/notes/today.md", b"# hi").unwrap();
        assert_eq!(store.read("notes/today.md").unwrap(), b"# hi");
        store.remove("notes").unwrap();
        assert!(matches!(store.read("notes/today.md"), Err(Error::Io(_))));
    }

    #[test]
    fn read_directory_fails() {
        let (_dir, store) = store();
        populate(&store);
        let err = store.read("docs").unwrap_err();
        assert_eq!(err.to_string(), "is a directory: docs");
    }

    #[test]
    fn escaping_root_is_rejected() {
        let (_dir, store) = store();
        assert!(matches!(store.read("../secret"), Err(Error::Validation(_))));
        assert!(matches!(store.write("a/../../b", b"x"), Err(Error::Validation(_))));
        assert!(matches!(store.remove("/"), Err(Error::Validation(_))));
    }

    #[test]
    fn stat_reports_file_details() {
        let (_dir, store) = store();
        populate(&store);
        let st = store.stat("docs/a.txt").unwrap();
        assert_eq!(st.name, "a.txt");
        assert_eq!(st.size, 1);
        assert!(!st.is_dir);
        assert!(DateTime::parse_from_rfc3339(&st.mod_time).is_ok());
        assert!(store.stat("docs").unwrap().is_dir);
    }

    #[test]
    fn walk_recursive_lexical() {
        let (_dir, store) = store();
        populate(&store);
        let all = store.walk("docs", true, |_| Ok(true)).unwrap();
        assert_eq!(all, vec!["docs", "docs/a.txt", "docs/b.txt", "docs/sub", "docs/sub/c.txt"]);
    }

    #[test]
    fn walk_shallow_stops_at_children() {
        let (_dir, store) = store();
        populate(&store);
        let shallow = store.walk("", false, |_| Ok(true)).unwrap();
        assert_eq!(shallow, vec![".", "docs", "top.txt"]);
    }

    #[test]
    fn filter_controls_inclusion_only() {
        let (_dir, store) = store();
        populate(&store);
        let txt = store.walk("docs/", true, |p| Ok(p.ends_with(".txt"))).unwrap();
        assert_eq!(txt, vec!["docs/a.txt", "docs/b.txt", "docs/sub/c.txt"]);
    }

    #[test]
    fn shallow_walk_skips_rejected_child_dirs() {
        let (_dir, store) = store();
        populate(&store);
        let mut seen = Vec::new();
        let kept = store
            .walk("", false, |p| {
                seen.push(p.to_string());
                Ok(p != "docs")
            })
            .unwrap();
        assert_eq!(kept, vec![".", "top.txt"]);
        assert_eq!(seen, vec![".", "docs", "top.txt"]);
    }

    #[test]
    fn filter_error_stops_walk() {
        let (_dir, store) = store();
        populate(&store);
        let err = store
            .walk("docs", true, |p| {
                if p.contains("sub") {
                    Err(Error::Validation("boom".into()))
                } else {
                    Ok(true)
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn walk_of_file_is_itself() {
        let (_dir, store) = store();
        populate(&store);
        assert_eq!(store.walk("top.txt", true, |_| Ok(true)).unwrap(), vec!["top.txt"]);
        assert!(matches!(store.walk("nope", true, |_| Ok(true)), Err(Error::Io(_))));
    }
}
