//! # corral-kv
//!
//! Disk-backed key/value node store.
//!
//! Each node is one file named after its owner (a container name with `/`
//! escaped) holding a sequence of length-delimited [`Pair`] records. The
//! store is append-friendly: a single property write appends one record,
//! and an explicit sync rewrites the file from the live slot set. Readers
//! replay records in order, so a later record for the same key wins.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use thiserror::Error;
use tracing::debug;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors raised by the node store.
#[derive(Debug, Error)]
pub enum KvError {
    /// Underlying filesystem failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A node file held bytes that do not decode as pair records.
    #[error("corrupted node: {0}")]
    Corrupted(String),

    /// The requested node file does not exist.
    #[error("node not found: {0}")]
    NotFound(String),
}

/// One persisted `(key, value)` record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pair {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Separator used on disk in place of `/` in node names. Node owners are
/// forbidden from containing this character.
const NAME_ESCAPE: char = '%';

/// Store of named nodes under a single directory.
#[derive(Debug)]
pub struct KvStore {
    root: PathBuf,
}

impl KvStore {
    /// Opens (and creates if absent) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Appends one pair record to `node`, creating the node if absent.
    pub fn append(&self, node: &str, key: &str, value: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.node_path(node))?;

        let pair = Pair {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        file.write_all(&pair.encode_length_delimited_to_vec())?;
        file.sync_data()?;
        Ok(())
    }

    /// Rewrites `node` from scratch with the given pairs (compaction).
    ///
    /// The new content lands in a temporary file first so a crash mid-write
    /// never loses the previous generation.
    pub fn rewrite(&self, node: &str, pairs: &[(String, String)]) -> Result<()> {
        let path = self.node_path(node);
        let tmp = path.with_extension("tmp");

        let mut buf = Vec::new();
        for (key, value) in pairs {
            let pair = Pair {
                key: key.clone(),
                value: value.clone(),
            };
            buf.extend_from_slice(&pair.encode_length_delimited_to_vec());
        }

        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;

        debug!(node, records = pairs.len(), "node rewritten");
        Ok(())
    }

    /// Loads every pair record of `node` in append order.
    pub fn load(&self, node: &str) -> Result<Vec<(String, String)>> {
        let path = self.node_path(node);
        let mut bytes = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KvError::NotFound(node.to_owned()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut pairs = Vec::new();
        let mut cursor = &bytes[..];
        while !cursor.is_empty() {
            let pair = Pair::decode_length_delimited(&mut cursor)
                .map_err(|e| KvError::Corrupted(format!("{}: {e}", node)))?;
            pairs.push((pair.key, pair.value));
        }
        Ok(pairs)
    }

    /// Removes `node`. Removing an absent node is not an error.
    pub fn remove(&self, node: &str) -> Result<()> {
        match fs::remove_file(self.node_path(node)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether `node` exists on disk.
    pub fn exists(&self, node: &str) -> bool {
        self.node_path(node).exists()
    }

    /// Enumerates the names of every node in the store.
    ///
    /// Leftover temporary files from an interrupted rewrite are skipped.
    pub fn list_nodes(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.ends_with(".tmp") {
                continue;
            }
            names.push(unescape_name(name));
        }
        names.sort();
        Ok(names)
    }

    fn node_path(&self, node: &str) -> PathBuf {
        self.root.join(escape_name(node))
    }

    /// The store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn escape_name(name: &str) -> String {
    name.replace('/', &NAME_ESCAPE.to_string())
}

fn unescape_name(file: &str) -> String {
    file.replace(NAME_ESCAPE, "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, KvStore) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path().join("state")).unwrap();
        (dir, store)
    }

    #[test]
    fn append_then_load_preserves_order() {
        let (_dir, store) = store();

        store.append("a", "command", "sleep 1").unwrap();
        store.append("a", "memory_limit", "1G").unwrap();

        let pairs = store.load("a").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("command".to_owned(), "sleep 1".to_owned()),
                ("memory_limit".to_owned(), "1G".to_owned()),
            ]
        );
    }

    #[test]
    fn later_append_for_same_key_comes_last() {
        let (_dir, store) = store();

        store.append("a", "cpu_limit", "10").unwrap();
        store.append("a", "cpu_limit", "50").unwrap();

        let pairs = store.load("a").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], ("cpu_limit".to_owned(), "50".to_owned()));
    }

    #[test]
    fn rewrite_compacts_the_node() {
        let (_dir, store) = store();

        store.append("a", "cpu_limit", "10").unwrap();
        store.append("a", "cpu_limit", "50").unwrap();
        store
            .rewrite("a", &[("cpu_limit".to_owned(), "50".to_owned())])
            .unwrap();

        let pairs = store.load("a").unwrap();
        assert_eq!(pairs, vec![("cpu_limit".to_owned(), "50".to_owned())]);
    }

    #[test]
    fn remove_deletes_the_node_and_is_idempotent() {
        let (_dir, store) = store();

        store.append("a", "k", "v").unwrap();
        assert!(store.exists("a"));

        store.remove("a").unwrap();
        assert!(!store.exists("a"));
        store.remove("a").unwrap();

        assert!(matches!(store.load("a"), Err(KvError::NotFound(_))));
    }

    #[test]
    fn hierarchical_names_are_escaped_on_disk() {
        let (_dir, store) = store();

        store.append("parent/child", "k", "v").unwrap();

        // Exactly one flat file, no nested directory.
        let entries: Vec<_> = fs::read_dir(store.root()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let names = store.list_nodes().unwrap();
        assert_eq!(names, vec!["parent/child".to_owned()]);
    }

    #[test]
    fn list_nodes_skips_leftover_tmp_files() {
        let (_dir, store) = store();

        store.append("a", "k", "v").unwrap();
        fs::write(store.root().join("b.tmp"), b"partial").unwrap();

        assert_eq!(store.list_nodes().unwrap(), vec!["a".to_owned()]);
    }

    #[test]
    fn truncated_node_is_corrupted() {
        let (_dir, store) = store();

        store.append("a", "key", "a-rather-long-value").unwrap();
        let path = store.root().join("a");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        assert!(matches!(store.load("a"), Err(KvError::Corrupted(_))));
    }
}
