//! Virtual filesystem seen by running code.
//!
//! Paths are `/`-separated. Absolute and relative paths resolve against the
//! same root (the execution context's working directory); `..` may not climb
//! above it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),
    #[error("File exists: {0}")]
    AlreadyExists(String),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Is a directory: {0}")]
    IsADirectory(String),
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub trait VirtualFs: Send {
    /// Write `content`, creating missing parent directories.
    fn write_file(&mut self, path: &str, content: &str) -> Result<(), FsError>;
    fn read_file(&self, path: &str) -> Result<String, FsError>;
    /// Create one directory; its parent must exist.
    fn mkdir(&mut self, path: &str) -> Result<(), FsError>;
    fn exists(&self, path: &str) -> Result<bool, FsError>;
    /// Entry names of a directory, sorted.
    fn listdir(&self, path: &str) -> Result<Vec<String>, FsError>;
}

/// Split a path into normalized components.
pub(crate) fn components(path: &str) -> Result<Vec<String>, FsError> {
    let invalid = |reason| FsError::InvalidPath { path: path.to_string(), reason };
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    let mut parts: Vec<String> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(invalid("escapes the filesystem root"));
                }
            }
            name => parts.push(name.to_string()),
        }
    }
    Ok(parts)
}

#[derive(Debug, Clone)]
enum Node {
    File(String),
    Dir,
}

/// In-memory filesystem.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    // Keyed by the normalized path; the root is implicit.
    nodes: BTreeMap<String, Node>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, key: &str) -> Option<&Node> {
        if key.is_empty() {
            return Some(&Node::Dir);
        }
        self.nodes.get(key)
    }

    fn ensure_dirs(&mut self, parts: &[String], display: &str) -> Result<(), FsError> {
        for depth in 1..=parts.len() {
            let key = parts[..depth].join("/");
            match self.nodes.get(&key) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(FsError::NotADirectory(display.to_string())),
                None => {
                    self.nodes.insert(key, Node::Dir);
                }
            }
        }
        Ok(())
    }
}

impl VirtualFs for MemoryFs {
    fn write_file(&mut self, path: &str, content: &str) -> Result<(), FsError> {
        let parts = components(path)?;
        let Some((_, parents)) = parts.split_last() else {
            return Err(FsError::IsADirectory(path.to_string()));
        };
        self.ensure_dirs(parents, path)?;
        let key = parts.join("/");
        if let Some(Node::Dir) = self.nodes.get(&key) {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        self.nodes.insert(key, Node::File(content.to_string()));
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<String, FsError> {
        let key = components(path)?.join("/");
        match self.node(&key) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir) => Err(FsError::IsADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let parts = components(path)?;
        let key = parts.join("/");
        if self.node(&key).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let parent = parts[..parts.len() - 1].join("/");
        match self.node(&parent) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path.to_string())),
            None => return Err(FsError::NotFound(path.to_string())),
        }
        self.nodes.insert(key, Node::Dir);
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, FsError> {
        let key = components(path)?.join("/");
        Ok(self.node(&key).is_some())
    }

    fn listdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let key = components(path)?.join("/");
        match self.node(&key) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path.to_string())),
            None => return Err(FsError::NotFound(path.to_string())),
        }
        let prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
        Ok(self
            .nodes
            .keys()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }
}

/// Filesystem rooted at a real directory.
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut resolved = self.root.clone();
        resolved.extend(components(path)?);
        Ok(resolved)
    }
}

fn map_io(path: &str, err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io { path: path.to_string(), source: err },
    }
}

impl VirtualFs for DirFs {
    fn write_file(&mut self, path: &str, content: &str) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        if let Some(parent) = target.parent() {
            if parent.is_file() {
                return Err(FsError::NotADirectory(path.to_string()));
            }
            fs::create_dir_all(parent).map_err(|e| map_io(path, e))?;
        }
        fs::write(&target, content).map_err(|e| map_io(path, e))
    }

    fn read_file(&self, path: &str) -> Result<String, FsError> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        fs::read_to_string(&target).map_err(|e| map_io(path, e))
    }

    fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        fs::create_dir(&target).map_err(|e| map_io(path, e))
    }

    fn exists(&self, path: &str) -> Result<bool, FsError> {
        Ok(self.resolve(path)?.exists())
    }

    fn listdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let target = self.resolve(path)?;
        if target.is_file() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&target).map_err(|e| map_io(path, e))? {
            let entry = entry.map_err(|e| map_io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
