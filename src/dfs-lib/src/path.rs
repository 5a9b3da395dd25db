use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{DfsError, DfsResult};

/// Distributed filesystem path: an immutable sequence of non-empty
/// components. The empty sequence is the root directory.
///
/// The string form is `/` for root, otherwise `/` + components joined by
/// `/`. Components may not contain `/` or `:` (the colon is reserved for
/// application use), and `.`/`..` are rejected so paths map cleanly onto a
/// host directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DfsPath {
    components: Vec<String>,
}

fn check_component(component: &str) -> DfsResult<()> {
    if component.is_empty() {
        return Err(DfsError::InvalidArgument(
            "path component is empty".to_string(),
        ));
    }
    if component.contains('/') || component.contains(':') {
        return Err(DfsError::InvalidArgument(format!(
            "path component contains a reserved character: {}",
            component
        )));
    }
    if component == "." || component == ".." {
        return Err(DfsError::InvalidArgument(format!(
            "path component is not allowed: {}",
            component
        )));
    }
    Ok(())
}

impl DfsPath {
    /// The root directory.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parses a path string. The string must begin with `/`; empty
    /// components are dropped, so `//a///b` equals `/a/b`.
    pub fn new(path: &str) -> DfsResult<Self> {
        if !path.starts_with('/') {
            return Err(DfsError::InvalidArgument(format!(
                "path must begin with /: {}",
                path
            )));
        }
        let mut components = Vec::new();
        for component in path.split('/') {
            if component.is_empty() {
                continue;
            }
            check_component(component)?;
            components.push(component.to_string());
        }
        Ok(Self { components })
    }

    /// Appends one component to an existing path.
    pub fn child(&self, component: &str) -> DfsResult<Self> {
        check_component(component)?;
        let mut components = self.components.clone();
        components.push(component.to_string());
        Ok(Self { components })
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// The parent path, or `None` for root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }

    /// The last component, or `None` for root.
    pub fn last(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|s| s.as_str())
    }

    /// True iff `other`'s components are a prefix of this path's components.
    /// Every path is a subpath of itself.
    pub fn is_subpath(&self, other: &DfsPath) -> bool {
        if other.components.len() > self.components.len() {
            return false;
        }
        self.components[..other.components.len()] == other.components[..]
    }

    /// Proper ancestors from the root down to the parent, in lock-acquisition
    /// order. Empty for root.
    pub fn ancestors(&self) -> Vec<DfsPath> {
        let mut chain = Vec::with_capacity(self.components.len());
        for end in 0..self.components.len() {
            chain.push(Self {
                components: self.components[..end].to_vec(),
            });
        }
        chain
    }

    /// Maps the path onto the host filesystem below `root`.
    pub fn to_host_path(&self, root: &std::path::Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in &self.components {
            out.push(component);
        }
        out
    }
}

impl fmt::Display for DfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for DfsPath {
    type Err = DfsError;

    fn from_str(s: &str) -> DfsResult<Self> {
        DfsPath::new(s)
    }
}

impl TryFrom<String> for DfsPath {
    type Error = DfsError;

    fn try_from(value: String) -> DfsResult<Self> {
        DfsPath::new(&value)
    }
}

impl From<DfsPath> for String {
    fn from(value: DfsPath) -> String {
        value.to_string()
    }
}

// Ordering over the serialized form: ancestors sort before their
// descendants, which is what the ancestor-first lock protocol relies on.
impl Ord for DfsPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for DfsPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lists the paths of all regular files in a local directory tree, relative
/// to `root`. Directory entries are visited as the host OS reports them.
pub fn list_local_tree(root: &std::path::Path) -> DfsResult<Vec<DfsPath>> {
    if !root.exists() {
        return Err(DfsError::NotFound(format!(
            "root directory does not exist: {}",
            root.display()
        )));
    }
    if !root.is_dir() {
        return Err(DfsError::InvalidArgument(format!(
            "root is not a directory: {}",
            root.display()
        )));
    }
    let mut out = Vec::new();
    walk_tree(root, &DfsPath::root(), &mut out)?;
    Ok(out)
}

fn walk_tree(
    dir: &std::path::Path,
    prefix: &DfsPath,
    out: &mut Vec<DfsPath>,
) -> DfsResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                warn!("skipping non-utf8 entry under {}", dir.display());
                continue;
            }
        };
        let child = match prefix.child(name) {
            Ok(child) => child,
            Err(_) => {
                warn!("skipping unrepresentable entry: {}/{}", dir.display(), name);
                continue;
            }
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_tree(&entry.path(), &child, out)?;
        } else if file_type.is_file() {
            out.push(child);
        }
    }
    Ok(())
}
