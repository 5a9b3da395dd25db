use dfs_lib::{DfsError, DfsPath, DfsResult, StorageRef};
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// One entry in the directory tree. A file carries the replica set and the
/// shared-access counter driving the replication policy; a directory
/// carries its immediate children as full paths.
#[derive(Debug, Clone)]
pub enum TreeNode {
    File {
        replicas: HashSet<StorageRef>,
        reads: u64,
    },
    Dir {
        children: HashSet<DfsPath>,
    },
}

/// In-memory directory tree of the naming server: a map from path to node.
/// The root directory always exists. Callers serialize access through the
/// path-lock manager; this type only guards its own map.
pub struct DirTree {
    nodes: HashMap<DfsPath, TreeNode>,
}

impl DirTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            DfsPath::root(),
            TreeNode::Dir {
                children: HashSet::new(),
            },
        );
        Self { nodes }
    }

    pub fn exists(&self, path: &DfsPath) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn is_directory(&self, path: &DfsPath) -> DfsResult<bool> {
        match self.nodes.get(path) {
            Some(TreeNode::Dir { .. }) => Ok(true),
            Some(TreeNode::File { .. }) => Ok(false),
            None => Err(DfsError::NotFound(path.to_string())),
        }
    }

    /// Immediate child names (last components) of a directory.
    pub fn children(&self, path: &DfsPath) -> DfsResult<Vec<String>> {
        match self.nodes.get(path) {
            Some(TreeNode::Dir { children }) => Ok(children
                .iter()
                .filter_map(|child| child.last().map(|s| s.to_string()))
                .collect()),
            Some(TreeNode::File { .. }) => Err(DfsError::NotFound(format!(
                "not a directory: {}",
                path
            ))),
            None => Err(DfsError::NotFound(path.to_string())),
        }
    }

    pub fn replicas_of(&self, path: &DfsPath) -> DfsResult<Vec<StorageRef>> {
        match self.nodes.get(path) {
            Some(TreeNode::File { replicas, .. }) => Ok(replicas.iter().cloned().collect()),
            Some(TreeNode::Dir { .. }) => {
                Err(DfsError::NotFound(format!("not a file: {}", path)))
            }
            None => Err(DfsError::NotFound(path.to_string())),
        }
    }

    /// One replica of a file, chosen uniformly at random so repeated
    /// lookups spread client load.
    pub fn pick_replica(&self, path: &DfsPath) -> DfsResult<StorageRef> {
        let replicas = self.replicas_of(path)?;
        if replicas.is_empty() {
            // insert_file and retain_one_replica keep the set non-empty
            return Err(DfsError::Internal(format!(
                "file without replicas: {}",
                path
            )));
        }
        let index = rand::thread_rng().gen_range(0..replicas.len());
        Ok(replicas[index].clone())
    }

    /// Inserts a file node with its first replica. The parent must already
    /// exist as a directory and the path must be free.
    pub fn insert_file(&mut self, path: &DfsPath, replica: StorageRef) -> DfsResult<()> {
        let parent = self.check_insertable(path)?;
        self.nodes.insert(
            path.clone(),
            TreeNode::File {
                replicas: HashSet::from([replica]),
                reads: 0,
            },
        );
        self.link_child(&parent, path);
        Ok(())
    }

    pub fn insert_directory(&mut self, path: &DfsPath) -> DfsResult<()> {
        let parent = self.check_insertable(path)?;
        self.nodes.insert(
            path.clone(),
            TreeNode::Dir {
                children: HashSet::new(),
            },
        );
        self.link_child(&parent, path);
        Ok(())
    }

    /// Removes the node at `path`; for a directory the entire subtree goes
    /// with it. The caller is responsible for having issued delete commands
    /// to the replicas of every file removed. Root is not removable.
    pub fn remove(&mut self, path: &DfsPath) -> DfsResult<()> {
        if path.is_root() {
            return Err(DfsError::InvalidArgument(
                "cannot remove the root directory".to_string(),
            ));
        }
        if !self.exists(path) {
            return Err(DfsError::NotFound(path.to_string()));
        }
        self.nodes.retain(|p, _| !p.is_subpath(path));
        let parent = path.parent().unwrap();
        if let Some(TreeNode::Dir { children }) = self.nodes.get_mut(&parent) {
            children.remove(path);
        }
        Ok(())
    }

    /// Every file at or below `path`, with its replicas. Used by delete to
    /// fan out replica commands before the tree is touched.
    pub fn files_under(&self, path: &DfsPath) -> Vec<(DfsPath, Vec<StorageRef>)> {
        let mut out = Vec::new();
        for (p, node) in &self.nodes {
            if let TreeNode::File { replicas, .. } = node {
                if p.is_subpath(path) {
                    out.push((p.clone(), replicas.iter().cloned().collect()));
                }
            }
        }
        out
    }

    /// Extends a file's replica set after a successful copy.
    pub fn add_replica(&mut self, path: &DfsPath, replica: StorageRef) -> DfsResult<()> {
        match self.nodes.get_mut(path) {
            Some(TreeNode::File { replicas, .. }) => {
                replicas.insert(replica);
                Ok(())
            }
            _ => Err(DfsError::NotFound(format!("not a file: {}", path))),
        }
    }

    /// Shrinks a file's replica set to a single server and resets the
    /// access counter. Returns the dropped replicas so the caller can issue
    /// delete commands to them.
    pub fn retain_one_replica(&mut self, path: &DfsPath) -> DfsResult<Vec<StorageRef>> {
        match self.nodes.get_mut(path) {
            Some(TreeNode::File { replicas, reads }) => {
                *reads = 0;
                let mut iter = replicas.iter().cloned();
                let keep = match iter.next() {
                    Some(keep) => keep,
                    None => return Ok(Vec::new()),
                };
                let dropped: Vec<StorageRef> = iter.collect();
                replicas.retain(|r| *r == keep);
                Ok(dropped)
            }
            _ => Err(DfsError::NotFound(format!("not a file: {}", path))),
        }
    }

    /// Counts one shared access on a file node. Returns true when the
    /// counter crosses `threshold`, in which case it is reset and the
    /// caller should schedule a replication. Non-file paths count nothing.
    pub fn note_read(&mut self, path: &DfsPath, threshold: u64) -> bool {
        if let Some(TreeNode::File { reads, .. }) = self.nodes.get_mut(path) {
            *reads += 1;
            if *reads >= threshold {
                *reads = 0;
                return true;
            }
        }
        false
    }

    fn check_insertable(&self, path: &DfsPath) -> DfsResult<DfsPath> {
        let parent = path.parent().ok_or_else(|| {
            DfsError::InvalidArgument("cannot insert the root directory".to_string())
        })?;
        match self.nodes.get(&parent) {
            Some(TreeNode::Dir { .. }) => {}
            Some(TreeNode::File { .. }) => {
                return Err(DfsError::NotFound(format!(
                    "parent is not a directory: {}",
                    parent
                )))
            }
            None => return Err(DfsError::NotFound(format!("parent missing: {}", parent))),
        }
        if self.exists(path) {
            return Err(DfsError::InvalidArgument(format!(
                "path already exists: {}",
                path
            )));
        }
        Ok(parent)
    }

    fn link_child(&mut self, parent: &DfsPath, child: &DfsPath) {
        if let Some(TreeNode::Dir { children }) = self.nodes.get_mut(parent) {
            children.insert(child.clone());
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert!(matches!(
            self.nodes.get(&DfsPath::root()),
            Some(TreeNode::Dir { .. })
        ));
        for (path, node) in &self.nodes {
            if !path.is_root() {
                let parent = path.parent().unwrap();
                match self.nodes.get(&parent) {
                    Some(TreeNode::Dir { children }) => assert!(children.contains(path)),
                    other => panic!("parent of {} is {:?}", path, other),
                }
            }
            match node {
                TreeNode::File { replicas, .. } => assert!(!replicas.is_empty()),
                TreeNode::Dir { children } => {
                    for child in children {
                        assert_eq!(child.parent().as_ref(), Some(path));
                        assert!(self.nodes.contains_key(child));
                    }
                }
            }
        }
    }
}

impl Default for DirTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DfsPath {
        DfsPath::new(s).unwrap()
    }

    fn server(n: u16) -> StorageRef {
        StorageRef {
            read_addr: format!("127.0.0.1:{}", 10_000 + n),
            command_addr: format!("127.0.0.1:{}", 20_000 + n),
        }
    }

    #[test]
    fn root_always_exists() {
        let tree = DirTree::new();
        assert!(tree.exists(&DfsPath::root()));
        assert!(tree.is_directory(&DfsPath::root()).unwrap());
        assert!(tree.children(&DfsPath::root()).unwrap().is_empty());
    }

    #[test]
    fn insert_requires_directory_parent() {
        let mut tree = DirTree::new();
        assert!(tree
            .insert_file(&p("/a/b"), server(1))
            .unwrap_err()
            .is_not_found());
        tree.insert_directory(&p("/a")).unwrap();
        tree.insert_file(&p("/a/b"), server(1)).unwrap();
        // a file cannot be a parent
        assert!(tree
            .insert_file(&p("/a/b/c"), server(1))
            .unwrap_err()
            .is_not_found());
        // occupied paths are rejected
        assert!(matches!(
            tree.insert_directory(&p("/a/b")),
            Err(DfsError::InvalidArgument(_))
        ));
        tree.check_invariants();
    }

    #[test]
    fn children_are_component_names() {
        let mut tree = DirTree::new();
        tree.insert_directory(&p("/a")).unwrap();
        tree.insert_file(&p("/a/x"), server(1)).unwrap();
        tree.insert_directory(&p("/a/y")).unwrap();
        let mut names = tree.children(&p("/a")).unwrap();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
        assert!(tree.children(&p("/a/x")).unwrap_err().is_not_found());
        tree.check_invariants();
    }

    #[test]
    fn remove_takes_the_whole_subtree() {
        let mut tree = DirTree::new();
        tree.insert_directory(&p("/a")).unwrap();
        tree.insert_directory(&p("/a/b")).unwrap();
        tree.insert_file(&p("/a/b/c"), server(1)).unwrap();
        tree.insert_file(&p("/ax"), server(1)).unwrap();

        tree.remove(&p("/a")).unwrap();
        assert!(!tree.exists(&p("/a")));
        assert!(!tree.exists(&p("/a/b")));
        assert!(!tree.exists(&p("/a/b/c")));
        // the sibling with a shared name prefix survives
        assert!(tree.exists(&p("/ax")));
        assert_eq!(tree.children(&DfsPath::root()).unwrap(), vec!["ax"]);
        tree.check_invariants();

        assert!(tree.remove(&p("/a")).unwrap_err().is_not_found());
        assert!(matches!(
            tree.remove(&DfsPath::root()),
            Err(DfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn files_under_collects_replicas() {
        let mut tree = DirTree::new();
        tree.insert_directory(&p("/a")).unwrap();
        tree.insert_file(&p("/a/x"), server(1)).unwrap();
        tree.insert_file(&p("/a/y"), server(2)).unwrap();
        tree.add_replica(&p("/a/y"), server(3)).unwrap();

        let mut files = tree.files_under(&p("/a"));
        files.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, p("/a/x"));
        assert_eq!(files[1].1.len(), 2);

        let single = tree.files_under(&p("/a/x"));
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn replica_set_grows_and_shrinks() {
        let mut tree = DirTree::new();
        tree.insert_file(&p("/f"), server(1)).unwrap();
        tree.add_replica(&p("/f"), server(2)).unwrap();
        tree.add_replica(&p("/f"), server(3)).unwrap();
        assert_eq!(tree.replicas_of(&p("/f")).unwrap().len(), 3);

        let dropped = tree.retain_one_replica(&p("/f")).unwrap();
        assert_eq!(dropped.len(), 2);
        assert_eq!(tree.replicas_of(&p("/f")).unwrap().len(), 1);
        tree.check_invariants();
    }

    #[test]
    fn read_counter_crosses_threshold_once() {
        let mut tree = DirTree::new();
        tree.insert_file(&p("/f"), server(1)).unwrap();
        for _ in 0..4 {
            assert!(!tree.note_read(&p("/f"), 5));
        }
        assert!(tree.note_read(&p("/f"), 5));
        // reset after the trigger
        assert!(!tree.note_read(&p("/f"), 5));
        // directories and missing paths never trigger
        assert!(!tree.note_read(&DfsPath::root(), 1));
        assert!(!tree.note_read(&p("/missing"), 1));
    }

    #[test]
    fn pick_replica_returns_a_member() {
        let mut tree = DirTree::new();
        tree.insert_file(&p("/f"), server(1)).unwrap();
        tree.add_replica(&p("/f"), server(2)).unwrap();
        let replicas = tree.replicas_of(&p("/f")).unwrap();
        for _ in 0..20 {
            assert!(replicas.contains(&tree.pick_replica(&p("/f")).unwrap()));
        }
        assert!(tree.pick_replica(&p("/missing")).unwrap_err().is_not_found());
        assert!(tree
            .pick_replica(&DfsPath::root())
            .unwrap_err()
            .is_not_found());
    }
}
