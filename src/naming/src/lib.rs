pub mod dir_tree;
pub mod naming_service;
pub mod path_lock;

pub use dir_tree::{DirTree, TreeNode};
pub use naming_service::{NamingServer, NamingServerConfig, NamingService};
pub use path_lock::PathLockManager;

#[macro_use]
extern crate log;
