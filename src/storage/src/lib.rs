pub mod local_store;
pub mod storage_server;

pub use local_store::LocalStore;
pub use storage_server::{StorageServer, StorageServerConfig};

#[macro_use]
extern crate log;

#[cfg(test)]
mod storage_server_tests;
