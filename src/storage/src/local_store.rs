use dfs_lib::{DfsError, DfsPath, DfsResult, StorageClient, StorageRef};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Byte storage under one host root directory. The exported filesystem is
/// exactly the subtree below the root; paths map onto host paths by
/// component-wise join and no metadata file is kept.
///
/// Operations are serialized with a single mutex; the naming server's path
/// locks provide the global discipline.
pub struct LocalStore {
    root: PathBuf,
    guard: tokio::sync::Mutex<()>,
}

impl LocalStore {
    /// Opens a store over an existing directory.
    pub fn new(root: PathBuf) -> DfsResult<Self> {
        if !root.exists() {
            return Err(DfsError::NotFound(format!(
                "storage root does not exist: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(DfsError::InvalidArgument(format!(
                "storage root is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self {
            root,
            guard: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_path(&self, path: &DfsPath) -> PathBuf {
        path.to_host_path(&self.root)
    }

    pub async fn size(&self, path: &DfsPath) -> DfsResult<u64> {
        let _guard = self.guard.lock().await;
        self.size_impl(path).await
    }

    /// Reads exactly `length` bytes starting at `offset`.
    pub async fn read(&self, path: &DfsPath, offset: i64, length: i64) -> DfsResult<Vec<u8>> {
        let _guard = self.guard.lock().await;
        if offset < 0 || length < 0 {
            return Err(DfsError::OutOfBounds(format!(
                "read {} offset {} length {}",
                path, offset, length
            )));
        }
        let size = self.size_impl(path).await?;
        let (offset, length) = (offset as u64, length as u64);
        if offset + length > size {
            return Err(DfsError::OutOfBounds(format!(
                "read {} offset {} length {} beyond size {}",
                path, offset, length, size
            )));
        }
        let host = self.host_path(path);
        let mut file = OpenOptions::new().read(true).open(&host).await.map_err(|e| {
            warn!("read: open {} failed! {}", path, e);
            DfsError::IoError(e.to_string())
        })?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
                warn!("read: seek {} failed! {}", path, e);
                DfsError::IoError(e.to_string())
            })?;
        }
        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).await.map_err(|e| {
            warn!("read: read {} failed! {}", path, e);
            DfsError::IoError(e.to_string())
        })?;
        Ok(buffer)
    }

    pub async fn write(&self, path: &DfsPath, offset: i64, data: &[u8]) -> DfsResult<()> {
        let _guard = self.guard.lock().await;
        self.write_impl(path, offset, data).await
    }

    /// Creates an empty regular file at `path`, with any missing ancestor
    /// directories. Returns false if the path already exists or the host
    /// refuses; creating the root is an error.
    pub async fn create(&self, path: &DfsPath) -> DfsResult<bool> {
        let _guard = self.guard.lock().await;
        self.create_impl(path).await
    }

    /// Deletes the file or directory tree at `path`. Deleting the root is an
    /// error; a missing path returns false.
    pub async fn delete(&self, path: &DfsPath) -> DfsResult<bool> {
        let _guard = self.guard.lock().await;
        self.delete_impl(path).await
    }

    /// Fetches the file's bytes from a remote read interface and replaces
    /// any local content (delete, then create, then write at offset 0).
    pub async fn copy(&self, path: &DfsPath, source: &StorageRef) -> DfsResult<bool> {
        let _guard = self.guard.lock().await;

        let remote = StorageClient::new(&source.read_addr);
        let size = remote.size(path).await?;
        let data = remote.read(path, 0, size as i64).await?;

        let host = self.host_path(path);
        if host.exists() {
            if !self.delete_impl(path).await? {
                warn!("copy: could not clear prior content of {}", path);
                return Ok(false);
            }
        }
        if !self.create_impl(path).await? {
            warn!("copy: create {} failed", path);
            return Ok(false);
        }
        if let Err(e) = self.write_impl(path, 0, &data).await {
            warn!("copy: write {} failed! {}", path, e);
            return Ok(false);
        }
        debug!("copy: {} ({} bytes) pulled from {}", path, size, source.read_addr);
        Ok(true)
    }

    async fn size_impl(&self, path: &DfsPath) -> DfsResult<u64> {
        let host = self.host_path(path);
        let meta = fs::metadata(&host)
            .await
            .map_err(|_| DfsError::NotFound(path.to_string()))?;
        if !meta.is_file() {
            return Err(DfsError::NotFound(format!("not a regular file: {}", path)));
        }
        Ok(meta.len())
    }

    async fn write_impl(&self, path: &DfsPath, offset: i64, data: &[u8]) -> DfsResult<()> {
        if offset < 0 {
            return Err(DfsError::OutOfBounds(format!(
                "write {} offset {}",
                path, offset
            )));
        }
        let size = self.size_impl(path).await?;
        let offset = offset as u64;
        let host = self.host_path(path);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&host)
            .await
            .map_err(|e| {
                warn!("write: open {} failed! {}", path, e);
                DfsError::IoError(e.to_string())
            })?;
        if offset > size {
            // The gap between the old end and the write offset must read
            // back as zeros, so it is written out explicitly.
            file.seek(SeekFrom::Start(size)).await.map_err(|e| {
                warn!("write: seek {} failed! {}", path, e);
                DfsError::IoError(e.to_string())
            })?;
            let gap = vec![0u8; (offset - size) as usize];
            file.write_all(&gap).await.map_err(|e| {
                warn!("write: zero-fill {} failed! {}", path, e);
                DfsError::IoError(e.to_string())
            })?;
        } else {
            file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
                warn!("write: seek {} failed! {}", path, e);
                DfsError::IoError(e.to_string())
            })?;
        }
        file.write_all(data).await.map_err(|e| {
            warn!("write: write {} failed! {}", path, e);
            DfsError::IoError(e.to_string())
        })?;
        file.flush().await.map_err(|e| {
            warn!("write: flush {} failed! {}", path, e);
            DfsError::IoError(e.to_string())
        })?;
        Ok(())
    }

    async fn create_impl(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Err(DfsError::InvalidArgument(
                "cannot create the root directory".to_string(),
            ));
        }
        let host = self.host_path(path);
        if host.exists() {
            return Ok(false);
        }
        if let Some(parent) = host.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!("create: make ancestors of {} failed! {}", path, e);
                return Ok(false);
            }
        }
        match fs::File::create(&host).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("create: {} failed! {}", path, e);
                Ok(false)
            }
        }
    }

    async fn delete_impl(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Err(DfsError::InvalidArgument(
                "cannot delete the root directory".to_string(),
            ));
        }
        let host = self.host_path(path);
        let meta = match fs::metadata(&host).await {
            Ok(meta) => meta,
            Err(_) => return Ok(false),
        };
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&host).await
        } else {
            fs::remove_file(&host).await
        };
        match removed {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("delete: {} failed! {}", path, e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_lib::{RpcServer, StorageServerHandler};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn new_store() -> (Arc<LocalStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path().to_path_buf()).unwrap();
        (Arc::new(store), tmp)
    }

    fn p(s: &str) -> DfsPath {
        DfsPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn create_size_read() {
        let (store, _tmp) = new_store();
        assert!(store.create(&p("/a/b/file.bin")).await.unwrap());
        assert_eq!(store.size(&p("/a/b/file.bin")).await.unwrap(), 0);
        // creating again reports existing
        assert!(!store.create(&p("/a/b/file.bin")).await.unwrap());
        // directories are not files
        assert!(store.size(&p("/a/b")).await.unwrap_err().is_not_found());
        // zero-length read succeeds on an empty file
        assert_eq!(store.read(&p("/a/b/file.bin"), 0, 0).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn create_root_is_an_error() {
        let (store, _tmp) = new_store();
        assert!(matches!(
            store.create(&DfsPath::root()).await,
            Err(DfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.delete(&DfsPath::root()).await,
            Err(DfsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn write_beyond_end_zero_fills() {
        let (store, _tmp) = new_store();
        let file = p("/f");
        assert!(store.create(&file).await.unwrap());
        store.write(&file, 10, b"hello").await.unwrap();
        assert_eq!(store.size(&file).await.unwrap(), 15);
        let data = store.read(&file, 0, 15).await.unwrap();
        assert_eq!(&data[..10], &[0u8; 10]);
        assert_eq!(&data[10..], b"hello");
    }

    #[tokio::test]
    async fn write_in_place_does_not_truncate() {
        let (store, _tmp) = new_store();
        let file = p("/f");
        assert!(store.create(&file).await.unwrap());
        store.write(&file, 0, b"0123456789").await.unwrap();
        store.write(&file, 0, b"ab").await.unwrap();
        assert_eq!(store.size(&file).await.unwrap(), 10);
        assert_eq!(store.read(&file, 0, 10).await.unwrap(), b"ab23456789");
    }

    #[tokio::test]
    async fn read_and_write_bounds() {
        let (store, _tmp) = new_store();
        let file = p("/f");
        assert!(store.create(&file).await.unwrap());
        store.write(&file, 0, b"abc").await.unwrap();

        for (offset, length) in [(-1, 1), (0, -1), (0, 4), (2, 2)] {
            assert!(matches!(
                store.read(&file, offset, length).await,
                Err(DfsError::OutOfBounds(_))
            ));
        }
        assert!(matches!(
            store.write(&file, -1, b"x").await,
            Err(DfsError::OutOfBounds(_))
        ));
        assert!(store
            .read(&p("/missing"), 0, 0)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .write(&p("/missing"), 0, b"x")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn delete_file_and_directory_tree() {
        let (store, tmp) = new_store();
        assert!(store.create(&p("/d/x")).await.unwrap());
        assert!(store.create(&p("/d/sub/y")).await.unwrap());

        assert!(store.delete(&p("/d/x")).await.unwrap());
        assert!(!store.delete(&p("/d/x")).await.unwrap());
        assert!(store.delete(&p("/d")).await.unwrap());
        assert!(!tmp.path().join("d").exists());
    }

    #[tokio::test]
    async fn copy_replaces_prior_content() {
        let (src_store, _src_tmp) = new_store();
        let file = p("/data/blob");
        assert!(src_store.create(&file).await.unwrap());
        src_store.write(&file, 0, b"fresh bytes").await.unwrap();

        let rpc = RpcServer::bind("127.0.0.1:0", Arc::new(StorageServerHandler::new(src_store)))
            .await
            .unwrap();
        let source = StorageRef {
            read_addr: rpc.local_addr().to_string(),
            command_addr: rpc.local_addr().to_string(),
        };

        let (dst_store, _dst_tmp) = new_store();
        assert!(dst_store.create(&file).await.unwrap());
        dst_store.write(&file, 0, b"stale stale stale").await.unwrap();

        assert!(dst_store.copy(&file, &source).await.unwrap());
        assert_eq!(dst_store.size(&file).await.unwrap(), 11);
        assert_eq!(dst_store.read(&file, 0, 11).await.unwrap(), b"fresh bytes");
    }

    #[tokio::test]
    async fn copy_from_unreachable_source_is_transport_error() {
        let (store, _tmp) = new_store();
        let source = StorageRef {
            read_addr: "127.0.0.1:1".to_string(),
            command_addr: "127.0.0.1:1".to_string(),
        };
        assert!(matches!(
            store.copy(&p("/f"), &source).await,
            Err(DfsError::Transport(_))
        ));
    }
}
