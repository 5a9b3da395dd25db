#[cfg(test)]
mod tests {
    use crate::storage_server::{StorageServer, StorageServerConfig};
    use async_trait::async_trait;
    use dfs_lib::{
        DfsPath, DfsResult, RegistrationHandler, RegistrationServerHandler, RpcServer,
        StorageClient, StorageRef,
    };
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct MockRegistry {
        duplicates: Vec<DfsPath>,
        seen: Mutex<Option<(StorageRef, Vec<DfsPath>)>>,
    }

    #[async_trait]
    impl RegistrationHandler for MockRegistry {
        async fn handle_register(
            &self,
            server: StorageRef,
            paths: Vec<DfsPath>,
        ) -> DfsResult<Vec<DfsPath>> {
            *self.seen.lock().unwrap() = Some((server, paths));
            Ok(self.duplicates.clone())
        }
    }

    fn p(s: &str) -> DfsPath {
        DfsPath::new(s).unwrap()
    }

    async fn start_with_mock_naming(
        root: &TempDir,
        duplicates: Vec<DfsPath>,
    ) -> (StorageServer, Arc<MockRegistry>, RpcServer) {
        let registry = Arc::new(MockRegistry {
            duplicates,
            seen: Mutex::new(None),
        });
        let naming = RpcServer::bind(
            "127.0.0.1:0",
            Arc::new(RegistrationServerHandler::new(registry.clone())),
        )
        .await
        .unwrap();

        let mut server = StorageServer::new(StorageServerConfig {
            root: root.path().to_path_buf(),
            naming_addr: naming.local_addr().to_string(),
            hostname: "127.0.0.1".to_string(),
            client_port: 0,
            command_port: 0,
        })
        .unwrap();
        server.start().await.unwrap();
        (server, registry, naming)
    }

    #[tokio::test]
    async fn start_registers_all_local_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("a/b/one"), b"1").unwrap();
        std::fs::write(tmp.path().join("two"), b"2").unwrap();

        let (server, registry, _naming) = start_with_mock_naming(&tmp, Vec::new()).await;

        let (registered, mut paths) = registry.seen.lock().unwrap().clone().unwrap();
        paths.sort();
        assert_eq!(paths, vec![p("/a/b/one"), p("/two")]);
        assert_eq!(&registered, server.local_ref().unwrap());
        assert!(registered.read_addr.starts_with("127.0.0.1:"));
        assert_ne!(registered.read_addr, registered.command_addr);
    }

    #[tokio::test]
    async fn duplicates_are_deleted_and_empty_ancestors_pruned() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("dup/deep")).unwrap();
        std::fs::write(tmp.path().join("dup/deep/b"), b"b").unwrap();
        std::fs::write(tmp.path().join("dup/a"), b"a").unwrap();
        std::fs::write(tmp.path().join("keep"), b"k").unwrap();

        let duplicates = vec![p("/dup/deep/b"), p("/dup/a")];
        let (_server, _registry, _naming) = start_with_mock_naming(&tmp, duplicates).await;

        assert!(!tmp.path().join("dup").exists());
        assert!(tmp.path().join("keep").exists());
    }

    #[tokio::test]
    async fn pruning_stops_at_first_non_empty_ancestor() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("shared/inner")).unwrap();
        std::fs::write(tmp.path().join("shared/inner/dup"), b"d").unwrap();
        std::fs::write(tmp.path().join("shared/other"), b"o").unwrap();

        let (_server, _registry, _naming) =
            start_with_mock_naming(&tmp, vec![p("/shared/inner/dup")]).await;

        assert!(!tmp.path().join("shared/inner").exists());
        assert!(tmp.path().join("shared/other").exists());
    }

    #[tokio::test]
    async fn started_server_answers_byte_requests() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("hello"), b"hello world").unwrap();

        let (server, _registry, _naming) = start_with_mock_naming(&tmp, Vec::new()).await;
        let local_ref = server.local_ref().unwrap().clone();

        let client = StorageClient::new(&local_ref.read_addr);
        let path = p("/hello");
        assert_eq!(client.size(&path).await.unwrap(), 11);
        assert_eq!(client.read(&path, 6, 5).await.unwrap(), b"world");
        client.write(&path, 0, b"HELLO").await.unwrap();
        assert_eq!(client.read(&path, 0, 11).await.unwrap(), b"HELLO world");
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (mut server, _registry, _naming) = start_with_mock_naming(&tmp, Vec::new()).await;
        assert!(server.start().await.is_err());
    }
}
