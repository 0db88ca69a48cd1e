#[cfg(test)]
mod tests {
    use crate::dispatcher::QueueKind;
    use crate::{
        Checksum, DirEntry, DispatcherConfig, FileAttributes, ListSink, LocationRelay,
        NamespaceDispatcher, NamespaceOp, NamespaceProvider, NamespaceReply, NamespaceRequest,
        ResponsePayload,
    };
    use async_trait::async_trait;
    use cluster_lib::{ClusterError, ClusterResult, EntryId, NsPath, Subject};
    use std::ops::Range;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::{mpsc, Semaphore};
    use tokio::time::sleep;

    struct MockProvider {
        calls: Mutex<Vec<String>>,
        /// When set, attribute reads park on the gate until permits arrive.
        block_reads: AtomicBool,
        gate: Semaphore,
    }

    impl MockProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                block_reads: AtomicBool::new(false),
                gate: Semaphore::new(0),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn count_prefix(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl NamespaceProvider for MockProvider {
        async fn create_entry(
            &self,
            _subject: &Subject,
            path: &NsPath,
            _attrs: &FileAttributes,
            _is_dir: bool,
        ) -> ClusterResult<EntryId> {
            self.record(format!("create:{}", path));
            Ok(path_id(path))
        }

        async fn delete_entry(
            &self,
            _subject: &Subject,
            id: Option<&EntryId>,
            path: Option<&NsPath>,
        ) -> ClusterResult<()> {
            self.record(format!(
                "delete:{}",
                id.map(|i| i.to_string())
                    .or_else(|| path.map(|p| p.to_string()))
                    .unwrap_or_default()
            ));
            Ok(())
        }

        async fn rename_entry(
            &self,
            _subject: &Subject,
            id: &EntryId,
            new_path: &NsPath,
            _overwrite: bool,
        ) -> ClusterResult<()> {
            self.record(format!("rename:{}:{}", id, new_path));
            Ok(())
        }

        async fn get_file_attributes(
            &self,
            _subject: &Subject,
            id: &EntryId,
        ) -> ClusterResult<FileAttributes> {
            self.record(format!("get:{}", id));
            if self.block_reads.load(Ordering::SeqCst) {
                let permit = self.gate.acquire().await.map_err(|_| {
                    ClusterError::Internal("gate closed".to_string())
                })?;
                permit.forget();
            }
            Ok(FileAttributes {
                size: Some(42),
                ..FileAttributes::default()
            })
        }

        async fn set_file_attributes(
            &self,
            _subject: &Subject,
            id: &EntryId,
            _attrs: &FileAttributes,
        ) -> ClusterResult<FileAttributes> {
            self.record(format!("set:{}", id));
            Ok(FileAttributes::default())
        }

        async fn list(
            &self,
            _subject: &Subject,
            path: &NsPath,
            _pattern: Option<&str>,
            _range: Option<Range<u64>>,
            sink: &mut (dyn ListSink + '_),
        ) -> ClusterResult<()> {
            self.record(format!("list:{}", path));
            for n in 0..5u128 {
                sink.accept(DirEntry {
                    name: format!("entry{}", n),
                    id: EntryId::new(0, n),
                    attrs: FileAttributes::default(),
                });
            }
            Ok(())
        }

        async fn path_to_id(
            &self,
            _subject: &Subject,
            path: &NsPath,
            _resolve_links: bool,
        ) -> ClusterResult<EntryId> {
            self.record(format!("resolve:{}", path));
            Ok(path_id(path))
        }

        async fn id_to_path(&self, _subject: &Subject, id: &EntryId) -> ClusterResult<NsPath> {
            self.record(format!("id-to-path:{}", id));
            Ok(NsPath::root())
        }

        async fn get_parent(&self, _subject: &Subject, id: &EntryId) -> ClusterResult<EntryId> {
            self.record(format!("parent:{}", id));
            Ok(EntryId::new(0, 0))
        }

        async fn add_cache_location(&self, id: &EntryId, pool: &str) -> ClusterResult<()> {
            self.record(format!("add-loc:{}:{}", id, pool));
            Ok(())
        }

        async fn clear_cache_location(&self, id: &EntryId, pool: &str) -> ClusterResult<()> {
            self.record(format!("clear-loc:{}:{}", id, pool));
            Ok(())
        }

        async fn get_cache_locations(&self, id: &EntryId) -> ClusterResult<Vec<String>> {
            self.record(format!("get-loc:{}", id));
            Ok(vec!["pool-a".to_string()])
        }

        async fn add_checksum(&self, id: &EntryId, _checksum: &Checksum) -> ClusterResult<()> {
            self.record(format!("add-sum:{}", id));
            Ok(())
        }

        async fn remove_checksum(&self, id: &EntryId, _kind: &str) -> ClusterResult<()> {
            self.record(format!("rm-sum:{}", id));
            Ok(())
        }

        async fn get_checksums(&self, id: &EntryId) -> ClusterResult<Vec<Checksum>> {
            self.record(format!("get-sum:{}", id));
            Ok(Vec::new())
        }

        async fn set_flag(&self, id: &EntryId, key: &str, _value: &str) -> ClusterResult<()> {
            self.record(format!("flag:{}:{}", id, key));
            Ok(())
        }
    }

    /// Ids derive their partition from the path's top-level directory:
    /// everything under /data lives in database 1, the rest in database 0.
    fn path_id(path: &NsPath) -> EntryId {
        let db = if path.starts_with(&NsPath::new("/data")) { 1 } else { 0 };
        EntryId::new(db, path.as_str().len() as u128)
    }

    struct RecordingRelay {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LocationRelay for RecordingRelay {
        async fn relay(&self, id: Option<EntryId>, op: &NamespaceOp) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", op.name(), id.map(|i| i.to_string()).unwrap_or_default()));
        }
    }

    fn single_worker_config() -> DispatcherConfig {
        DispatcherConfig {
            worker_groups: 1,
            workers_per_group: 1,
            list_workers: 1,
            ..DispatcherConfig::default()
        }
    }

    fn request(
        op: NamespaceOp,
        id: Option<EntryId>,
        path: Option<&str>,
    ) -> (NamespaceRequest, mpsc::UnboundedReceiver<NamespaceReply>) {
        let (mut req, rx) = NamespaceRequest::new(op, Subject::root(), Duration::from_secs(30));
        req.id = id;
        req.path = path.map(NsPath::new);
        (req, rx)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    // ==================== Routing ====================

    #[tokio::test]
    async fn test_partition_routing_is_deterministic() {
        let provider = MockProvider::new();
        let config = DispatcherConfig {
            worker_groups: 2,
            workers_per_group: 1,
            ..DispatcherConfig::default()
        };
        let dispatcher = NamespaceDispatcher::new(config, provider, None);

        let (a, _rx) = request(NamespaceOp::GetAttributes, Some(EntryId::new(0, 1)), None);
        let (b, _rx) = request(NamespaceOp::GetAttributes, Some(EntryId::new(1, 1)), None);
        let (c, _rx) = request(NamespaceOp::GetAttributes, Some(EntryId::new(0, 2)), None);

        let route_a = dispatcher.select_queue(&a).unwrap();
        let route_b = dispatcher.select_queue(&b).unwrap();
        let route_c = dispatcher.select_queue(&c).unwrap();

        assert_eq!(route_a.0, QueueKind::General);
        // Different partitions land on different groups.
        assert_ne!(route_a.1, route_b.1);
        // Same partition always lands on the same group.
        assert_eq!(route_a.1, route_c.1);
    }

    #[tokio::test]
    async fn test_listing_routes_to_list_pool() {
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), MockProvider::new(), None);
        let (req, _rx) = request(
            NamespaceOp::ListDirectory {
                pattern: None,
                range: None,
            },
            None,
            Some("/data"),
        );
        let (kind, _) = dispatcher.select_queue(&req).unwrap();
        assert_eq!(kind, QueueKind::List);
    }

    #[tokio::test]
    async fn test_location_pool_used_when_configured() {
        let config = DispatcherConfig {
            location_workers: 2,
            ..single_worker_config()
        };
        let dispatcher = NamespaceDispatcher::new(config, MockProvider::new(), None);
        let (req, _rx) = request(NamespaceOp::GetCacheLocations, Some(EntryId::new(0, 5)), None);
        let (kind, _) = dispatcher.select_queue(&req).unwrap();
        assert_eq!(kind, QueueKind::Location);

        // Without a location pool the general workers handle it.
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), MockProvider::new(), None);
        let (req, _rx) = request(NamespaceOp::GetCacheLocations, Some(EntryId::new(0, 5)), None);
        let (kind, _) = dispatcher.select_queue(&req).unwrap();
        assert_eq!(kind, QueueKind::General);
    }

    #[tokio::test]
    async fn test_listing_without_key_is_rejected() {
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), MockProvider::new(), None);
        let (req, mut rx) = request(
            NamespaceOp::ListDirectory {
                pattern: None,
                range: None,
            },
            None,
            None,
        );
        assert!(dispatcher.submit(req).is_err());
        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply.result, Err(ClusterError::InvalidParam(_))));
    }

    // ==================== FIFO Per Shard ====================

    #[tokio::test]
    async fn test_same_target_operations_execute_in_order() {
        let provider = MockProvider::new();
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), provider.clone(), None);

        let id = EntryId::new(0, 9);
        let (a, mut rx_a) = request(NamespaceOp::GetAttributes, Some(id), None);
        let (b, mut rx_b) = request(NamespaceOp::DeleteEntry, Some(id), None);
        dispatcher.submit(a).unwrap();
        dispatcher.submit(b).unwrap();

        let reply_a = rx_a.recv().await.unwrap();
        assert!(reply_a.result.is_ok());
        let reply_b = rx_b.recv().await.unwrap();
        assert!(reply_b.result.is_ok());

        let calls = provider.calls();
        assert_eq!(calls, vec![format!("get:{}", id), format!("delete:{}", id)]);
    }

    // ==================== TTL Discard ====================

    #[tokio::test]
    async fn test_expired_read_is_discarded_before_execution() {
        let provider = MockProvider::new();
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), provider.clone(), None);

        let (mut req, mut rx) = request(NamespaceOp::GetAttributes, Some(EntryId::new(0, 1)), None);
        req.created_at = Instant::now() - Duration::from_secs(60);
        req.ttl = Duration::from_secs(30);
        dispatcher.submit(req).unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply.result, Err(ClusterError::Timeout(_))));
        // Never reached the provider.
        assert_eq!(provider.count_prefix("get:"), 0);
    }

    #[tokio::test]
    async fn test_expired_mutation_is_executed_anyway() {
        let provider = MockProvider::new();
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), provider.clone(), None);

        let (mut req, mut rx) = request(NamespaceOp::DeleteEntry, Some(EntryId::new(0, 1)), None);
        req.created_at = Instant::now() - Duration::from_secs(60);
        req.ttl = Duration::from_secs(30);
        dispatcher.submit(req).unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(reply.result.is_ok());
        assert_eq!(provider.count_prefix("delete:"), 1);
    }

    // ==================== Folding ====================

    #[tokio::test]
    async fn test_duplicate_reads_fold_into_one_execution() {
        let provider = MockProvider::new();
        provider.block_reads.store(true, Ordering::SeqCst);
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), provider.clone(), None);

        let id = EntryId::new(0, 77);
        let (first, mut rx1) = request(NamespaceOp::GetAttributes, Some(id), None);
        dispatcher.submit(first).unwrap();
        wait_for("first read to start", || provider.count_prefix("get:") == 1).await;

        let (second, mut rx2) = request(NamespaceOp::GetAttributes, Some(id), None);
        let (third, mut rx3) = request(NamespaceOp::GetAttributes, Some(id), None);
        dispatcher.submit(second).unwrap();
        dispatcher.submit(third).unwrap();
        sleep(Duration::from_millis(50)).await;

        provider.block_reads.store(false, Ordering::SeqCst);
        provider.gate.add_permits(8);

        assert!(rx1.recv().await.unwrap().result.is_ok());
        assert!(rx2.recv().await.unwrap().result.is_ok());
        assert!(rx3.recv().await.unwrap().result.is_ok());

        // One execution answered all three requests.
        assert_eq!(provider.count_prefix("get:"), 1);
        assert_eq!(dispatcher.folded_count("get-attributes"), 2);
    }

    #[tokio::test]
    async fn test_fold_never_crosses_invalidating_write() {
        let provider = MockProvider::new();
        provider.block_reads.store(true, Ordering::SeqCst);
        let dispatcher =
            NamespaceDispatcher::new(single_worker_config(), provider.clone(), None);

        let id = EntryId::new(0, 88);
        let (first, mut rx1) = request(NamespaceOp::GetAttributes, Some(id), None);
        dispatcher.submit(first).unwrap();
        wait_for("first read to start", || provider.count_prefix("get:") == 1).await;

        let (write, mut rx2) = request(
            NamespaceOp::SetAttributes {
                attrs: FileAttributes::default(),
            },
            Some(id),
            None,
        );
        let (read_behind_write, mut rx3) = request(NamespaceOp::GetAttributes, Some(id), None);
        dispatcher.submit(write).unwrap();
        dispatcher.submit(read_behind_write).unwrap();
        sleep(Duration::from_millis(50)).await;

        provider.block_reads.store(false, Ordering::SeqCst);
        provider.gate.add_permits(8);

        assert!(rx1.recv().await.unwrap().result.is_ok());
        assert!(rx2.recv().await.unwrap().result.is_ok());
        assert!(rx3.recv().await.unwrap().result.is_ok());

        // The read queued behind the write was executed, not folded.
        assert_eq!(provider.count_prefix("get:"), 2);
        assert_eq!(provider.count_prefix("set:"), 1);
        assert_eq!(dispatcher.folded_count("get-attributes"), 0);
    }

    // ==================== Queue Capacity ====================

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let provider = MockProvider::new();
        provider.block_reads.store(true, Ordering::SeqCst);
        let config = DispatcherConfig {
            queue_capacity: 1,
            ..single_worker_config()
        };
        let dispatcher = NamespaceDispatcher::new(config, provider.clone(), None);

        let id = EntryId::new(0, 3);
        let (first, _rx1) = request(NamespaceOp::GetAttributes, Some(id), None);
        dispatcher.submit(first).unwrap();
        wait_for("worker to pick up first", || provider.count_prefix("get:") == 1).await;

        let (second, _rx2) = request(NamespaceOp::GetAttributes, Some(id), None);
        dispatcher.submit(second).unwrap();

        let (third, mut rx3) = request(NamespaceOp::GetAttributes, Some(id), None);
        dispatcher.submit(third).unwrap();
        let reply = rx3.recv().await.unwrap();
        assert!(matches!(
            reply.result,
            Err(ClusterError::ResourceExhausted(_))
        ));

        provider.gate.add_permits(8);
    }

    // ==================== Listing ====================

    #[tokio::test]
    async fn test_listing_streams_partial_batches() {
        let provider = MockProvider::new();
        let config = DispatcherConfig {
            list_batch_size: 2,
            ..single_worker_config()
        };
        let dispatcher = NamespaceDispatcher::new(config, provider, None);

        let (req, mut rx) = request(
            NamespaceOp::ListDirectory {
                pattern: None,
                range: None,
            },
            None,
            Some("/data/dir"),
        );
        dispatcher.submit(req).unwrap();

        let mut batches = Vec::new();
        loop {
            let reply = rx.recv().await.unwrap();
            let is_final = reply.is_final;
            match reply.result.unwrap() {
                ResponsePayload::Listing(entries) => batches.push((entries.len(), is_final)),
                other => panic!("unexpected payload {:?}", other),
            }
            if is_final {
                break;
            }
        }
        assert_eq!(batches, vec![(2, false), (2, false), (1, true)]);
    }

    // ==================== Path Cache ====================

    #[tokio::test]
    async fn test_path_resolution_populates_shard_cache() {
        let provider = MockProvider::new();
        let config = DispatcherConfig {
            worker_groups: 2,
            workers_per_group: 1,
            ..DispatcherConfig::default()
        };
        let dispatcher = NamespaceDispatcher::new(config, provider.clone(), None);

        let (req, mut rx) = request(NamespaceOp::MapPath, None, Some("/data/exp01/file"));
        dispatcher.submit(req).unwrap();
        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply.result, Ok(ResponsePayload::Id(_))));

        // The walk stopped at /data: the root maps to database 0 while the
        // whole /data subtree maps to database 1.
        let (by_path, _rx) = request(NamespaceOp::GetAttributes, None, Some("/data/other"));
        let (by_id, _rx) = request(NamespaceOp::GetAttributes, Some(EntryId::new(1, 1)), None);
        let route_path = dispatcher.select_queue(&by_path).unwrap();
        let route_id = dispatcher.select_queue(&by_id).unwrap();
        assert_eq!(route_path.1, route_id.1);
    }

    // ==================== Relay ====================

    #[tokio::test]
    async fn test_location_modifications_are_relayed() {
        let provider = MockProvider::new();
        let relay = Arc::new(RecordingRelay {
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = NamespaceDispatcher::new(
            single_worker_config(),
            provider.clone(),
            Some(relay.clone()),
        );

        let id = EntryId::new(0, 4);
        let (add, mut rx) = request(
            NamespaceOp::AddCacheLocation {
                pool: "pool-a".to_string(),
            },
            Some(id),
            None,
        );
        dispatcher.submit(add).unwrap();
        assert!(rx.recv().await.unwrap().result.is_ok());

        let (get, mut rx) = request(NamespaceOp::GetCacheLocations, Some(id), None);
        dispatcher.submit(get).unwrap();
        assert!(rx.recv().await.unwrap().result.is_ok());

        wait_for("relay delivery", || !relay.seen.lock().unwrap().is_empty()).await;
        let seen = relay.seen.lock().unwrap().clone();
        // Only modifications are forwarded, reads are not.
        assert_eq!(seen, vec![format!("add-cache-location:{}", id)]);
    }
}
