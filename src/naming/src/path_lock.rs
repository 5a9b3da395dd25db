use dfs_lib::DfsPath;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

struct Waiter {
    exclusive: bool,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
    queue: VecDeque<Waiter>,
}

impl LockState {
    fn can_grant(&self, exclusive: bool) -> bool {
        if exclusive {
            !self.exclusive && self.shared == 0
        } else {
            !self.exclusive
        }
    }

    fn is_idle(&self) -> bool {
        !self.exclusive && self.shared == 0 && self.queue.is_empty()
    }
}

/// Per-path shared/exclusive locks with FIFO queues. Lock states are
/// created on first acquisition and dropped again once idle.
///
/// Requests queue in arrival order: a shared request that arrives while an
/// exclusive request is queued waits behind it, so writers cannot starve.
/// Reentrant acquisition is not supported. Clones share one lock table.
#[derive(Clone)]
pub struct PathLockManager {
    states: Arc<Mutex<HashMap<DfsPath, LockState>>>,
}

impl PathLockManager {
    pub fn new() -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires one lock on `path`. Waits until granted.
    pub async fn acquire(&self, path: &DfsPath, exclusive: bool) {
        let pending = {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(path.clone()).or_default();
            if state.queue.is_empty() && state.can_grant(exclusive) {
                if exclusive {
                    state.exclusive = true;
                } else {
                    state.shared += 1;
                }
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Waiter { exclusive, tx });
                Some(rx)
            }
        };
        if let Some(rx) = pending {
            // The releasing holder flips the state before signalling, so a
            // successful receive means the lock is already ours.
            let _ = rx.await;
        }
    }

    /// Releases one lock on `path` and hands it to the next waiters.
    pub fn release(&self, path: &DfsPath, exclusive: bool) {
        let mut states = self.states.lock().unwrap();
        let state = match states.get_mut(path) {
            Some(state) => state,
            None => {
                warn!("release of unheld lock on {}", path);
                return;
            }
        };
        if exclusive {
            if !state.exclusive {
                warn!("exclusive release without exclusive holder on {}", path);
                return;
            }
            state.exclusive = false;
        } else {
            if state.shared == 0 {
                warn!("shared release without shared holder on {}", path);
                return;
            }
            state.shared -= 1;
        }
        Self::wake_waiters(state);
        if state.is_idle() {
            states.remove(path);
        }
    }

    fn wake_waiters(state: &mut LockState) {
        while let Some(front) = state.queue.front() {
            if front.exclusive {
                if state.exclusive || state.shared > 0 {
                    break;
                }
                let waiter = state.queue.pop_front().unwrap();
                state.exclusive = true;
                if waiter.tx.send(()).is_err() {
                    // waiter went away; take the grant back and move on
                    state.exclusive = false;
                    continue;
                }
                break;
            } else {
                if state.exclusive {
                    break;
                }
                let waiter = state.queue.pop_front().unwrap();
                state.shared += 1;
                if waiter.tx.send(()).is_err() {
                    state.shared -= 1;
                }
            }
        }
    }

    /// Locks the ancestor chain of `path`: shared on every proper ancestor
    /// in root-first order, then the requested mode on `path` itself. The
    /// fixed order makes cycles in the wait-for graph impossible.
    pub async fn lock_chain(&self, path: &DfsPath, exclusive: bool) -> ChainGuard {
        let mut held = Vec::with_capacity(path.components().len() + 1);
        for ancestor in path.ancestors() {
            self.acquire(&ancestor, false).await;
            held.push((ancestor, false));
        }
        self.acquire(path, exclusive).await;
        held.push((path.clone(), exclusive));
        ChainGuard {
            manager: self.clone(),
            held,
        }
    }
}

impl Default for PathLockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a locked ancestor chain; releases in reverse order on drop.
pub struct ChainGuard {
    manager: PathLockManager,
    held: Vec<(DfsPath, bool)>,
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        let held = std::mem::take(&mut self.held);
        for (path, exclusive) in held.into_iter().rev() {
            self.manager.release(&path, exclusive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn p(s: &str) -> DfsPath {
        DfsPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn shared_holders_coexist() {
        let locks = PathLockManager::new();
        let path = p("/a");
        locks.acquire(&path, false).await;
        locks.acquire(&path, false).await;
        locks.release(&path, false);
        locks.release(&path, false);
        // both released: exclusive is immediately available
        timeout(Duration::from_secs(1), locks.acquire(&path, true))
            .await
            .unwrap();
        locks.release(&path, true);
    }

    #[tokio::test]
    async fn exclusive_excludes_everyone() {
        let locks = PathLockManager::new();
        let path = p("/a");
        locks.acquire(&path, true).await;

        let contender = {
            let locks = locks.clone();
            let path = path.clone();
            tokio::spawn(async move {
                locks.acquire(&path, false).await;
                locks.release(&path, false);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        locks.release(&path, true);
        timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn queued_writer_blocks_later_readers() {
        let locks = PathLockManager::new();
        let path = p("/a");
        let order = Arc::new(Mutex::new(Vec::new()));

        locks.acquire(&path, false).await;

        let writer = {
            let locks = locks.clone();
            let path = path.clone();
            let order = order.clone();
            tokio::spawn(async move {
                locks.acquire(&path, true).await;
                order.lock().unwrap().push("writer");
                locks.release(&path, true);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reader = {
            let locks = locks.clone();
            let path = path.clone();
            let order = order.clone();
            tokio::spawn(async move {
                locks.acquire(&path, false).await;
                order.lock().unwrap().push("reader");
                locks.release(&path, false);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the late reader must not jump the queued writer
        assert!(order.lock().unwrap().is_empty());

        locks.release(&path, false);
        timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["writer", "reader"]);
    }

    #[tokio::test]
    async fn no_request_is_starved() {
        let locks = PathLockManager::new();
        let path = p("/hot");
        let done = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..40 {
            let locks = locks.clone();
            let path = path.clone();
            let done = done.clone();
            tasks.push(tokio::spawn(async move {
                let exclusive = i % 5 == 0;
                locks.acquire(&path, exclusive).await;
                tokio::task::yield_now().await;
                locks.release(&path, exclusive);
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 40);
    }

    #[tokio::test]
    async fn chain_guard_locks_ancestors_shared() {
        let locks = PathLockManager::new();
        let guard = locks.lock_chain(&p("/a/b/c"), true).await;

        // ancestors stay open for shared use
        timeout(Duration::from_secs(1), locks.acquire(&p("/a"), false))
            .await
            .unwrap();
        locks.release(&p("/a"), false);

        // the target is exclusively held
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks.acquire(&p("/a/b/c"), false).await;
                locks.release(&p("/a/b/c"), false);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();

        // everything released: an exclusive chain on an ancestor works
        let guard = locks.lock_chain(&p("/a"), true).await;
        drop(guard);
    }

    #[tokio::test]
    async fn disjoint_subtrees_do_not_contend() {
        let locks = PathLockManager::new();
        let left = locks.lock_chain(&p("/left/x"), true).await;
        let right = timeout(Duration::from_secs(1), locks.lock_chain(&p("/right/y"), true))
            .await
            .unwrap();
        drop(left);
        drop(right);
    }
}
