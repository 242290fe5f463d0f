//! Open file-handle table: `fh` -> which sync pair and virtual path a
//! handle refers to, so `read`/`write`/`release` don't re-resolve a path
//! on every call (spec §4.10).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OpenFile {
    pub pair: Uuid,
    pub virtual_path: String,
}

pub struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, OpenFile>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(&self, pair: Uuid, virtual_path: String) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.open.lock().await.insert(fh, OpenFile { pair, virtual_path });
        fh
    }

    pub async fn get(&self, fh: u64) -> Option<OpenFile> {
        self.open.lock().await.get(&fh).cloned()
    }

    pub async fn close(&self, fh: u64) {
        self.open.lock().await.remove(&fh);
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_assigns_unique_handles() {
        let table = HandleTable::new();
        let pair = Uuid::new_v4();
        let a = table.open(pair, "a.txt".into()).await;
        let b = table.open(pair, "b.txt".into()).await;
        assert_ne!(a, b);
        assert_eq!(table.get(a).await.unwrap().virtual_path, "a.txt");
    }

    #[tokio::test]
    async fn close_removes_handle() {
        let table = HandleTable::new();
        let fh = table.open(Uuid::new_v4(), "a.txt".into()).await;
        table.close(fh).await;
        assert!(table.get(fh).await.is_none());
    }
}
