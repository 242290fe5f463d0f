//! Five-most-recent activity ring buffer, pushed to the ControlPlane event
//! channel (spec §3: "the service retains the five most recent and pushes
//! updates").

use std::collections::VecDeque;
use std::sync::Mutex;

use uuid::Uuid;

use crate::model::{ActivityKind, ActivityRecord};

const RETAINED: usize = 5;

pub struct ActivityLog {
    records: Mutex<VecDeque<ActivityRecord>>,
    sender: async_channel::Sender<ActivityRecord>,
    receiver: async_channel::Receiver<ActivityRecord>,
}

impl ActivityLog {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        ActivityLog {
            records: Mutex::new(VecDeque::with_capacity(RETAINED)),
            sender,
            receiver,
        }
    }

    pub fn record(
        &self,
        kind: ActivityKind,
        title: impl Into<String>,
        detail: Option<String>,
        sync_pair_id: Option<Uuid>,
        disk_id: Option<Uuid>,
        files_count: Option<u64>,
        bytes_count: Option<u64>,
    ) -> ActivityRecord {
        let record = ActivityRecord {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            detail,
            timestamp: std::time::SystemTime::now(),
            sync_pair_id,
            disk_id,
            files_count,
            bytes_count,
        };

        let mut records = self.records.lock().unwrap();
        records.push_front(record.clone());
        records.truncate(RETAINED);
        drop(records);

        let _ = self.sender.try_send(record.clone());
        record
    }

    pub fn recent(&self, limit: usize) -> Vec<ActivityRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Subscribe to newly-recorded activity for the ControlPlane's
    /// `on_activities_updated` event stream.
    pub fn subscribe(&self) -> async_channel::Receiver<ActivityRecord> {
        self.receiver.clone()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}
