//! Durable (de)serialization of the Index's flat map, atomically replaced
//! on flush (spec §4.2: "a periodic flush ... and a flush-on-shutdown").

use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::FileEntry;

/// On-disk shape of one Index entry, keyed by `(sync_pair_id, virtual_path)`.
#[derive(Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub entries: Vec<SnapshotRow>,
}

#[derive(Serialize, Deserialize)]
pub struct SnapshotRow {
    pub sync_pair_id: Uuid,
    #[serde(flatten)]
    pub entry: FileEntry,
}

pub async fn load_snapshot(path: &Path) -> io::Result<DashMap<(Uuid, String), FileEntry>> {
    let bytes = tokio::fs::read(path).await?;
    let snapshot: IndexSnapshot = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let map = DashMap::new();
    for row in snapshot.entries {
        map.insert((row.sync_pair_id, row.entry.virtual_path.clone()), row.entry);
    }
    Ok(map)
}

pub async fn save_snapshot(path: &PathBuf, rows: &[((Uuid, String), FileEntry)]) -> io::Result<()> {
    let snapshot = IndexSnapshot {
        entries: rows
            .iter()
            .map(|((pair, _vpath), entry)| SnapshotRow {
                sync_pair_id: *pair,
                entry: entry.clone(),
            })
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
