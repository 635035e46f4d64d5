use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::grade::types::{Activity, Correction, Student};

/// On-disk gradebook state.
///
/// Raw inputs are stored next to the derived grades together with the policy
/// that produced them, so grades can be recomputed when the policy changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub floor_threshold: f64,
    pub max_penalty: f64,
    pub next_student_id: u64,
    pub next_activity_id: u64,
    pub students: Vec<Student>,
    pub activities: Vec<Activity>,
    pub corrections: Vec<Correction>,
}

/// Write the snapshot atomically (temp file + rename)
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let data = serde_json::to_vec_pretty(snapshot)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    debug!(
        "Saved snapshot to {} ({} corrections)",
        path.display(),
        snapshot.corrections.len()
    );
    Ok(())
}

/// Read a snapshot. `None` when the file does not exist yet.
pub fn load(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}
