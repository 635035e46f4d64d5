use std::sync::atomic::{AtomicU64, Ordering};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::config::JournalConfig;
use crate::grade::types::{ActivityId, StudentId};

/// Grade Journal - append-only record of every grade change
///
/// Answers "what was this student's grade before the penalty was entered?".
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub timestamp: String,
    pub action: &'static str,
    pub activity_id: ActivityId,
    pub student_id: StudentId,
    pub old_grade: Option<f64>,
    pub new_grade: Option<f64>,
}

pub struct GradeJournal {
    config: JournalConfig,
    entries: RwLock<Vec<JournalEntry>>,
    total_recorded: AtomicU64,
}

impl GradeJournal {
    pub fn new(config: &JournalConfig) -> Self {
        Self {
            config: config.clone(),
            entries: RwLock::new(Vec::new()),
            total_recorded: AtomicU64::new(0),
        }
    }

    /// Record a grade change
    pub fn record(
        &self,
        action: &'static str,
        activity_id: ActivityId,
        student_id: StudentId,
        old_grade: Option<f64>,
        new_grade: Option<f64>,
    ) {
        if !self.config.enabled {
            return;
        }

        debug!(
            "journal: {} activity={} student={} {:?} -> {:?}",
            action, activity_id, student_id, old_grade, new_grade
        );

        let entry = JournalEntry {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            action,
            activity_id,
            student_id,
            old_grade,
            new_grade,
        };

        let mut entries = self.entries.write();
        entries.push(entry);
        self.total_recorded.fetch_add(1, Ordering::Relaxed);

        // Rotation: keep within max_entries
        if entries.len() > self.config.max_entries {
            let drain_count = entries.len() - self.config.max_entries;
            entries.drain(..drain_count);
        }
    }

    /// Search by activity and/or student, most recent first
    pub fn search(
        &self,
        activity_id: Option<ActivityId>,
        student_id: Option<StudentId>,
        limit: usize,
    ) -> Vec<JournalEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .filter(|e| activity_id.map_or(true, |a| e.activity_id == a))
            .filter(|e| student_id.map_or(true, |s| e.student_id == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let entries = self.entries.read();
        serde_json::json!({
            "enabled": self.config.enabled,
            "current_entries": entries.len(),
            "max_entries": self.config.max_entries,
            "total_recorded": self.total_recorded.load(Ordering::Relaxed),
        })
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(max_entries: usize) -> GradeJournal {
        GradeJournal::new(&JournalConfig { enabled: true, max_entries })
    }

    #[test]
    fn test_search_most_recent_first() {
        let j = journal(100);
        j.record("record", 1, 10, None, Some(12.0));
        j.record("record", 1, 11, None, Some(8.0));
        j.record("record", 2, 10, None, Some(15.0));
        j.record("record", 1, 10, Some(12.0), Some(9.0));

        let all = j.search(None, None, 10);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].new_grade, Some(9.0));

        let student = j.search(Some(1), Some(10), 10);
        assert_eq!(student.len(), 2);
        assert_eq!(student[0].old_grade, Some(12.0));

        assert_eq!(j.search(Some(2), None, 10).len(), 1);
        assert_eq!(j.search(None, None, 1).len(), 1);
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let j = journal(3);
        for i in 0..5u64 {
            j.record("record", 1, i, None, Some(i as f64));
        }
        let entries = j.search(None, None, 10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].student_id, 2);
        assert_eq!(j.total_recorded(), 5);
    }

    #[test]
    fn test_disabled_records_nothing() {
        let j = GradeJournal::new(&JournalConfig { enabled: false, max_entries: 10 });
        j.record("record", 1, 1, None, Some(1.0));
        assert!(j.search(None, None, 10).is_empty());
    }
}
