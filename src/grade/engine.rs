use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{GradebookError, Result};
use crate::grade::calculator::{self, GradeCalculator, GradeInput, GradeResult};
use crate::grade::types::{
    Activity, ActivityId, Correction, CorrectionInput, CorrectionSort, NewActivity, NewStudent,
    ScalePart, Student, StudentId,
};
use crate::journal::GradeJournal;
use crate::mailer::FeedbackMailer;
use crate::metrics::MetricsCounters;
use crate::storage::{self, Snapshot};
use crate::summary::ActivitySummary;

/// Corrections are unique per (activity, student)
type CorrectionKey = (ActivityId, StudentId);

/// Quiet period before a burst of changes is written to disk
const SAVE_DEBOUNCE: Duration = Duration::from_millis(200);

/// What a student sees behind a feedback link
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackView {
    pub student_name: String,
    pub activity_name: String,
    pub parts: Vec<ScalePart>,
    pub points: Vec<f64>,
    pub penalty: f64,
    pub bonus: f64,
    pub never_submitted: bool,
    pub comment: Option<String>,
    pub final_grade: f64,
    pub percentage: f64,
    pub max_points: f64,
}

/// Core gradebook engine - owns all students, activities and corrections.
///
/// Final grades are only ever produced here, through the shared calculator,
/// and stored alongside their raw inputs.
pub struct GradeEngine {
    pub config: Arc<Config>,
    pub calculator: GradeCalculator,
    pub journal: Arc<GradeJournal>,
    pub mailer: Arc<FeedbackMailer>,
    pub metrics: Arc<MetricsCounters>,
    students: DashMap<StudentId, Student>,
    activities: DashMap<ActivityId, Activity>,
    corrections: DashMap<CorrectionKey, Correction>,
    tokens: DashMap<String, CorrectionKey>,
    next_student_id: AtomicU64,
    next_activity_id: AtomicU64,
    /// Upserts hold it shared, cascading deletes and scale changes exclusively
    structure_lock: RwLock<()>,
    storage_path: Option<PathBuf>,
    save_lock: Mutex<()>,
    dirty: AtomicBool,
    save_notify: Notify,
}

impl GradeEngine {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let engine = Self {
            calculator: GradeCalculator::new(&config.grading),
            journal: Arc::new(GradeJournal::new(&config.journal)),
            mailer: Arc::new(FeedbackMailer::new(&config.mail)),
            metrics: Arc::new(MetricsCounters::new()),
            students: DashMap::new(),
            activities: DashMap::new(),
            corrections: DashMap::new(),
            tokens: DashMap::new(),
            next_student_id: AtomicU64::new(1),
            next_activity_id: AtomicU64::new(1),
            storage_path: config.storage.path.as_ref().map(PathBuf::from),
            structure_lock: RwLock::new(()),
            save_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            save_notify: Notify::new(),
            config,
        };

        if let Some(path) = &engine.storage_path {
            match storage::load(path)
                .map_err(|e| anyhow::anyhow!("Failed to load snapshot '{}': {}", path.display(), e))?
            {
                Some(snapshot) => {
                    engine.restore(snapshot);
                    info!(
                        "📚 Restored {} students, {} activities, {} corrections from {}",
                        engine.students.len(),
                        engine.activities.len(),
                        engine.corrections.len(),
                        path.display()
                    );
                }
                None => info!("📚 No snapshot at {}, starting empty", path.display()),
            }
        } else {
            info!("📚 In-memory gradebook (storage.path not set)");
        }

        Ok(engine)
    }

    // ── students ─────────────────────────────────────

    pub fn create_student(&self, new: NewStudent) -> Result<Student> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(GradebookError::invalid("student name must not be empty"));
        }
        let email = new.email.trim();
        if !email.contains('@') {
            return Err(GradebookError::invalid(format!("'{}' is not an email address", email)));
        }

        let student = Student {
            id: self.next_student_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            email: email.to_string(),
        };
        self.students.insert(student.id, student.clone());
        debug!("Created student {} ({})", student.id, student.name);
        self.mark_dirty();
        Ok(student)
    }

    pub fn get_student(&self, id: StudentId) -> Result<Student> {
        self.students
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| GradebookError::not_found("student", id))
    }

    pub fn list_students(&self) -> Vec<Student> {
        let mut students: Vec<Student> = self.students.iter().map(|s| s.clone()).collect();
        students.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        students
    }

    /// Remove a student together with all their corrections
    pub fn delete_student(&self, id: StudentId) -> Result<Student> {
        let _structure = self.structure_lock.write();
        let (_, student) = self
            .students
            .remove(&id)
            .ok_or_else(|| GradebookError::not_found("student", id))?;
        let removed = self.remove_corrections_where(|(_, s)| *s == id);
        info!("Deleted student {} and {} corrections", id, removed);
        self.mark_dirty();
        Ok(student)
    }

    // ── activities ───────────────────────────────────

    pub fn create_activity(&self, new: NewActivity) -> Result<Activity> {
        let new = Self::validate_activity(new)?;
        let activity = Activity {
            id: self.next_activity_id.fetch_add(1, Ordering::Relaxed),
            name: new.name,
            scale: new.scale,
            floor_threshold: new.floor_threshold,
            created_at: Utc::now(),
        };
        self.activities.insert(activity.id, activity.clone());
        info!(
            "Created activity {} '{}' ({} points)",
            activity.id,
            activity.name,
            activity.scale.max_points()
        );
        self.mark_dirty();
        Ok(activity)
    }

    pub fn get_activity(&self, id: ActivityId) -> Result<Activity> {
        self.activities
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| GradebookError::not_found("activity", id))
    }

    pub fn list_activities(&self) -> Vec<Activity> {
        let mut activities: Vec<Activity> = self.activities.iter().map(|a| a.clone()).collect();
        activities.sort_by_key(|a| a.id);
        activities
    }

    /// Replace name, scale and threshold override. Every correction of the
    /// activity is regraded under the new definition.
    pub fn update_activity(&self, id: ActivityId, new: NewActivity) -> Result<Activity> {
        let new = Self::validate_activity(new)?;
        let _structure = self.structure_lock.write();
        let updated = {
            let mut activity = self
                .activities
                .get_mut(&id)
                .ok_or_else(|| GradebookError::not_found("activity", id))?;
            activity.name = new.name;
            activity.scale = new.scale;
            activity.floor_threshold = new.floor_threshold;
            activity.clone()
        };

        let mut by_id = HashMap::new();
        by_id.insert(id, updated.clone());
        let regraded = self.regrade(&by_id);
        info!("Updated activity {} (regraded {} corrections)", id, regraded);
        self.mark_dirty();
        Ok(updated)
    }

    /// Remove an activity together with its corrections
    pub fn delete_activity(&self, id: ActivityId) -> Result<Activity> {
        let _structure = self.structure_lock.write();
        let (_, activity) = self
            .activities
            .remove(&id)
            .ok_or_else(|| GradebookError::not_found("activity", id))?;
        let removed = self.remove_corrections_where(|(a, _)| *a == id);
        info!("Deleted activity {} and {} corrections", id, removed);
        self.mark_dirty();
        Ok(activity)
    }

    fn validate_activity(mut new: NewActivity) -> Result<NewActivity> {
        new.name = new.name.trim().to_string();
        if new.name.is_empty() {
            return Err(GradebookError::invalid("activity name must not be empty"));
        }
        new.scale.validate()?;
        if let Some(t) = new.floor_threshold {
            if !t.is_finite() || t < 0.0 {
                return Err(GradebookError::invalid("floor_threshold must be a non-negative number"));
            }
        }
        Ok(new)
    }

    // ── corrections ──────────────────────────────────

    /// Create or replace the correction of a student for an activity
    pub fn record_correction(
        &self,
        activity_id: ActivityId,
        student_id: StudentId,
        input: CorrectionInput,
    ) -> Result<Correction> {
        let _structure = self.structure_lock.read();
        let activity = self.get_activity(activity_id)?;
        self.get_student(student_id)?;
        let points = activity.scale.normalize_points(&input.points)?;

        let correction = self.build_correction(
            &activity,
            student_id,
            points,
            input.penalty,
            input.bonus,
            false,
            input.comment,
        );
        let stored = self.store_correction(correction, "record");
        self.metrics.corrections_recorded.fetch_add(1, Ordering::Relaxed);
        self.mark_dirty();
        Ok(stored)
    }

    /// "Never submitted" shortcut: full marks with the maximum penalty
    pub fn mark_never_submitted(&self, activity_id: ActivityId, student_id: StudentId) -> Result<Correction> {
        let _structure = self.structure_lock.read();
        let activity = self.get_activity(activity_id)?;
        self.get_student(student_id)?;
        let comment = self
            .corrections
            .get(&(activity_id, student_id))
            .and_then(|c| c.comment.clone());

        let correction = self.build_correction(
            &activity,
            student_id,
            activity.scale.full_marks(),
            self.calculator.max_penalty(),
            0.0,
            true,
            comment,
        );
        let stored = self.store_correction(correction, "never_submitted");
        self.metrics.never_submitted.fetch_add(1, Ordering::Relaxed);
        self.mark_dirty();
        Ok(stored)
    }

    pub fn get_correction(&self, activity_id: ActivityId, student_id: StudentId) -> Result<Correction> {
        self.corrections
            .get(&(activity_id, student_id))
            .map(|c| c.clone())
            .ok_or_else(|| {
                GradebookError::not_found("correction", format!("{}/{}", activity_id, student_id))
            })
    }

    pub fn list_corrections(&self, activity_id: ActivityId, sort: CorrectionSort) -> Result<Vec<Correction>> {
        self.get_activity(activity_id)?;
        let mut corrections: Vec<Correction> = self
            .corrections
            .iter()
            .filter(|c| c.key().0 == activity_id)
            .map(|c| c.clone())
            .collect();

        match sort {
            CorrectionSort::Grade => corrections.sort_by(|a, b| {
                b.final_grade
                    .total_cmp(&a.final_grade)
                    .then(a.student_id.cmp(&b.student_id))
            }),
            CorrectionSort::Name => {
                let names: HashMap<StudentId, String> = self
                    .students
                    .iter()
                    .map(|s| (*s.key(), s.name.clone()))
                    .collect();
                corrections.sort_by(|a, b| {
                    names
                        .get(&a.student_id)
                        .cmp(&names.get(&b.student_id))
                        .then(a.student_id.cmp(&b.student_id))
                });
            }
            CorrectionSort::Updated => corrections.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
        }
        Ok(corrections)
    }

    pub fn delete_correction(&self, activity_id: ActivityId, student_id: StudentId) -> Result<Correction> {
        let (_, removed) = self
            .corrections
            .remove(&(activity_id, student_id))
            .ok_or_else(|| {
                GradebookError::not_found("correction", format!("{}/{}", activity_id, student_id))
            })?;
        self.forget(&removed, "delete");
        self.mark_dirty();
        Ok(removed)
    }

    /// Regrade every stored correction under the current policy
    pub fn recompute_all(&self) -> usize {
        let activities: HashMap<ActivityId, Activity> = self
            .activities
            .iter()
            .map(|a| (*a.key(), a.clone()))
            .collect();
        let regraded = self.regrade(&activities);
        info!("🔁 Recomputed {} corrections", regraded);
        self.mark_dirty();
        regraded
    }

    /// Stateless calculation under the configured policy
    pub fn preview(&self, input: &GradeInput) -> GradeResult {
        self.metrics.previews.fetch_add(1, Ordering::Relaxed);
        self.calculator.calculate(input)
    }

    pub fn summary(&self, activity_id: ActivityId) -> Result<ActivitySummary> {
        let activity = self.get_activity(activity_id)?;
        let corrections = self.list_corrections(activity_id, CorrectionSort::Grade)?;
        let threshold = self.calculator.threshold_for(activity.floor_threshold);
        Ok(ActivitySummary::from_corrections(activity_id, &corrections, threshold))
    }

    // ── feedback ─────────────────────────────────────

    /// Queue a feedback mail for every correction of the activity.
    /// Returns the number of queued messages.
    pub fn notify_activity(&self, activity_id: ActivityId) -> Result<usize> {
        let activity = self.get_activity(activity_id)?;
        if !self.mailer.enabled() {
            info!("Mail disabled, not notifying activity {}", activity_id);
            return Ok(0);
        }

        let corrections = self.list_corrections(activity_id, CorrectionSort::Name)?;
        let mut queued = 0;
        for correction in corrections {
            let student = match self.get_student(correction.student_id) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping notification: {}", e);
                    continue;
                }
            };
            let token = self.ensure_token(activity_id, correction.student_id)?;
            let mail = self.mailer.compose(&student, &activity, &correction, &token);
            if self.mailer.queue(mail) {
                queued += 1;
            }
        }

        self.metrics.notifications.fetch_add(queued as u64, Ordering::Relaxed);
        info!("📧 Queued {} feedback mails for activity {}", queued, activity_id);
        self.mark_dirty();
        Ok(queued)
    }

    /// Feedback token of a correction, issued on first use
    pub fn ensure_token(&self, activity_id: ActivityId, student_id: StudentId) -> Result<String> {
        let key = (activity_id, student_id);
        let mut correction = self.corrections.get_mut(&key).ok_or_else(|| {
            GradebookError::not_found("correction", format!("{}/{}", activity_id, student_id))
        })?;
        if let Some(token) = &correction.feedback_token {
            return Ok(token.clone());
        }
        let token = FeedbackMailer::generate_token();
        correction.feedback_token = Some(token.clone());
        drop(correction);
        self.tokens.insert(token.clone(), key);
        self.mark_dirty();
        Ok(token)
    }

    pub fn feedback(&self, token: &str) -> Result<FeedbackView> {
        let key = self
            .tokens
            .get(token)
            .map(|k| *k)
            .ok_or_else(|| GradebookError::not_found("feedback", token))?;
        let correction = self.get_correction(key.0, key.1)?;
        let activity = self.get_activity(key.0)?;
        let student = self.get_student(key.1)?;

        Ok(FeedbackView {
            student_name: student.name,
            activity_name: activity.name,
            parts: activity.scale.parts(),
            max_points: activity.scale.max_points(),
            points: correction.points,
            penalty: correction.penalty,
            bonus: correction.bonus,
            never_submitted: correction.never_submitted,
            comment: correction.comment,
            final_grade: correction.final_grade,
            percentage: correction.percentage,
        })
    }

    // ── persistence ──────────────────────────────────

    pub fn snapshot(&self) -> Snapshot {
        let mut corrections: Vec<Correction> = self.corrections.iter().map(|c| c.clone()).collect();
        corrections.sort_by_key(|c| (c.activity_id, c.student_id));
        let mut students: Vec<Student> = self.students.iter().map(|s| s.clone()).collect();
        students.sort_by_key(|s| s.id);

        Snapshot {
            floor_threshold: self.calculator.floor_threshold(),
            max_penalty: self.calculator.max_penalty(),
            next_student_id: self.next_student_id.load(Ordering::Relaxed),
            next_activity_id: self.next_activity_id.load(Ordering::Relaxed),
            students,
            activities: self.list_activities(),
            corrections,
        }
    }

    /// Replace the current state with a snapshot, regrading if it was
    /// produced under a different policy
    pub fn restore(&self, snapshot: Snapshot) {
        self.students.clear();
        self.activities.clear();
        self.corrections.clear();
        self.tokens.clear();

        for s in snapshot.students {
            self.students.insert(s.id, s);
        }
        for a in snapshot.activities {
            self.activities.insert(a.id, a);
        }
        for c in snapshot.corrections {
            if let Some(token) = &c.feedback_token {
                self.tokens.insert(token.clone(), (c.activity_id, c.student_id));
            }
            self.corrections.insert((c.activity_id, c.student_id), c);
        }

        let max_student = self.students.iter().map(|s| *s.key()).max().unwrap_or(0);
        let max_activity = self.activities.iter().map(|a| *a.key()).max().unwrap_or(0);
        self.next_student_id
            .store(snapshot.next_student_id.max(max_student + 1), Ordering::Relaxed);
        self.next_activity_id
            .store(snapshot.next_activity_id.max(max_activity + 1), Ordering::Relaxed);

        if snapshot.floor_threshold != self.calculator.floor_threshold()
            || snapshot.max_penalty != self.calculator.max_penalty()
        {
            warn!(
                "Grading policy changed (threshold {} -> {}, max penalty {} -> {}), regrading",
                snapshot.floor_threshold,
                self.calculator.floor_threshold(),
                snapshot.max_penalty,
                self.calculator.max_penalty()
            );
            let activities: HashMap<ActivityId, Activity> = self
                .activities
                .iter()
                .map(|a| (*a.key(), a.clone()))
                .collect();
            self.regrade(&activities);
            self.mark_dirty();
        }
    }

    /// Schedule a snapshot write. No-op for an in-memory gradebook.
    fn mark_dirty(&self) {
        if self.storage_path.is_some() {
            self.dirty.store(true, Ordering::Release);
            self.save_notify.notify_one();
        }
    }

    /// Write the snapshot now if anything changed since the last save.
    /// On failure the changes stay pending for the next attempt.
    pub fn save_now(&self) -> Result<()> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        storage::save(path, &self.snapshot()).inspect_err(|_| {
            self.dirty.store(true, Ordering::Release);
        })
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Background saver: debounces changes and writes snapshots off the
    /// async worker threads. Save failures are logged and counted; the
    /// in-memory state stays authoritative and is retried on the next change.
    pub async fn run_persist_loop(self: Arc<Self>) {
        if self.storage_path.is_none() {
            return;
        }
        loop {
            self.save_notify.notified().await;
            tokio::time::sleep(SAVE_DEBOUNCE).await;

            let engine = self.clone();
            match tokio::task::spawn_blocking(move || engine.save_now()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.metrics.save_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to save gradebook snapshot: {}", e);
                }
                Err(e) => {
                    self.metrics.save_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Snapshot save task failed: {}", e);
                }
            }
        }
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "students": self.students.len(),
            "activities": self.activities.len(),
            "corrections": self.corrections.len(),
            "floor_threshold": self.calculator.floor_threshold(),
            "max_penalty": self.calculator.max_penalty(),
            "persistent": self.storage_path.is_some(),
            "unsaved_changes": self.has_unsaved_changes(),
            "journal": self.journal.get_stats(),
            "mail": self.mailer.get_stats(),
        })
    }

    // ── internals ────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn build_correction(
        &self,
        activity: &Activity,
        student_id: StudentId,
        points: Vec<f64>,
        penalty: f64,
        bonus: f64,
        never_submitted: bool,
        comment: Option<String>,
    ) -> Correction {
        let penalty = calculator::non_negative(penalty);
        let bonus = calculator::non_negative(bonus);
        let result = self.calculator.calculate(&GradeInput {
            raw_points: points.iter().sum(),
            max_points: activity.scale.max_points(),
            penalty,
            bonus,
            floor_threshold: activity.floor_threshold,
        });

        Correction {
            activity_id: activity.id,
            student_id,
            points,
            penalty,
            bonus,
            never_submitted,
            comment: comment.filter(|c| !c.trim().is_empty()),
            final_grade: result.final_grade,
            percentage: result.percentage,
            floor_threshold: self.calculator.threshold_for(activity.floor_threshold),
            feedback_token: None,
            updated_at: Utc::now(),
        }
    }

    /// Upsert, keeping an already issued feedback token
    fn store_correction(&self, mut correction: Correction, action: &'static str) -> Correction {
        let key = (correction.activity_id, correction.student_id);
        let old_grade = match self.corrections.entry(key) {
            Entry::Occupied(mut e) => {
                correction.feedback_token = e.get().feedback_token.clone();
                Some(e.insert(correction.clone()).final_grade)
            }
            Entry::Vacant(e) => {
                e.insert(correction.clone());
                None
            }
        };
        self.journal.record(
            action,
            key.0,
            key.1,
            old_grade,
            Some(correction.final_grade),
        );
        correction
    }

    /// Recompute grades of corrections belonging to the given activities
    fn regrade(&self, activities: &HashMap<ActivityId, Activity>) -> usize {
        let mut regraded = 0;
        for mut entry in self.corrections.iter_mut() {
            let Some(activity) = activities.get(&entry.activity_id) else {
                continue;
            };
            let c = entry.value_mut();
            let old_grade = c.final_grade;

            let parts = activity.scale.parts().len();
            c.points.truncate(parts);
            if c.never_submitted {
                c.points = activity.scale.full_marks();
                c.penalty = self.calculator.max_penalty();
                c.bonus = 0.0;
            } else {
                // Truncated above, so the length always fits the scale
                c.points = activity.scale.normalize_points(&c.points).unwrap_or_default();
            }

            let result = self.calculator.calculate(&GradeInput {
                raw_points: c.raw_points(),
                max_points: activity.scale.max_points(),
                penalty: c.penalty,
                bonus: c.bonus,
                floor_threshold: activity.floor_threshold,
            });
            c.final_grade = result.final_grade;
            c.percentage = result.percentage;
            c.floor_threshold = self.calculator.threshold_for(activity.floor_threshold);

            if c.final_grade != old_grade {
                c.updated_at = Utc::now();
                self.journal.record(
                    "recompute",
                    c.activity_id,
                    c.student_id,
                    Some(old_grade),
                    Some(c.final_grade),
                );
            }
            regraded += 1;
        }
        self.metrics.recomputed.fetch_add(regraded as u64, Ordering::Relaxed);
        regraded
    }

    fn remove_corrections_where(&self, pred: impl Fn(&CorrectionKey) -> bool) -> usize {
        let keys: Vec<CorrectionKey> = self
            .corrections
            .iter()
            .filter(|c| pred(c.key()))
            .map(|c| *c.key())
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some((_, correction)) = self.corrections.remove(&key) {
                self.forget(&correction, "cascade_delete");
                removed += 1;
            }
        }
        removed
    }

    fn forget(&self, correction: &Correction, action: &'static str) {
        if let Some(token) = &correction.feedback_token {
            self.tokens.remove(token);
        }
        self.metrics.corrections_deleted.fetch_add(1, Ordering::Relaxed);
        self.journal.record(
            action,
            correction.activity_id,
            correction.student_id,
            Some(correction.final_grade),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GradingConfig;
    use crate::grade::types::PointScale;

    fn engine_with(config: Config) -> GradeEngine {
        GradeEngine::new(Arc::new(config)).unwrap()
    }

    fn engine() -> GradeEngine {
        engine_with(Config::default())
    }

    fn lab(engine: &GradeEngine) -> Activity {
        engine
            .create_activity(NewActivity {
                name: "Lab 1".into(),
                scale: PointScale::ExperimentalTheoretical { experimental: 12.0, theoretical: 8.0 },
                floor_threshold: None,
            })
            .unwrap()
    }

    fn student(engine: &GradeEngine, name: &str) -> Student {
        engine
            .create_student(NewStudent {
                name: name.into(),
                email: format!("{}@example.org", name.to_lowercase()),
            })
            .unwrap()
    }

    fn input(points: Vec<f64>, penalty: f64, bonus: f64) -> CorrectionInput {
        CorrectionInput { points, penalty, bonus, comment: None }
    }

    #[test]
    fn test_record_correction_applies_rule() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");

        let c = engine
            .record_correction(activity.id, ada.id, input(vec![10.0, 8.0], 3.0, 0.0))
            .unwrap();
        assert_eq!(c.final_grade, 15.0);
        assert_eq!(c.percentage, 90.0);
        assert_eq!(c.floor_threshold, 5.0);

        let c = engine
            .record_correction(activity.id, ada.id, input(vec![3.0], 10.0, 0.0))
            .unwrap();
        assert_eq!(c.final_grade, 3.0);
        assert_eq!(c.points, vec![3.0, 0.0]);

        let history = engine.journal.search(Some(activity.id), Some(ada.id), 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_grade, Some(15.0));
        assert_eq!(history[0].new_grade, Some(3.0));
    }

    #[test]
    fn test_unknown_references_and_bad_points() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");

        assert!(matches!(
            engine.record_correction(99, ada.id, CorrectionInput::default()),
            Err(GradebookError::NotFound { kind: "activity", .. })
        ));
        assert!(matches!(
            engine.record_correction(activity.id, 99, CorrectionInput::default()),
            Err(GradebookError::NotFound { kind: "student", .. })
        ));
        assert!(matches!(
            engine.record_correction(activity.id, ada.id, input(vec![1.0, 1.0, 1.0], 0.0, 0.0)),
            Err(GradebookError::Invalid(_))
        ));
    }

    #[test]
    fn test_never_submitted() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");
        let c = engine.mark_never_submitted(activity.id, ada.id).unwrap();
        assert!(c.never_submitted);
        assert_eq!(c.points, vec![12.0, 8.0]);
        assert_eq!(c.penalty, 15.0);
        assert_eq!(c.final_grade, 5.0);
    }

    #[test]
    fn test_activity_threshold_override() {
        let engine = engine();
        let activity = engine
            .create_activity(NewActivity {
                name: "Exam".into(),
                scale: PointScale::Parts {
                    parts: vec![ScalePart { name: "all".into(), max_points: 20.0 }],
                },
                floor_threshold: Some(6.0),
            })
            .unwrap();
        let ada = student(&engine, "Ada");
        let c = engine
            .record_correction(activity.id, ada.id, input(vec![7.0], 3.0, 0.0))
            .unwrap();
        assert_eq!(c.final_grade, 6.0);
        assert_eq!(c.floor_threshold, 6.0);
    }

    #[test]
    fn test_list_sorted_by_grade_and_name() {
        let engine = engine();
        let activity = lab(&engine);
        let zoe = student(&engine, "Zoe");
        let ada = student(&engine, "Ada");
        engine.record_correction(activity.id, zoe.id, input(vec![12.0, 8.0], 0.0, 0.0)).unwrap();
        engine.record_correction(activity.id, ada.id, input(vec![4.0], 0.0, 0.0)).unwrap();

        let by_grade = engine.list_corrections(activity.id, CorrectionSort::Grade).unwrap();
        assert_eq!(by_grade[0].student_id, zoe.id);
        let by_name = engine.list_corrections(activity.id, CorrectionSort::Name).unwrap();
        assert_eq!(by_name[0].student_id, ada.id);
    }

    #[test]
    fn test_update_activity_regrades() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");
        engine.record_correction(activity.id, ada.id, input(vec![10.0, 8.0], 0.0, 0.0)).unwrap();

        engine
            .update_activity(activity.id, NewActivity {
                name: "Lab 1 (short)".into(),
                scale: PointScale::Parts {
                    parts: vec![ScalePart { name: "only".into(), max_points: 6.0 }],
                },
                floor_threshold: None,
            })
            .unwrap();
        let c = engine.get_correction(activity.id, ada.id).unwrap();
        assert_eq!(c.points, vec![6.0]);
        assert_eq!(c.final_grade, 6.0);
        assert_eq!(c.percentage, 100.0);
    }

    #[test]
    fn test_delete_cascades() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");
        let bob = student(&engine, "Bob");
        engine.record_correction(activity.id, ada.id, input(vec![10.0], 0.0, 0.0)).unwrap();
        engine.record_correction(activity.id, bob.id, input(vec![10.0], 0.0, 0.0)).unwrap();

        engine.delete_student(ada.id).unwrap();
        assert_eq!(engine.list_corrections(activity.id, CorrectionSort::Grade).unwrap().len(), 1);

        engine.delete_activity(activity.id).unwrap();
        assert!(engine.get_correction(activity.id, bob.id).is_err());
        assert!(engine.get_activity(activity.id).is_err());
    }

    #[test]
    fn test_notify_issues_stable_tokens() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");
        engine.record_correction(activity.id, ada.id, input(vec![10.0, 8.0], 3.0, 0.0)).unwrap();

        assert_eq!(engine.notify_activity(activity.id).unwrap(), 1);
        let token = engine.get_correction(activity.id, ada.id).unwrap().feedback_token.unwrap();
        assert_eq!(engine.ensure_token(activity.id, ada.id).unwrap(), token);

        // regrading keeps the link alive
        engine.record_correction(activity.id, ada.id, input(vec![12.0, 8.0], 3.0, 0.0)).unwrap();
        let view = engine.feedback(&token).unwrap();
        assert_eq!(view.final_grade, 17.0);
        assert_eq!(view.student_name, "Ada");
        assert_eq!(view.max_points, 20.0);

        engine.delete_correction(activity.id, ada.id).unwrap();
        assert!(engine.feedback(&token).is_err());
    }

    #[test]
    fn test_notify_with_mail_disabled() {
        let mut config = Config::default();
        config.mail.enabled = false;
        let engine = engine_with(config);
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");
        engine.record_correction(activity.id, ada.id, input(vec![10.0], 0.0, 0.0)).unwrap();
        assert_eq!(engine.notify_activity(activity.id).unwrap(), 0);
    }

    #[test]
    fn test_summary() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");
        let bob = student(&engine, "Bob");
        engine.record_correction(activity.id, ada.id, input(vec![10.0, 8.0], 3.0, 0.0)).unwrap();
        engine.record_correction(activity.id, bob.id, input(vec![3.0], 0.0, 0.0)).unwrap();
        let s = engine.summary(activity.id).unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.mean, 9.0);
        assert_eq!(s.below_threshold, 1);
    }

    #[test]
    fn test_invalid_student_and_activity() {
        let engine = engine();
        assert!(engine
            .create_student(NewStudent { name: "Ada".into(), email: "nope".into() })
            .is_err());
        assert!(engine
            .create_activity(NewActivity {
                name: "x".into(),
                scale: PointScale::Parts { parts: vec![] },
                floor_threshold: None,
            })
            .is_err());
        assert!(engine
            .create_activity(NewActivity {
                name: "x".into(),
                scale: PointScale::ExperimentalTheoretical { experimental: 1.0, theoretical: 1.0 },
                floor_threshold: Some(-2.0),
            })
            .is_err());
    }

    #[test]
    fn test_snapshot_restore_regrades_on_policy_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grades.json");
        let mut config = Config::default();
        config.storage.path = Some(path.to_string_lossy().into_owned());

        let (activity_id, ada_id, token) = {
            let engine = engine_with(config.clone());
            let activity = lab(&engine);
            let ada = student(&engine, "Ada");
            engine.record_correction(activity.id, ada.id, input(vec![7.0], 3.0, 0.0)).unwrap();
            engine.notify_activity(activity.id).unwrap();
            let token = engine.ensure_token(activity.id, ada.id).unwrap();
            engine.save_now().unwrap();
            assert!(!engine.has_unsaved_changes());
            (activity.id, ada.id, token)
        };

        config.grading = GradingConfig { floor_threshold: 6.0, max_penalty: 15.0 };
        let engine = engine_with(config);
        let c = engine.get_correction(activity_id, ada_id).unwrap();
        assert_eq!(c.final_grade, 6.0);
        assert_eq!(c.floor_threshold, 6.0);
        assert!(engine.feedback(&token).is_ok());

        // ids keep increasing after a restore
        let bob = student(&engine, "Bob");
        assert!(bob.id > ada_id);
    }

    #[test]
    fn test_never_submitted_follows_max_penalty_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = Some(dir.path().join("grades.json").to_string_lossy().into_owned());

        let (activity_id, ada_id) = {
            let engine = engine_with(config.clone());
            let activity = lab(&engine);
            let ada = student(&engine, "Ada");
            let c = engine.mark_never_submitted(activity.id, ada.id).unwrap();
            assert_eq!(c.penalty, 15.0);
            assert_eq!(c.final_grade, 5.0);
            engine.save_now().unwrap();
            (activity.id, ada.id)
        };

        config.grading = GradingConfig { floor_threshold: 5.0, max_penalty: 10.0 };
        let engine = engine_with(config);
        let c = engine.get_correction(activity_id, ada_id).unwrap();
        assert!(c.never_submitted);
        assert_eq!(c.penalty, 10.0);
        assert_eq!(c.final_grade, 10.0);
        // the regrade is queued for the next save
        assert!(engine.has_unsaved_changes());
    }

    #[test]
    fn test_recompute_all_counts_every_correction() {
        let engine = engine();
        let activity = lab(&engine);
        let ada = student(&engine, "Ada");
        let bob = student(&engine, "Bob");
        engine.record_correction(activity.id, ada.id, input(vec![10.0, 8.0], 3.0, 0.0)).unwrap();
        engine.mark_never_submitted(activity.id, bob.id).unwrap();

        assert_eq!(engine.recompute_all(), 2);
        assert_eq!(engine.get_correction(activity.id, ada.id).unwrap().final_grade, 15.0);
        assert_eq!(engine.get_correction(activity.id, bob.id).unwrap().final_grade, 5.0);
    }

    #[test]
    fn test_failed_save_keeps_change_pending() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = Config::default();
        config.storage.path = Some(blocker.join("grades.json").to_string_lossy().into_owned());

        let engine = engine_with(config);
        let ada = engine.create_student(NewStudent {
            name: "Ada".into(),
            email: "ada@example.org".into(),
        });
        assert!(ada.is_ok());
        assert_eq!(engine.list_students().len(), 1);

        assert!(matches!(engine.save_now(), Err(GradebookError::Storage(_))));
        assert!(engine.has_unsaved_changes());
    }

    #[test]
    fn test_concurrent_delete_leaves_no_orphans() {
        let engine = engine();
        let activity = lab(&engine);
        let students: Vec<Student> = (0..64).map(|i| student(&engine, &format!("S{}", i))).collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for s in &students {
                    let _ = engine.record_correction(activity.id, s.id, input(vec![10.0], 0.0, 0.0));
                }
            });
            scope.spawn(|| {
                for s in &students {
                    let _ = engine.mark_never_submitted(activity.id, s.id);
                }
            });
            scope.spawn(|| {
                for s in students.iter().rev() {
                    engine.delete_student(s.id).unwrap();
                }
            });
        });

        assert!(engine.list_students().is_empty());
        assert!(engine
            .list_corrections(activity.id, CorrectionSort::Grade)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_persist_loop_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grades.json");
        let mut config = Config::default();
        config.storage.path = Some(path.to_string_lossy().into_owned());

        let engine = Arc::new(engine_with(config));
        tokio::spawn(engine.clone().run_persist_loop());
        student(&engine, "Ada");

        let mut saved = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !engine.has_unsaved_changes() {
                saved = storage::load(&path).unwrap();
                if saved.is_some() {
                    break;
                }
            }
        }
        let snapshot = saved.expect("snapshot written by the background saver");
        assert_eq!(snapshot.students.len(), 1);
        assert_eq!(engine.metrics.save_failures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_preview() {
        let engine = engine();
        let result = engine.preview(&GradeInput {
            raw_points: 4.0,
            max_points: 20.0,
            penalty: 0.0,
            bonus: 2.0,
            floor_threshold: None,
        });
        assert_eq!(result.final_grade, 6.0);
        assert_eq!(result.percentage, 20.0);
    }
}
