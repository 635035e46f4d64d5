use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::info;

use crate::config::MailConfig;
use crate::grade::types::{Activity, Correction, Student};

const TOKEN_LEN: usize = 32;

/// A notification waiting for delivery
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub feedback_url: String,
    pub queued_at: DateTime<Utc>,
}

/// Feedback Mailer
///
/// Issues the unguessable per-correction tokens behind student feedback links
/// and queues plain notifications in a bounded outbox. Delivery is left to
/// whatever drains the outbox.
pub struct FeedbackMailer {
    config: MailConfig,
    outbox: RwLock<Vec<OutgoingMail>>,
    queued_total: AtomicU64,
}

impl FeedbackMailer {
    pub fn new(config: &MailConfig) -> Self {
        Self {
            config: config.clone(),
            outbox: RwLock::new(Vec::new()),
            queued_total: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// New random token (OS-seeded CSPRNG)
    pub fn generate_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect()
    }

    pub fn feedback_url(&self, token: &str) -> String {
        format!("{}/feedback/{}", self.config.base_url.trim_end_matches('/'), token)
    }

    /// Build the notification for one correction. The grade shown is the
    /// stored one, derived by the calculator when the correction was recorded.
    pub fn compose(
        &self,
        student: &Student,
        activity: &Activity,
        correction: &Correction,
        token: &str,
    ) -> OutgoingMail {
        let feedback_url = self.feedback_url(token);
        let body = format!(
            "Hello {},\n\nYour work for \"{}\" has been graded.\nFinal grade: {:.2} ({:.1}% of {:.2} points)\n\nDetails: {}\n",
            student.name,
            activity.name,
            correction.final_grade,
            correction.percentage,
            activity.scale.max_points(),
            feedback_url,
        );
        OutgoingMail {
            from: self.config.from.clone(),
            to: student.email.clone(),
            subject: format!("Grade available: {}", activity.name),
            body,
            feedback_url,
            queued_at: Utc::now(),
        }
    }

    /// Queue a message. Returns false when mail is disabled.
    pub fn queue(&self, mail: OutgoingMail) -> bool {
        if !self.config.enabled {
            return false;
        }
        info!("📧 Queued feedback mail to {}", mail.to);

        let mut outbox = self.outbox.write();
        outbox.push(mail);
        self.queued_total.fetch_add(1, Ordering::Relaxed);

        if outbox.len() > self.config.max_outbox {
            let drain_count = outbox.len() - self.config.max_outbox;
            outbox.drain(..drain_count);
        }
        true
    }

    /// Most recent messages first
    pub fn recent(&self, limit: usize) -> Vec<OutgoingMail> {
        let outbox = self.outbox.read();
        outbox.iter().rev().take(limit).cloned().collect()
    }

    pub fn queued_total(&self) -> u64 {
        self.queued_total.load(Ordering::Relaxed)
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.config.enabled,
            "outbox": self.outbox.read().len(),
            "max_outbox": self.config.max_outbox,
            "total_queued": self.queued_total(),
        })
    }
}
