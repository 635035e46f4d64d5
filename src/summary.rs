use serde::Serialize;

use crate::grade::types::{ActivityId, Correction};

/// Grade distribution of one activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub activity_id: ActivityId,
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Corrections whose final grade is under the floor threshold
    pub below_threshold: usize,
    pub never_submitted: usize,
    pub mean_percentage: f64,
}

impl ActivitySummary {
    /// Summarize stored final grades. An empty activity yields zeros.
    pub fn from_corrections(activity_id: ActivityId, corrections: &[Correction], floor_threshold: f64) -> Self {
        let count = corrections.len();
        if count == 0 {
            return Self {
                activity_id,
                count: 0,
                mean: 0.0,
                median: 0.0,
                min: 0.0,
                max: 0.0,
                below_threshold: 0,
                never_submitted: 0,
                mean_percentage: 0.0,
            };
        }

        let mut grades: Vec<f64> = corrections.iter().map(|c| c.final_grade).collect();
        grades.sort_by(f64::total_cmp);

        let n = count as f64;
        let median = if count % 2 == 1 {
            grades[count / 2]
        } else {
            (grades[count / 2 - 1] + grades[count / 2]) / 2.0
        };

        Self {
            activity_id,
            count,
            mean: grades.iter().sum::<f64>() / n,
            median,
            min: grades[0],
            max: grades[count - 1],
            below_threshold: grades.iter().filter(|g| **g < floor_threshold).count(),
            never_submitted: corrections.iter().filter(|c| c.never_submitted).count(),
            mean_percentage: corrections.iter().map(|c| c.percentage).sum::<f64>() / n,
        }
    }
}
