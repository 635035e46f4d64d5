use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GradebookError, Result};

pub type StudentId = u64;
pub type ActivityId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    pub name: String,
    pub email: String,
}

/// One gradable part of a point scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalePart {
    pub name: String,
    pub max_points: f64,
}

/// How an activity is scored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointScale {
    /// Lab work graded on an experimental and a theoretical part
    ExperimentalTheoretical { experimental: f64, theoretical: f64 },
    /// Free-form list of parts
    Parts { parts: Vec<ScalePart> },
}

impl PointScale {
    /// The scale flattened into ordered parts
    pub fn parts(&self) -> Vec<ScalePart> {
        match self {
            PointScale::ExperimentalTheoretical { experimental, theoretical } => vec![
                ScalePart { name: "experimental".to_string(), max_points: *experimental },
                ScalePart { name: "theoretical".to_string(), max_points: *theoretical },
            ],
            PointScale::Parts { parts } => parts.clone(),
        }
    }

    pub fn max_points(&self) -> f64 {
        self.parts().iter().map(|p| p.max_points).sum()
    }

    pub fn validate(&self) -> Result<()> {
        let parts = self.parts();
        if parts.is_empty() {
            return Err(GradebookError::invalid("point scale needs at least one part"));
        }
        for part in &parts {
            if part.name.trim().is_empty() {
                return Err(GradebookError::invalid("scale part name must not be empty"));
            }
            if !part.max_points.is_finite() || part.max_points <= 0.0 {
                return Err(GradebookError::invalid(format!(
                    "scale part '{}' must have a positive maximum",
                    part.name
                )));
            }
        }
        Ok(())
    }

    /// Align submitted points with the scale parts.
    ///
    /// Missing parts count as 0, non-finite or negative values become 0 and
    /// values over a part's maximum are clamped to it.
    pub fn normalize_points(&self, points: &[f64]) -> Result<Vec<f64>> {
        let parts = self.parts();
        if points.len() > parts.len() {
            return Err(GradebookError::invalid(format!(
                "{} point values given for a scale with {} parts",
                points.len(),
                parts.len()
            )));
        }
        Ok(parts
            .iter()
            .enumerate()
            .map(|(i, part)| {
                let v = points.get(i).copied().unwrap_or(0.0);
                if v.is_finite() && v > 0.0 { v.min(part.max_points) } else { 0.0 }
            })
            .collect())
    }

    /// Every part at its maximum
    pub fn full_marks(&self) -> Vec<f64> {
        self.parts().iter().map(|p| p.max_points).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub name: String,
    pub scale: PointScale,
    /// Overrides the policy threshold for this activity only
    #[serde(default)]
    pub floor_threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewActivity {
    pub name: String,
    pub scale: PointScale,
    #[serde(default)]
    pub floor_threshold: Option<f64>,
}

/// Submitted values for a correction. Grades are derived, never submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorrectionInput {
    #[serde(default)]
    pub points: Vec<f64>,
    #[serde(default)]
    pub penalty: f64,
    #[serde(default)]
    pub bonus: f64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A graded submission of one student for one activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub activity_id: ActivityId,
    pub student_id: StudentId,
    pub points: Vec<f64>,
    pub penalty: f64,
    pub bonus: f64,
    #[serde(default)]
    pub never_submitted: bool,
    #[serde(default)]
    pub comment: Option<String>,
    pub final_grade: f64,
    pub percentage: f64,
    /// Threshold in force when the grade was computed
    pub floor_threshold: f64,
    #[serde(default)]
    pub feedback_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Correction {
    pub fn raw_points(&self) -> f64 {
        self.points.iter().sum()
    }
}

/// Sort order for correction listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionSort {
    /// Highest final grade first
    #[default]
    Grade,
    Name,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> PointScale {
        PointScale::ExperimentalTheoretical { experimental: 12.0, theoretical: 8.0 }
    }

    #[test]
    fn test_scale_max_points() {
        assert_eq!(lab().max_points(), 20.0);
        let parts = PointScale::Parts {
            parts: vec![
                ScalePart { name: "q1".into(), max_points: 4.0 },
                ScalePart { name: "q2".into(), max_points: 6.5 },
            ],
        };
        assert_eq!(parts.max_points(), 10.5);
    }

    #[test]
    fn test_scale_validation() {
        assert!(lab().validate().is_ok());
        assert!(PointScale::Parts { parts: vec![] }.validate().is_err());
        let zero = PointScale::ExperimentalTheoretical { experimental: 0.0, theoretical: 8.0 };
        assert!(zero.validate().is_err());
        let unnamed = PointScale::Parts {
            parts: vec![ScalePart { name: " ".into(), max_points: 2.0 }],
        };
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_normalize_points() {
        let scale = lab();
        assert_eq!(scale.normalize_points(&[10.0]).unwrap(), vec![10.0, 0.0]);
        assert_eq!(scale.normalize_points(&[15.0, f64::NAN]).unwrap(), vec![12.0, 0.0]);
        assert_eq!(scale.normalize_points(&[-1.0, 3.5]).unwrap(), vec![0.0, 3.5]);
        assert!(scale.normalize_points(&[1.0, 1.0, 1.0]).is_err());
        assert_eq!(scale.full_marks(), vec![12.0, 8.0]);
    }

    #[test]
    fn test_scale_json_shape() {
        let json = r#"{"kind":"experimental_theoretical","experimental":12,"theoretical":8}"#;
        let scale: PointScale = serde_json::from_str(json).unwrap();
        assert_eq!(scale, lab());
        let json = r#"{"kind":"parts","parts":[{"name":"q1","max_points":3}]}"#;
        let scale: PointScale = serde_json::from_str(json).unwrap();
        assert_eq!(scale.max_points(), 3.0);
    }
}
