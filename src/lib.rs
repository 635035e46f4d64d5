//! gradebook - activities, point scales, corrections and final grades
//!
//! The binary in `main.rs` wires these modules into an HTTP service.

pub mod config;
pub mod error;
pub mod grade;
pub mod journal;
pub mod mailer;
pub mod metrics;
pub mod storage;
pub mod summary;
pub mod web;
