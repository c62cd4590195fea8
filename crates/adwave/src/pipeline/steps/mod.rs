//! One module per pipeline stage. Every stage returns a [`StepResult`],
//! reports its own failure to the client, and never propagates an error past
//! the job boundary.
//!
//! [`StepResult`]: crate::pipeline::StepResult

pub mod insights;
pub mod merge;
pub mod music;
pub mod speech;
pub mod transcript;
