pub mod config;
pub mod epub;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod textutil;

pub use error::{TranslateError, TranslateResult};
pub use pipeline::{JobConfig, JobController, JobHandle, JobPhase, JobReport, ProgressSnapshot};
