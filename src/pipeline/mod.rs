pub mod config;
pub mod gate;
pub mod job;
pub mod prompts;
pub mod trace;

pub use config::{init_default_config, CliOverrides, JobConfig, RunConfig};
pub use gate::PauseGate;
pub use job::{JobController, JobHandle, JobNote, JobPhase, JobReport, ProgressSnapshot};
pub use prompts::PromptSet;
