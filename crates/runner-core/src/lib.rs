pub mod config;
pub mod extract;
pub mod prompt;
pub mod protocol;
pub mod rate_limit;
pub mod report;
pub mod tooling;
pub mod types;

pub use config::{ConfigError, TaskConfig};
pub use protocol::{
    CompletionAssessment, NextActionResponse, PlanTaskResponse, PlannerAction, TaskSummary,
    WorkerCall,
};
pub use rate_limit::{is_rate_limit_message, is_rate_limited};
pub use report::{MarkdownReporter, ReportEmitter};
pub use tooling::{ToolCandidate, ToolingConfig};
pub use types::*;
