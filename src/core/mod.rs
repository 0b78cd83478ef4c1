//! 核心层：错误、状态快照与发布、作业监管、优雅关闭

pub mod error;
pub mod jobs;
pub mod shutdown;
pub mod state;

pub use error::{JobError, ScrapeError};
pub use jobs::{JobLease, JobSlot, JobSnapshot, JobSupervisor};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{CampaignState, NullSink, RecordingSink, ScrapeStatus, StatusCell, StatusSink};
