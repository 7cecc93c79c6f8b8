pub mod fingerprint;
pub mod middleware;
pub mod models;
pub mod plan;
pub mod progress;
pub mod resume;
pub mod scheduler;
pub mod template;
pub mod throttle;
pub mod transfer_engine;

pub use fingerprint::fingerprint;
pub use middleware::{Chain, RetryLedger, RetryPolicy};
pub use models::{
    Category, ProgressEvent, RunSummary, SchedulerEvent, SkipReason, UnitOutcome, WorkUnit,
};
pub use plan::{
    DownloadOptions, ExtFilter, ForwardOptions, Order, PlanOptions, TransferPlan, UnitSelector,
    UploadOptions,
};
pub use progress::ProgressTracker;
pub use resume::{ResumeStore, UnitStatus};
pub use scheduler::Scheduler;
pub use template::OutputTemplate;
pub use throttle::Throttle;
