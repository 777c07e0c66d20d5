pub mod error;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod progress;
pub mod schedule;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod supervisor;
pub mod sync_engine;

pub use error::{DispatchError, ScheduleParseError, SourceWarning, StoreError, SyncError};
pub use models::{BackupJob, JobId, RunOutcome, RunReport};
pub use orchestrator::Orchestrator;
pub use progress::{RunRecord, RunTracker};
pub use schedule::{Schedule, is_due};
pub use scheduler::Scheduler;
pub use sources::{CopyTask, resolve};
pub use store::{JobStore, MemoryJobStore};
pub use supervisor::{RunHandle, RunSupervisor};
pub use sync_engine::{SyncEngine, SyncOutcome, SyncProgress, SyncSummary};
