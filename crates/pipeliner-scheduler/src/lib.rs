pub mod cron_expr;
pub mod daemon;
pub mod schedule_file;
pub mod scheduler;
pub mod store;
pub mod timezone;

pub use daemon::{DaemonManager, DaemonStatus};
pub use scheduler::Scheduler;
pub use store::ScheduleStore;
