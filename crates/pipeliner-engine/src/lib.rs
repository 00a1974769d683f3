pub mod capture;
pub mod condition;
pub mod executor;
pub mod history;
pub mod parallel;
pub mod process;
pub mod runner;
pub mod template;
pub mod workspace;

pub use capture::parse_capture;
pub use condition::ConditionEvaluator;
pub use executor::{Engine, ExecutionReport, StepContext, StepDispatcher, StepOutcome};
pub use history::{HistoryStore, Recorder};
pub use process::ShellRunner;
pub use runner::{BackoffPolicy, RunContext, RunOutcome, RunStepRunner};
pub use template::substitute;
pub use workspace::Workspace;
