pub mod capture;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod loader;
pub mod schedule;
pub mod traits;
pub mod types;
pub mod workflow;

pub use capture::{Capture, CaptureStrategy};
pub use condition::Condition;
pub use config::{PipelinerConfig, ResolvedPaths};
pub use error::{PipelinerError, Result};
pub use event::EventBus;
pub use loader::load_workflow;
pub use schedule::*;
pub use types::*;
pub use workflow::*;
