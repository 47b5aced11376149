pub mod catalogue;
pub mod cmd;
pub mod config;
pub mod db;
mod error;
pub mod executor;
pub mod governor;
pub mod history;
pub mod job;
pub mod livestream;
pub mod logging;
pub mod manager;
pub mod operation;
pub mod paths;
pub mod persist;
pub mod pool;
pub mod postprocess;
pub mod process;
pub mod profile;

pub use error::{EngineError, Result};
pub use manager::{ManagerBuilder, OperationManager};
pub use operation::{OperationHandle, OperationKind, OperationSummary, TargetSet};
