//! Stage graph for workflow scheduling.
//!
//! ## Architecture
//!
//! 1. **Stage** - Static stage definitions (id, role, scope, prerequisites)
//! 2. **Builder** - Constructs an arena-indexed DAG and rejects cycles
//! 3. **Scheduler** - Stage state machine and ready-set computation
//! 4. **State** - Workflow-level status and outcome
//!
//! ## Example
//!
//! ```
//! use anvil::dag::{DagBuilder, DagScheduler, StageDef, StageRole, StageStatus};
//!
//! let graph = DagBuilder::new(vec![
//!     StageDef::new("setup", StageRole::Setup, "main"),
//!     StageDef::new("implement", StageRole::Implement, "main").after(&["setup"]),
//!     StageDef::new("validate", StageRole::Validate, "main").after(&["implement"]),
//! ])
//! .build()
//! .unwrap();
//!
//! let scheduler = DagScheduler::new(&graph, true);
//! let ready = scheduler.ready_stages("main", |_| StageStatus::NotStarted);
//! assert_eq!(ready, vec![0]);
//! ```

mod builder;
mod scheduler;
mod stage;
mod state;

pub use builder::{DagBuilder, StageGraph, StageIndex};
pub use scheduler::{DagScheduler, StageStatus};
pub use stage::{StageDef, StageRole};
pub use state::{Outcome, WorkflowStatus};
