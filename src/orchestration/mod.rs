//! Orchestration layer: everything between a loaded backlog and a finished
//! run. Routing, worker slots, worktrees, gates, judges, retries and the
//! planner each live in their own module; [`Factory`] wires them together.

pub mod gates;
pub mod judges;
pub mod planner;
pub mod pool;
pub mod provider;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod workspace;

pub use gates::{GateConfig, GateKind, GateMode, GateReport, GateRunner};
pub use judges::{AggregatedJudgeResult, JudgeContext, JudgeMode, JudgePanel, JudgeResult};
pub use planner::{DynamicPlanner, PlanDirective, TaskDiff};
pub use pool::{SlotHandle, SlotPool};
pub use provider::{CommandProvider, Invocation, Provider, ProviderConfig, ProviderKind, ProviderOutput};
pub use retry::{AttemptFailure, Decision, FailureTracker, RetryPolicy};
pub use router::ComplexityRouter;
pub use scheduler::{Factory, FactoryEvent, FactoryReport, TaskReport};
pub use workspace::{CleanupReport, Workspace, WorkspaceManager};
