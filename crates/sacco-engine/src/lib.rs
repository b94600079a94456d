pub mod allocation;
pub mod consensus;
pub mod workflow;

pub use allocation::{AllocationEngine, AllocationOutcome, AllocationSummary};
pub use consensus::{ConsensusActionService, VerifyOutcome};
pub use workflow::{LoanRoute, StepOutcome, StepProgress, WorkflowEngine, WorkflowProgress};
