//! Voluntary disruption.
//!
//! A pass refreshes claim conditions, selects candidates, plans commands
//! within each pool's budget and hands them to the [`Orchestrator`]. Planning
//! is pure; everything with side effects lives in the orchestrator.

pub mod budgets;
pub mod candidate;
pub mod methods;
pub mod orchestration;

pub use budgets::BudgetTracker;
pub use candidate::{BlockReason, Blocked, Candidate, candidates, mark_conditions};
pub use methods::{
    Command, CommandId, CommandTarget, Deferred, DisruptionPlan, Planner, Rejected,
};
pub use orchestration::{CommandPhase, Orchestrator};
