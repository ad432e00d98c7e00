//! Capacity-controlled scheduling: queue, plan, dispatch tick, state.

pub mod dispatch;
pub mod plan;
pub mod queue;
pub mod state;

pub use dispatch::{
    dispatch_scheduled_work, TickBlocked, TickOptions, TickOutcome, TickSource,
    MAX_DISPATCH_FAILURES,
};
pub use plan::{plan_dispatch, DispatchPlan, PlanReason};
pub use queue::{schedule_bead, EnqueueOptions};
pub use state::{update_state, SchedulerState};
