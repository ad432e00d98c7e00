//! Convoy planning: DAG collection, wave partitioning, staging, launch.

pub mod dag;
pub mod stage;
pub mod waves;

pub use dag::{collect, CollectError, ConvoyDag, DagReport, Node};
pub use stage::{
    advance_convoys, dispatch_wave, launch, stage, validate_transition, LaunchOutcome,
    StageOutcome, TransitionError, WaveReport, CONCURRENT_STARTS,
};
pub use waves::{compute_waves, CycleError};
