//! Corrective actions and liveness supervision

mod actions;
mod auto_healer;
mod watchdog;

pub use actions::{
    default_policies, Cache, ConnectionPool, HealOutcome, HealingActionKind, HealingHandler,
    HealingPolicy, PolicyKey,
};
pub use auto_healer::{
    AutoHealer, HealReport, HealTarget, HealTrigger, HealerStats, HealingAction, TargetStatus,
};
pub use watchdog::{ProcessWatchdog, WatchdogStatus};
