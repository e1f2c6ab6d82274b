//! Subprocess execution with domain-scoped timeouts
//!
//! - `TimeoutPolicyRegistry`: per-domain defaults, overrides and backoff
//! - `TimeoutHistory`: shared duration samples that tune later timeouts
//! - `CommandRunner`: runs `sh -c` with warnings, retries and group termination

pub mod command_runner;
pub mod timeout_history;
pub mod timeout_policy;

pub use command_runner::{
    CommandAttemptResult, CommandEvent, CommandEventType, CommandExecution, CommandRequest, CommandResult,
    CommandRunner, EventSink, TIMEOUT_EXIT_CODE,
};
pub use timeout_history::{MAX_SAMPLES_PER_KEY, TimeoutHistory, TimeoutStatsSnapshot, build_command_key};
pub use timeout_policy::{
    BackoffPolicy, SignalPolicy, TimeoutContext, TimeoutDomain, TimeoutOverride, TimeoutPolicy, TimeoutPolicyRegistry,
};
