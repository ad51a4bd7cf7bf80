//! Alarm evaluation plumbing and state machines.
//!
//! [`processor`] selects and runs the rules for a UVE, [`state_machine`]
//! holds the per-alarm FSM and the shared timer index, and [`table`] ties
//! them into the per-process alarm table the aggregation loop drives.

pub mod processor;
pub mod state_machine;
pub mod table;

pub use processor::{process_alarms, token, AlarmRule, ConfiguredRule, ProcessedAlarm, RuleRegistry};
pub use state_machine::{
    AlarmId, AlarmState, AlarmStateMachine, SoakParams, TimerError, TimerIndex,
};
pub use table::{AckOutcome, AlarmSnapshot, AlarmTable};
