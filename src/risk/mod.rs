//! Risk sizing and portfolio guardrails.
//!
//! Risk per trade means equity lost if the stop is hit, not margin
//! allocated. The kill-switch is sticky: once tripped it blocks new entries
//! until an operator resets it.

mod engine;
mod kill_switch;

pub use engine::{RiskEngine, SizingInputs};
pub use kill_switch::KillSwitch;
