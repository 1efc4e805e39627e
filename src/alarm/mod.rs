//! Alarm module: threshold rules, the dedup ledger and notification sinks.

mod ledger;
mod rules;
mod sink;

pub use ledger::*;
pub use rules::*;
pub use sink::*;
