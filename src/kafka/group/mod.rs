//! Consumer group coordination
//!
//! [`ConsumerGroupCoordinator`] joins a group, runs one claim handler per
//! assigned partition and fans every claimed record into a single bounded
//! output channel that survives rebalances.
//!
//! ```text
//! membership task ──join──> Generation ──> claim handler (t,0) ─┐
//!        ^                              └─> claim handler (t,1) ─┼─> output channel ─> caller
//!        └──── revoked: stop handlers, commit, rejoin ───────────┘
//! ```

mod coordinator;
mod handler;

pub use coordinator::{ConsumerGroupCoordinator, CoordinatorState};

#[cfg(test)]
mod tests;
