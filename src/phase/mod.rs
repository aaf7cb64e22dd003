//! Phase model, persistence, and optimistic-locked state mutation.
//!
//! A phase is one queued unit of autonomous work with its own
//! retry/escalation counters and a declared file scope. The `phases` table
//! is the unit of mutual exclusion for state mutation: every write is
//! conditioned on the version read at the start of the transaction, and the
//! version grows by exactly one per successful mutation, imposing a total
//! order on a row's history even when callers race.

pub mod manager;
pub mod model;
pub mod store;

pub use manager::PhaseStateManager;
pub use model::{Phase, PhaseState, StateUpdateRequest};
pub use store::{PhaseStore, StateError};
