//! Atomic promotion of work items between state queues.
//!
//! An item lives in exactly one queue, the one named by its current state.
//! [`engine::PromotionEngine`] moves items along the transitions of a
//! [`state_machine::TransitionRegistry`], validating evidence and recording it
//! in the same atomic store call that moves the item.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod harness;
pub mod procedures;
pub mod state_machine;
pub mod store;
