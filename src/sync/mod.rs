//! State Reconciliation
//!
//! Converges a reconnecting client with server truth. The client sends the
//! [`ClientReference`] of its mirror; the server answers with a [`SyncPatch`].

pub mod patch;
pub mod reference;

pub use patch::{compute_patch, delayed_feed, PatchState, SyncPatch, MAX_TURN_DIFF};
pub use reference::{compute_reference, ClientReference, Reference, ReferenceError};
