//! Durable session state for Parlor.
//!
//! Two stores, each owning its own file layout under the data dir:
//! the [`EventStore`] (per-session append-only JSONL event logs with live
//! subscriptions) and the [`SessionIndex`] (a catalog of session summaries
//! replayed from a change-log JSONL).

pub mod attributes;
pub mod events;
pub mod index;

pub use events::{EventStore, EventSubscription};
pub use index::{CreateSession, SessionIndex, SessionSummary};
