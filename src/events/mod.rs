//! Structured progress notifications for one run.

pub mod event;
pub mod stream;

pub use event::{Activity, EventEnvelope, RunEvent};
pub use stream::{EventStream, EventSubscription};
