//! Pod watch loop
//!
//! Streams Pod events from the API server and fans them out to the
//! registered [`Watcher`](crate::Watcher)s, reconnecting from the last
//! observed resource version whenever the stream drops.

mod backoff;
mod dispatcher;

pub use backoff::{calculate_backoff, Backoff};
pub use dispatcher::{dispatch_event, PodWatch, WatchTarget};
