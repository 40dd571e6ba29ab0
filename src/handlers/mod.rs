//! Ready-made handlers
//!
//! Small, self-contained handlers that double as usage examples and are
//! wired into the `eirinix` binary through command-line flags.

mod event_log;
mod pod_annotator;
mod sticky_env;

pub use event_log::EventLogWatcher;
pub use pod_annotator::PodAnnotationReconciler;
pub use sticky_env::{StickyEnvExtension, STICKY_MESSAGE_ENV};
