//! Run Monitoring
//!
//! Observational utilities for a run in flight:
//!
//! - [`ExecutionTimeline`]: instance dispatch/finish timing
//! - [`ResourceMonitor`]: CPU and memory sampling of the engine process
//!
//! Nothing here affects scheduling decisions.

pub mod resource;
pub mod timeline;

pub use resource::{ResourceMonitor, ResourceSample};
pub use timeline::{EventKind, ExecutionTimeline, TimelineEvent};
