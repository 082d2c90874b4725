//! Execution Timeline
//!
//! Tracks job instance lifecycle events for duration reporting.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Kind of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Instance handed to a worker
    Dispatched,
    /// Instance reached a terminal state (status name attached)
    Finished(&'static str),
}

/// One recorded event.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Instance label
    pub instance: String,
    /// What happened
    pub kind: EventKind,
    /// When it happened
    pub timestamp: Instant,
}

/// Records instance lifecycle events over one run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for an instance.
    pub fn record(&mut self, instance: impl Into<String>, kind: EventKind) {
        self.events.push(TimelineEvent {
            instance: instance.into(),
            kind,
            timestamp: Instant::now(),
        });
    }

    /// All recorded events, in order.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Wall-clock duration of one instance, dispatch to finish.
    pub fn duration_of(&self, instance: &str) -> Option<Duration> {
        let dispatched = self
            .events
            .iter()
            .find(|e| e.instance == instance && e.kind == EventKind::Dispatched)?;
        let finished = self
            .events
            .iter()
            .find(|e| e.instance == instance && matches!(e.kind, EventKind::Finished(_)))?;
        Some(finished.timestamp.duration_since(dispatched.timestamp))
    }

    /// Total elapsed time since the timeline started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// One line per finished instance with its duration and status.
    pub fn summary(&self) -> String {
        let mut durations: HashMap<&str, Instant> = HashMap::new();
        let mut lines = Vec::new();

        for event in &self.events {
            match event.kind {
                EventKind::Dispatched => {
                    durations.insert(&event.instance, event.timestamp);
                }
                EventKind::Finished(status) => {
                    let line = match durations.get(event.instance.as_str()) {
                        Some(&start) => format!(
                            "  {} - {} ({:.2?})",
                            event.instance,
                            status,
                            event.timestamp.duration_since(start)
                        ),
                        None => format!("  {} - {}", event.instance, status),
                    };
                    lines.push(line);
                }
            }
        }

        if lines.is_empty() {
            return "No instances finished".to_string();
        }
        lines.join("\n")
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_record_and_events() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("build", EventKind::Dispatched);
        timeline.record("build", EventKind::Finished("success"));

        assert_eq!(timeline.events().len(), 2);
        assert_eq!(timeline.events()[0].instance, "build");
    }

    #[test]
    fn test_duration_of() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("build", EventKind::Dispatched);
        thread::sleep(Duration::from_millis(10));
        timeline.record("build", EventKind::Finished("success"));

        let duration = timeline.duration_of("build").unwrap();
        assert!(duration >= Duration::from_millis(10));
    }

    #[test]
    fn test_duration_of_unfinished_is_none() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("build", EventKind::Dispatched);
        assert!(timeline.duration_of("build").is_none());
    }

    #[test]
    fn test_summary_lists_finished_instances() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("a", EventKind::Dispatched);
        timeline.record("a", EventKind::Finished("success"));
        timeline.record("b", EventKind::Finished("cancelled"));

        let summary = timeline.summary();
        assert!(summary.contains("a - success"));
        assert!(summary.contains("b - cancelled"));
    }

    #[test]
    fn test_summary_empty() {
        let timeline = ExecutionTimeline::new();
        assert_eq!(timeline.summary(), "No instances finished");
    }
}
