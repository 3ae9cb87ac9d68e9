//! Run Timeline
//!
//! Records when each call was queued, started and finished, for the
//! end-of-run summary and a text Gantt chart.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Submitted, waiting for admission
    Queued,
    /// Admitted; container about to be created
    Started,
    /// Outputs reused from the call cache
    CacheHit,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Interrupted or never started because the run was halted
    Cancelled,
}

impl EventType {
    pub fn is_final(self) -> bool {
        matches!(self, Self::CacheHit | Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::CacheHit => "cache hit",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A single event in the run timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Run identifier of the call (e.g. `call-align-0-sampleA`)
    pub call: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Counts of final call outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineSummary {
    pub completed: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TimelineSummary {
    pub fn total(&self) -> usize {
        self.completed + self.cache_hits + self.failed + self.cancelled
    }
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a call.
    pub fn add_event(&mut self, call: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            call: call.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Total elapsed time since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Counts each call's last final event.
    pub fn summary(&self) -> TimelineSummary {
        let mut last: HashMap<&str, EventType> = HashMap::new();
        for event in self.events.iter().filter(|e| e.event_type.is_final()) {
            last.insert(&event.call, event.event_type);
        }

        let mut summary = TimelineSummary::default();
        for event_type in last.values() {
            match event_type {
                EventType::Completed => summary.completed += 1,
                EventType::CacheHit => summary.cache_hits += 1,
                EventType::Failed => summary.failed += 1,
                EventType::Cancelled => summary.cancelled += 1,
                EventType::Queued | EventType::Started => {}
            }
        }
        summary
    }

    /// Running time per call, from `Started` to its final event.
    pub fn get_durations(&self) -> BTreeMap<String, Duration> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = BTreeMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.call, event.timestamp);
                }
                EventType::Queued => {}
                _ => {
                    if let Some(start) = starts.get(event.call.as_str()) {
                        durations.insert(event.call.clone(), event.timestamp.duration_since(*start));
                    }
                }
            }
        }
        durations
    }

    /// Time each call spent waiting between `Queued` and `Started`.
    pub fn get_wait_times(&self) -> BTreeMap<String, Duration> {
        let mut queued: HashMap<&str, Instant> = HashMap::new();
        let mut waits = BTreeMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Queued => {
                    queued.insert(&event.call, event.timestamp);
                }
                EventType::Started => {
                    if let Some(at) = queued.get(event.call.as_str()) {
                        waits.insert(event.call.clone(), event.timestamp.duration_since(*at));
                    }
                }
                _ => {}
            }
        }
        waits
    }

    /// Generates an ASCII Gantt chart of call running times.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut spans: Vec<(String, u128, u128)> = Vec::new();
        let mut starts: HashMap<&str, u128> = HashMap::new();
        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.call, elapsed);
                }
                EventType::Queued => {}
                _ => {
                    if let Some(start) = starts.remove(event.call.as_str()) {
                        spans.push((event.call.clone(), start, elapsed));
                    }
                }
            }
        }
        spans.sort_by_key(|(_, start, _)| *start);

        for (call, start, end) in spans {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:20} |{}| ({} ms)\n",
                truncate(&call, 20),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::default();
        assert!(timeline.get_events().is_empty());
        assert_eq!(timeline.summary(), TimelineSummary::default());
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("call-a", EventType::Queued);
        timeline.add_event("call-a", EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("call-a", EventType::Completed);
        timeline.add_event("call-b", EventType::Started);

        let durations = timeline.get_durations();
        assert!(durations["call-a"] >= Duration::from_millis(50));
        // never finished
        assert!(!durations.contains_key("call-b"));
    }

    #[test]
    fn test_wait_times() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("call-a", EventType::Queued);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("call-a", EventType::Started);

        assert!(timeline.get_wait_times()["call-a"] >= Duration::from_millis(20));
    }

    #[test]
    fn test_summary_counts_final_events() {
        let mut timeline = ExecutionTimeline::new();
        for (call, event) in [
            ("a", EventType::Completed),
            ("b", EventType::CacheHit),
            ("c", EventType::Failed),
            ("d", EventType::Cancelled),
            ("e", EventType::Started),
        ] {
            timeline.add_event(call, event);
        }

        let summary = timeline.summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("call-first", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("call-first", EventType::Completed);
        timeline.add_event("call-second-with-a-very-long-name", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("call-second-with-a-very-long-name", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("call-first"));
        assert!(chart.contains("call-second-with-..."));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::CacheHit.to_string(), "cache hit");
        assert!(EventType::Cancelled.is_final());
        assert!(!EventType::Queued.is_final());
    }
}
