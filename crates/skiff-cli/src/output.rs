//! Machine-readable output for the binary.

use serde::Serialize;
use skiff_core::{Event, EventSink};
use std::io::Write;

#[derive(Serialize)]
struct EventLine<'a> {
    channel: &'a str,
    payload: serde_json::Value,
}

/// Render one event as a single JSON line.
pub fn event_line(event: &Event) -> String {
    let line = EventLine {
        channel: event.channel(),
        payload: event.payload(),
    };
    serde_json::to_string(&line).unwrap_or_default()
}

/// Writes every event to stdout as JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn emit(&self, event: &Event) {
        let mut stdout = std::io::stdout().lock();
        // a closed stdout must not take the executor down
        let _ = writeln!(stdout, "{}", event_line(event));
    }
}
