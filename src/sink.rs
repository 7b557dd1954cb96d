//! Event Sink (§4.9): the terminal progress view.
//!
//! [`NoopSink`] lives in [`crate::scheduler`] next to the `Event` type it
//! discards. [`LineSink`] is the default CLI renderer; a rich interactive
//! dashboard is out of scope (§1).

use std::io::Write;
use std::sync::Mutex;

use crate::scheduler::{Event, EventSink};

/// How [`LineSink`] renders events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Display {
    /// One line per task transition.
    #[default]
    Detailed,
    /// A single status line, rewritten in place.
    Compact,
}

/// Renders scheduler/orchestrator events to a writer, one line at a time
/// in `detailed` mode, or as a single rewritten status line in `compact`
/// mode.
pub struct LineSink<W> {
    writer: Mutex<W>,
    display: Display,
}

impl<W: Write> LineSink<W> {
    #[must_use]
    pub fn new(writer: W, display: Display) -> Self {
        Self { writer: Mutex::new(writer), display }
    }

    fn write_line(&self, line: &str) {
        let Ok(mut w) = self.writer.lock() else { return };
        match self.display {
            Display::Detailed => {
                let _ = writeln!(w, "{line}");
            }
            Display::Compact => {
                let _ = write!(w, "\r\x1b[2K{line}");
                let _ = w.flush();
            }
        }
    }
}

impl<W: Write + Send> EventSink for LineSink<W> {
    fn on_event(&self, event: &Event) {
        let line = match event {
            Event::TaskStarted { item_id } => format!("[{item_id}] started"),
            Event::TaskCompleted { item_id, commits, .. } => {
                format!("[{item_id}] completed ({} commit(s))", commits.len())
            }
            Event::TaskFailed { item_id, error } => format!("[{item_id}] failed: {error}"),
            Event::TasksUnblocked { item_ids } => {
                let ids: Vec<String> = item_ids.iter().map(ToString::to_string).collect();
                format!("unblocked: [{}]", ids.join(", "))
            }
            Event::RunAborted => "run aborted".to_owned(),
        };
        self.write_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ItemId;

    #[test]
    fn detailed_mode_writes_one_line_per_event() {
        let sink = LineSink::new(Vec::new(), Display::Detailed);
        sink.on_event(&Event::TaskStarted { item_id: ItemId::new(1).unwrap() });
        sink.on_event(&Event::TaskCompleted {
            item_id: ItemId::new(1).unwrap(),
            commits: vec!["abc".to_owned()],
            summary: None,
        });
        let buf = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("started"));
        assert!(text.contains("completed"));
    }

    #[test]
    fn compact_mode_rewrites_in_place() {
        let sink = LineSink::new(Vec::new(), Display::Compact);
        sink.on_event(&Event::TaskStarted { item_id: ItemId::new(1).unwrap() });
        sink.on_event(&Event::TaskFailed { item_id: ItemId::new(2).unwrap(), error: "boom".to_owned() });
        let buf = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("failed: boom"));
        assert_eq!(text.matches('\r').count(), 2);
    }
}
