//! Mirrors this workspace's INFO-and-above log lines onto the bus log topic.

use std::fmt::{self, Write as _};

use tokio::sync::mpsc;
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, Layer};

use crate::mqtt::Telemetry;

const TARGET_PREFIX: &str = "doser";
const TRUNCATED_SUFFIX: &str = "...[truncated]";
pub const QUEUE_DEPTH: usize = 64;

/// Queues formatted lines without ever blocking the logging thread; a full
/// queue drops the line.
pub struct RemoteLogLayer {
    tx: mpsc::Sender<String>,
}

impl RemoteLogLayer {
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        (Self { tx }, rx)
    }
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::INFO || !meta.target().starts_with(TARGET_PREFIX) {
            return;
        }
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let _ = self.tx.try_send(format!("[{}] {}", meta.level(), visitor.line));
    }
}

#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.line.push_str(value);
        } else {
            let _ = write!(self.line, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?}");
        } else {
            let _ = write!(self.line, " {}={value:?}", field.name());
        }
    }
}

/// Caps `line` at `max_len` bytes, cutting on a char boundary and marking the cut.
pub fn truncate_line(line: &str, max_len: usize) -> String {
    if line.len() <= max_len {
        return line.to_string();
    }
    let mut cut = max_len.saturating_sub(TRUNCATED_SUFFIX.len());
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATED_SUFFIX}", &line[..cut])
}

pub fn spawn_forwarder(mut rx: mpsc::Receiver<String>, telemetry: Telemetry, max_len: usize) {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            telemetry.publish_log(&truncate_line(&line, max_len));
        }
    });
}
