//! Operator-facing notifications.
//!
//! The bridge reports a handful of lifecycle events (server up/down, token
//! touch needed/finished, log lines) to whatever surface the operator is
//! looking at. Delivery is one-directional and fire-and-forget: sinks must
//! not block and never report failure back to the caller.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

/// A notification for the operator's UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// The listener is accepting connections. Carries the passcode so the
    /// operator can type it into the browser.
    ServerUp { port: u16, passcode: String },
    /// The listener has stopped.
    ServerDown,
    /// gpg is about to sign; a hardware token may be waiting for a touch.
    TouchRequired { fingerprint: String },
    /// The signing subprocess has exited.
    TouchCompleted { fingerprint: String, success: bool },
    /// A free-form log line for the UI's log pane.
    Log { level: LogLevel, line: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// Receives [`BridgeEvent`]s. Implementations must not block the caller.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn emit(&self, event: BridgeEvent);
}

// ---------------------------------------------------------------------------
// Tracing sink
// ---------------------------------------------------------------------------

/// Writes events to the tracing log. This is how the passcode reaches an
/// operator running the daemon from a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::ServerUp { port, passcode } => {
                info!("bridge listening on https://localhost:{port}");
                info!("passcode: {passcode}");
            }
            BridgeEvent::ServerDown => info!("bridge stopped"),
            BridgeEvent::TouchRequired { fingerprint } => {
                info!(fingerprint = %fingerprint, "signing started, touch your token if it blinks");
            }
            BridgeEvent::TouchCompleted {
                fingerprint,
                success,
            } => {
                info!(fingerprint = %fingerprint, success, "signing finished");
            }
            BridgeEvent::Log { level, line } => match level {
                LogLevel::Info => info!("{line}"),
                LogLevel::Error => warn!("{line}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// JSON lines sink
// ---------------------------------------------------------------------------

/// Writes one JSON object per event to a writer (stdout for a parent UI
/// process). Write errors are ignored.
pub struct JsonLinesEventSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesEventSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl JsonLinesEventSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W> fmt::Debug for JsonLinesEventSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesEventSink").finish()
    }
}

impl<W: Write + Send> EventSink for JsonLinesEventSink<W> {
    fn emit(&self, event: BridgeEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Forwards every event to each inner sink.
#[derive(Debug, Default)]
pub struct MultiEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for MultiEventSink {
    fn emit(&self, event: BridgeEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory sink (for testing)
// ---------------------------------------------------------------------------

/// Stores events in a `Vec` behind a mutex.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<BridgeEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: BridgeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
