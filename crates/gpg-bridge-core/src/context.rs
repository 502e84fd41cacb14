//! Process-wide state shared by every connection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::events::{BridgeEvent, EventSink, LogLevel, TracingEventSink};
use crate::gpg::Gpg;
use crate::session::Passcode;

/// Everything a command handler needs besides the per-connection session.
///
/// Built once at startup and shared behind an `Arc`. Nothing in here changes
/// after construction.
pub struct BridgeContext {
    passcode: Passcode,
    gpg: Gpg,
    temp_dir: PathBuf,
    events: Arc<dyn EventSink>,
    app_name: String,
    app_version: String,
}

impl fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeContext")
            .field("temp_dir", &self.temp_dir)
            .field("app_name", &self.app_name)
            .field("app_version", &self.app_version)
            .finish_non_exhaustive()
    }
}

impl BridgeContext {
    /// Start building a context from its required parts.
    pub fn builder(
        passcode: Passcode,
        gpg: Gpg,
        temp_dir: impl Into<PathBuf>,
    ) -> BridgeContextBuilder {
        BridgeContextBuilder {
            passcode,
            gpg,
            temp_dir: temp_dir.into(),
            events: None,
            app_name: crate::APP_NAME.to_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// The passcode every session must present.
    pub fn passcode(&self) -> &Passcode {
        &self.passcode
    }

    pub fn gpg(&self) -> &Gpg {
        &self.gpg
    }

    /// Directory that holds per-request temp files.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn emit(&self, event: BridgeEvent) {
        self.events.emit(event);
    }

    /// Shorthand for a [`BridgeEvent::Log`] line.
    pub fn log(&self, level: LogLevel, line: impl Into<String>) {
        self.emit(BridgeEvent::Log {
            level,
            line: line.into(),
        });
    }
}

/// Builder for [`BridgeContext`].
pub struct BridgeContextBuilder {
    passcode: Passcode,
    gpg: Gpg,
    temp_dir: PathBuf,
    events: Option<Arc<dyn EventSink>>,
    app_name: String,
    app_version: String,
}

impl BridgeContextBuilder {
    /// Set the event sink. Defaults to [`TracingEventSink`].
    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Override the name and version reported by `version`.
    pub fn product(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.app_name = name.into();
        self.app_version = version.into();
        self
    }

    pub fn build(self) -> BridgeContext {
        BridgeContext {
            passcode: self.passcode,
            gpg: self.gpg,
            temp_dir: self.temp_dir,
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            app_name: self.app_name,
            app_version: self.app_version,
        }
    }
}
