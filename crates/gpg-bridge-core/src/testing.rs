//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::context::BridgeContext;
use crate::events::InMemoryEventSink;
use crate::gpg::Gpg;
use crate::locator::GpgLocator;
use crate::runner::{CommandRunner, ProcessOutput, RunFuture, SpawnError};
use crate::session::Passcode;

#[derive(Debug, Clone)]
enum Scripted {
    Exit(ProcessOutput),
    SpawnError,
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Contents of the last argument if it named a readable file at call time.
    pub file_contents: Option<Vec<u8>>,
    pub file_path: Option<PathBuf>,
}

/// A [`CommandRunner`] that records calls and replays canned results.
///
/// Rules registered with [`respond_to`](Self::respond_to) match when any
/// argument equals the rule's key and are reused; otherwise the queue is
/// consumed in order; with both empty the call exits zero with no output.
#[derive(Debug, Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<(String, Scripted)>>,
    queue: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<Call>>,
}

fn exit(code: i32, stdout: &str, stderr: &str) -> Scripted {
    Scripted::Exit(ProcessOutput {
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
        exit_code: Some(code),
    })
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exit(&self, code: i32, stdout: &str, stderr: &str) {
        self.queue.lock().unwrap().push_back(exit(code, stdout, stderr));
    }

    pub fn push_spawn_error(&self) {
        self.queue.lock().unwrap().push_back(Scripted::SpawnError);
    }

    pub fn respond_to(&self, arg: &str, code: i32, stdout: &str, stderr: &str) {
        self.rules
            .lock()
            .unwrap()
            .push((arg.to_owned(), exit(code, stdout, stderr)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, args: &[OsString]) -> Scripted {
        let rules = self.rules.lock().unwrap();
        if let Some((_, scripted)) = rules
            .iter()
            .find(|(key, _)| args.iter().any(|a| a.to_string_lossy() == key.as_str()))
        {
            return scripted.clone();
        }
        drop(rules);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| exit(0, "", ""))
    }
}

impl CommandRunner for FakeRunner {
    fn run<'a>(&'a self, program: &'a Path, args: &'a [OsString]) -> RunFuture<'a> {
        let file_path = args.last().map(PathBuf::from).filter(|p| p.is_file());
        let file_contents = file_path.as_ref().and_then(|p| std::fs::read(p).ok());
        self.calls.lock().unwrap().push(Call {
            program: program.to_path_buf(),
            args: args.to_vec(),
            file_contents,
            file_path,
        });

        let scripted = self.next(args);
        Box::pin(async move {
            match scripted {
                Scripted::Exit(out) => Ok(out),
                Scripted::SpawnError => Err(SpawnError {
                    program: program.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                }),
            }
        })
    }
}

/// A context wired to fakes, with passcode `123456`.
pub struct TestBridge {
    pub ctx: Arc<BridgeContext>,
    pub runner: Arc<FakeRunner>,
    pub events: Arc<InMemoryEventSink>,
    pub temp: tempfile::TempDir,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_locator(GpgLocator::pinned("/usr/bin/gpg"))
    }

    pub fn without_gpg() -> Self {
        Self::with_locator(GpgLocator::with_candidates(vec![]))
    }

    fn with_locator(locator: GpgLocator) -> Self {
        let runner = Arc::new(FakeRunner::new());
        let events = Arc::new(InMemoryEventSink::new());
        let temp = tempfile::tempdir().unwrap();
        let gpg = Gpg::new(Arc::new(locator), runner.clone());
        let ctx = BridgeContext::builder(Passcode::from("123456"), gpg, temp.path())
            .events(events.clone())
            .product("gpg-bridge", "0.3.0")
            .build();
        Self {
            ctx: Arc::new(ctx),
            runner,
            events,
            temp,
        }
    }

    /// Files currently left in the temp directory.
    pub fn leftover_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.temp.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }
}
