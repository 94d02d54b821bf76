use std::{
    fmt,
    sync::mpsc::{self, Receiver, Sender},
    time::{Duration, Instant},
};

use crate::supervisor::StageId;

/// One status line of an installation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The supervisor moved into a stage.
    StageStarted { stage: StageId, description: String },
    /// A notable step inside a stage.
    Step { stage: StageId, description: String },
    /// Coarse copy progress during deployment.
    Progress {
        stage: StageId,
        percent: u8,
        files_done: u64,
        files_total: u64,
    },
    Completed,
    Failed { stage: StageId, cause: String },
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Completed | Event::Failed { .. })
    }

    pub fn stage(&self) -> Option<StageId> {
        match self {
            Event::StageStarted { stage, .. }
            | Event::Step { stage, .. }
            | Event::Progress { stage, .. }
            | Event::Failed { stage, .. } => Some(*stage),
            Event::Completed => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::StageStarted { stage, description } | Event::Step { stage, description } => {
                write!(f, "[{}] {}", stage, description)
            }
            Event::Progress {
                stage,
                percent,
                files_done,
                files_total,
            } => {
                write!(f, "[{}] {}% copied", stage, percent)?;
                if *files_total > 0 {
                    write!(f, " ({}/{} files)", files_done, files_total)?;
                }
                Ok(())
            }
            Event::Completed => f.write_str("[done] Installation completed successfully"),
            // Causes from tools can span lines; keep the stream one line per event.
            Event::Failed { stage, cause } => {
                write!(f, "[failed] {}: {}", stage, cause.replace('\n', " | "))
            }
        }
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Creates a connected reporter / stream pair for one run.
pub fn channel() -> (Reporter, ProgressStream) {
    let (tx, rx) = mpsc::channel();
    (Reporter { tx }, ProgressStream { rx })
}

/// Engine side of the status stream. Sending never blocks, and a consumer
/// that went away is simply ignored.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: Sender<Event>,
}

impl Reporter {
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn step(&self, stage: StageId, description: impl Into<String>) {
        self.emit(Event::Step {
            stage,
            description: description.into(),
        });
    }
}

/// Consumer side: yields events in emission order and ends once the run
/// (and every clone of its `Reporter`) is gone.
#[derive(Debug)]
pub struct ProgressStream {
    rx: Receiver<Event>,
}

impl Iterator for ProgressStream {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.rx.recv().ok()
    }
}

// ── Rate limiting ─────────────────────────────────────────────────────────────

/// Lets at most one update through per `interval`.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
