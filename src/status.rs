//! Ordered progress reporting.
//!
//! A session publishes one [`StatusEvent`] per stage it enters, synchronously
//! and in order, to a caller supplied [`StatusSink`]. Stages carry a stable
//! machine readable key; turning them into prose is the UI's job.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;

// =============================================================================
// Public Interface
// =============================================================================

/// The stages a session reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    OpeningPort,
    HandshakingBootloader,
    LoadingStub,
    ReconnectingStub,
    GettingSecurityInfo,
}

impl Stage {
    /// Stable key for localisation.
    pub fn key(self) -> &'static str {
        match self {
            Stage::OpeningPort => "opening_port",
            Stage::HandshakingBootloader => "handshaking_bootloader",
            Stage::LoadingStub => "loading_stub",
            Stage::ReconnectingStub => "reconnecting_stub",
            Stage::GettingSecurityInfo => "getting_security_info",
        }
    }

    /// Overall handshake completion when the stage starts.
    pub fn percent(self) -> u8 {
        match self {
            Stage::OpeningPort => 0,
            Stage::HandshakingBootloader => 10,
            Stage::LoadingStub => 30,
            Stage::ReconnectingStub => 60,
            Stage::GettingSecurityInfo => 80,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// An immutable record of a stage transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Strictly increasing over the life of a session.
    pub seq: u64,
    pub stage: Stage,
    /// Overall handshake completion, when the event is part of a handshake.
    pub percent: Option<u8>,
}

/// Receives status events. Called synchronously on the session's thread.
pub trait StatusSink {
    fn on_status(&mut self, event: &StatusEvent);

    /// Byte level progress within `stage`, e.g. while uploading the stub.
    fn on_progress(&mut self, _stage: Stage, _done: usize, _total: usize) {}
}

impl<F> StatusSink for F
where
    F: FnMut(&StatusEvent),
{
    fn on_status(&mut self, event: &StatusEvent) {
        self(event)
    }
}

/// A sink keeping every event, shareable with the code that inspects them.
#[derive(Debug, Clone, Default)]
pub struct StatusRecorder {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl StatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events().iter().map(|event| event.stage).collect()
    }
}

impl StatusSink for StatusRecorder {
    fn on_status(&mut self, event: &StatusEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Numbers events and suppresses repeated stages within one attempt.
pub(crate) struct StatusEmitter {
    sink: Option<Box<dyn StatusSink>>,
    next_seq: u64,
    emitted: HashSet<Stage>,
}

impl StatusEmitter {
    pub fn new() -> Self {
        StatusEmitter {
            sink: None,
            next_seq: 0,
            emitted: HashSet::new(),
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn StatusSink>) {
        self.sink = Some(sink);
    }

    /// Start a new attempt: every stage may be reported once more.
    pub fn begin_attempt(&mut self) {
        self.emitted.clear();
    }

    /// Report entering `stage`. Returns `false` when the stage was already
    /// reported in this attempt.
    pub fn emit(&mut self, stage: Stage, percent: Option<u8>) -> bool {
        if !self.emitted.insert(stage) {
            debug!("status {} already reported", stage);
            return false;
        }

        let event = StatusEvent {
            seq: self.next_seq,
            stage,
            percent,
        };
        self.next_seq += 1;
        debug!("status #{} {}", event.seq, stage);
        if let Some(sink) = self.sink.as_mut() {
            sink.on_status(&event);
        }
        true
    }

    pub fn progress(&mut self, stage: Stage, done: usize, total: usize) {
        if let Some(sink) = self.sink.as_mut() {
            sink.on_progress(stage, done, total);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn events_are_numbered_in_order() {
    let recorder = StatusRecorder::new();
    let mut emitter = StatusEmitter::new();
    emitter.set_sink(Box::new(recorder.clone()));

    emitter.emit(Stage::OpeningPort, Some(0));
    emitter.emit(Stage::HandshakingBootloader, Some(10));

    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].seq, 0);
    assert_eq!(events[1].seq, 1);
    assert_eq!(events[1].stage.key(), "handshaking_bootloader");
}

#[test]
fn repeated_stage_is_suppressed_within_attempt() {
    let recorder = StatusRecorder::new();
    let mut emitter = StatusEmitter::new();
    emitter.set_sink(Box::new(recorder.clone()));

    assert!(emitter.emit(Stage::OpeningPort, None));
    assert!(!emitter.emit(Stage::OpeningPort, None));
    emitter.begin_attempt();
    assert!(emitter.emit(Stage::OpeningPort, None));

    let seqs: Vec<u64> = recorder.events().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1]);
}

#[test]
fn closures_are_sinks() {
    let mut keys = vec![];
    {
        let mut sink = |event: &StatusEvent| keys.push(event.stage.key());
        sink.on_status(&StatusEvent {
            seq: 0,
            stage: Stage::ReconnectingStub,
            percent: None,
        });
    }
    assert_eq!(keys, vec!["reconnecting_stub"]);
}
