//! Process-wide session state shared by the interceptor and both control
//! channels: the live recording accumulator and the queue of recorded API
//! responses being served back during a replay.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use rewind_common::recording::{EventKind, Recording};

/// What the interceptor does with the current API response.
#[derive(Debug, PartialEq)]
pub enum Traffic {
    PassThrough,
    Record,
    /// Serve this recorded entry; `None` when the queue ran dry.
    Replay(Option<Value>),
}

/// At most one of the two is active at any time.
#[derive(Debug, Default)]
enum Active {
    #[default]
    Idle,
    Recording(Recording),
    /// A raw replay is substituting API responses.
    Replaying(VecDeque<Value>),
}

#[derive(Debug, Default)]
pub struct Sessions {
    active: Mutex<Active>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── recording ────────────────────────────────────────────────────

    /// Enter the recording state.  Refused (returns `false`) while a
    /// recording or an API replay is already active.
    pub fn start_recording(&self, initial_state: Value) -> bool {
        self.resume_recording(Recording::new(initial_state))
    }

    /// Re-enter the recording state with an existing accumulator, e.g. one
    /// whose save failed.  Same refusal rules as [`Self::start_recording`].
    pub fn resume_recording(&self, recording: Recording) -> bool {
        let mut active = self.lock();
        if !matches!(*active, Active::Idle) {
            return false;
        }
        *active = Active::Recording(recording);
        true
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.lock(), Active::Recording(_))
    }

    /// Classify and append an event to the live accumulator.  `None` when
    /// not recording or when the envelope has no recognised shape.
    pub fn ingest(&self, event: Value) -> Option<EventKind> {
        match &mut *self.lock() {
            Active::Recording(recording) => recording.ingest(event),
            _ => None,
        }
    }

    /// Append a captured API response.  Returns `false` if the recording
    /// stopped while the response was in flight.
    pub fn push_xhr_response(&self, response: Value) -> bool {
        match &mut *self.lock() {
            Active::Recording(recording) => {
                recording.xhr_responses.push(response);
                true
            }
            _ => false,
        }
    }

    /// Leave the recording state, handing back the accumulator.
    pub fn take_recording(&self) -> Option<Recording> {
        let mut active = self.lock();
        match std::mem::take(&mut *active) {
            Active::Recording(recording) => Some(recording),
            other => {
                *active = other;
                None
            }
        }
    }

    // ── replaying ────────────────────────────────────────────────────

    /// Start serving `responses` in order to API calls.  Refused while
    /// recording or while another replay owns the queue.
    pub fn begin_replay(&self, responses: Vec<Value>) -> bool {
        let mut active = self.lock();
        if !matches!(*active, Active::Idle) {
            return false;
        }
        *active = Active::Replaying(responses.into());
        true
    }

    pub fn end_replay(&self) {
        let mut active = self.lock();
        if matches!(*active, Active::Replaying(_)) {
            *active = Active::Idle;
        }
    }

    pub fn is_replaying(&self) -> bool {
        matches!(*self.lock(), Active::Replaying(_))
    }

    // ── interceptor ──────────────────────────────────────────────────

    /// Decide how to handle one API response.  In replay mode this
    /// dequeues the next recorded entry.
    pub fn route_response(&self) -> Traffic {
        match &mut *self.lock() {
            Active::Idle => Traffic::PassThrough,
            Active::Recording(_) => Traffic::Record,
            Active::Replaying(queue) => Traffic::Replay(queue.pop_front()),
        }
    }
}
