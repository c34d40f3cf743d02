//! Replay session manager – one per replayer connection.
//!
//! A replay sends the recorded initial state straight away, then one queued
//! event per fixed tick, then a `{done: true}` marker.  Original inter-event
//! timing is not kept, only the order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use rewind_common::images;
use rewind_common::naming;
use rewind_common::protocol::{done_marker, ReplayInit, ReplayerCommand};

use crate::sessions::Sessions;
use crate::store::Store;

/// Shortest tick period; `interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Delivers queued events one per tick.
///
/// Dropping it cancels every delivery that has not been handed out yet.
pub struct Scheduler {
    queue: VecDeque<Value>,
    ticker: Interval,
    /// The done marker takes a tick of its own unless nothing was queued.
    done_on_tick: bool,
    finished: bool,
}

impl Scheduler {
    pub fn new(queue: Vec<Value>, period: Duration) -> Self {
        let period = period.max(MIN_PERIOD);
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Scheduler {
            done_on_tick: !queue.is_empty(),
            queue: queue.into(),
            ticker,
            finished: false,
        }
    }

    /// Wait for the next delivery.  Yields every queued event, one tick
    /// apart, then the done marker one tick later (immediately if the queue
    /// was empty), then `None`.
    ///
    /// Cancel safe: nothing is dequeued or marked finished before its tick
    /// has fired.
    pub async fn next(&mut self) -> Option<Value> {
        if self.finished {
            return None;
        }
        if self.queue.is_empty() {
            if self.done_on_tick {
                self.ticker.tick().await;
            }
            self.finished = true;
            return Some(done_marker());
        }
        self.ticker.tick().await;
        self.queue.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

enum State {
    Idle,
    Replaying {
        name: String,
        raw_session: bool,
        scheduler: Scheduler,
    },
}

pub struct ReplaySession {
    sessions: Arc<Sessions>,
    store: Store,
    interval: Duration,
    state: State,
}

impl ReplaySession {
    pub fn new(sessions: Arc<Sessions>, store: Store, interval: Duration) -> Self {
        ReplaySession {
            sessions,
            store,
            interval,
            state: State::Idle,
        }
    }

    pub fn is_replaying(&self) -> bool {
        matches!(self.state, State::Replaying { .. })
    }

    /// Handle one text frame; returns the messages to send right away.
    pub async fn handle(&mut self, text: &str) -> Result<Vec<Value>> {
        match ReplayerCommand::parse(text)? {
            ReplayerCommand::Start { name, raw_session } => {
                let Some(name) = name else {
                    debug!("Start replaying without a name ignored");
                    return Ok(vec![]);
                };
                self.start(&name, raw_session).await
            }
            ReplayerCommand::Stop => {
                self.stop();
                Ok(vec![])
            }
            ReplayerCommand::Unknown => Ok(vec![]),
        }
    }

    /// Load the recording `name` and begin replaying it.  Unknown names
    /// and out-of-state calls do nothing.
    pub async fn start(&mut self, name: &str, raw_session: bool) -> Result<Vec<Value>> {
        if let State::Replaying { name: current, .. } = &self.state {
            warn!("Start replaying ignored – already replaying {current}");
            return Ok(vec![]);
        }

        let name = naming::slugify(name);
        if name.is_empty() || !self.store.exists(&name).await {
            info!("No recording named {name:?} – nothing to replay");
            return Ok(vec![]);
        }

        let mut recording = self.store.load(&name).await?;
        images::inline(&mut recording);

        let queue = recording.replay_queue(raw_session).to_vec();
        let events = queue.len();
        let scheduler = Scheduler::new(queue, self.interval);

        if raw_session && !self.sessions.begin_replay(recording.xhr_responses.clone()) {
            warn!("Start replaying {name} ignored – API traffic is already being recorded or replayed");
            return Ok(vec![]);
        }

        let init = ReplayInit {
            initial_state: std::mem::take(&mut recording.initial_state),
            impurities: std::mem::take(&mut recording.impurities),
        };

        info!("Started replaying {name} ({events} events)");
        self.state = State::Replaying {
            name,
            raw_session,
            scheduler,
        };
        Ok(vec![serde_json::to_value(init)?])
    }

    /// Stop replaying.  Nothing queued is delivered after this returns.
    pub fn stop(&mut self) {
        let State::Replaying {
            name,
            raw_session,
            scheduler,
        } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return;
        };
        if raw_session {
            self.sessions.end_replay();
        }
        info!(
            "Stopped replaying {name} ({} events undelivered)",
            scheduler.remaining()
        );
    }

    /// Next scheduled event for the client; `None` when idle or finished.
    pub async fn next_event(&mut self) -> Option<Value> {
        match &mut self.state {
            State::Replaying { scheduler, .. } => scheduler.next().await,
            State::Idle => None,
        }
    }
}

impl Drop for ReplaySession {
    fn drop(&mut self) {
        self.stop();
    }
}
