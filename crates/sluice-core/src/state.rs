//! Player state machine
//!
//! Discrete playback states driven by buffer sufficiency and explicit
//! commands. Every transition is appended to a history log with the time
//! spent in the state being left, and published on a watch channel.

use crate::error::{Error, Result};
use crate::events::{EventBus, PlayerEvent};
use crate::types::{PlayerState, StateHistoryEntry};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

struct Machine {
    state: PlayerState,
    entered: Instant,
    history: Vec<StateHistoryEntry>,
    time_in_state: HashMap<PlayerState, f64>,
    /// State to return to when playback resumes
    resume: Option<PlayerState>,
}

pub struct PlayerStateMachine {
    machine: Mutex<Machine>,
    tx: watch::Sender<PlayerState>,
    events: Arc<EventBus>,
}

impl PlayerStateMachine {
    /// Starts in `Unset` and moves straight to `Idle`
    pub fn new(events: Arc<EventBus>) -> Self {
        let (tx, _) = watch::channel(PlayerState::Unset);
        let machine = Self {
            machine: Mutex::new(Machine {
                state: PlayerState::Unset,
                entered: Instant::now(),
                history: Vec::new(),
                time_in_state: HashMap::new(),
                resume: None,
            }),
            tx,
            events,
        };
        let _ = machine.transition(PlayerState::Idle, 0.0);
        machine
    }

    pub fn state(&self) -> PlayerState {
        self.machine.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.tx.subscribe()
    }

    pub fn history(&self) -> Vec<StateHistoryEntry> {
        self.machine.lock().history.clone()
    }

    /// Seconds spent per state, the current one included
    pub fn time_in_states(&self) -> HashMap<PlayerState, f64> {
        let machine = self.machine.lock();
        let mut times = machine.time_in_state.clone();
        *times.entry(machine.state).or_default() += machine.entered.elapsed().as_secs_f64();
        times
    }

    /// Seconds spent in the current state so far
    pub fn time_in_current_state(&self) -> f64 {
        self.machine.lock().entered.elapsed().as_secs_f64()
    }

    /// Apply a transition, recording it and notifying observers
    pub fn transition(&self, to: PlayerState, position: f64) -> Result<()> {
        self.transition_with(position, |_| Some(to)).map(|_| ())
    }

    /// Pick and apply a transition under one lock; `choose` sees the current state
    fn transition_with<F>(&self, position: f64, choose: F) -> Result<Option<PlayerState>>
    where
        F: FnOnce(&Machine) -> Option<PlayerState>,
    {
        let (from, to, previous_duration) = {
            let mut machine = self.machine.lock();
            let from = machine.state;
            let Some(to) = choose(&machine) else {
                return Ok(None);
            };
            if !from.can_transition_to(to) {
                return Err(Error::InvalidStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            let now = Instant::now();
            let previous_duration = now.duration_since(machine.entered).as_secs_f64();
            *machine.time_in_state.entry(from).or_default() += previous_duration;
            machine.history.push(StateHistoryEntry {
                state: to,
                timestamp: Utc::now(),
                previous_duration,
            });
            machine.state = to;
            machine.entered = now;
            machine.resume = (to == PlayerState::Paused).then_some(from);
            // Published under the lock so watchers see transitions in order
            self.tx.send_replace(to);
            (from, to, previous_duration)
        };

        info!(from = %from, to = %to, position, "Player state transition");
        if from != PlayerState::Unset {
            self.events.emit(PlayerEvent::StateChanged { from, to });
        }
        if to == PlayerState::Buffering {
            self.events.emit(PlayerEvent::BufferingStarted { position });
        }
        if from == PlayerState::Buffering {
            self.events.emit(PlayerEvent::BufferingEnded {
                position,
                duration: previous_duration,
            });
        }
        Ok(Some(to))
    }

    /// React to the buffer level; returns the state entered, if any
    pub fn on_buffer(
        &self,
        buffered_ahead: f64,
        rebuffering_goal: f64,
        exhausted: bool,
        position: f64,
    ) -> Result<Option<PlayerState>> {
        let enough = exhausted || buffered_ahead >= rebuffering_goal;
        self.transition_with(position, |machine| match machine.state {
            PlayerState::Preparing | PlayerState::Buffering if enough => Some(PlayerState::Playing),
            PlayerState::Playing if !enough => {
                debug!(buffered_ahead, rebuffering_goal, "Buffer underrun");
                Some(PlayerState::Buffering)
            }
            _ => None,
        })
    }

    /// Hold playback until `play`; the running state is kept for the resume
    pub fn pause(&self, position: f64) -> Result<()> {
        self.transition_with(position, |machine| {
            (machine.state != PlayerState::Paused).then_some(PlayerState::Paused)
        })
        .map(|_| ())
    }

    /// Resume the state that was running before the pause
    pub fn play(&self, position: f64) -> Result<()> {
        self.transition_with(position, |machine| match machine.state {
            PlayerState::Paused => Some(machine.resume.unwrap_or(PlayerState::Buffering)),
            _ => None,
        })
        .map(|_| ())
    }

    /// Enter `Ended` from a running state; returns false when playback was paused or stopped meanwhile
    pub fn end(&self, position: f64) -> Result<bool> {
        self.transition_with(position, |machine| {
            matches!(machine.state, PlayerState::Playing | PlayerState::Buffering).then_some(PlayerState::Ended)
        })
        .map(|entered| entered.is_some())
    }

    /// Enter `Error`; a no-op when already there
    pub fn fail(&self, position: f64) {
        let _ = self.transition_with(position, |machine| {
            (machine.state != PlayerState::Error).then_some(PlayerState::Error)
        });
    }

    /// Back to `Idle` after a release
    pub fn reset(&self) {
        let _ = self.transition_with(0.0, |machine| {
            (machine.state != PlayerState::Idle).then_some(PlayerState::Idle)
        });
    }
}
