use tracing::{debug, warn};

use crate::{
    error::InputError,
    types::{Button, ButtonSet},
};

/// Raw access to the button lines. `true` means the button is held down.
pub trait ButtonPins {
    fn is_pressed(&mut self, button: Button) -> Result<bool, InputError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceState {
    confirmed: bool,
    debounce_started_ms: Option<u64>,
}

impl DebounceState {
    /// Confirmed level is whatever the majority of startup samples read, so a
    /// line still settling after power-up is not mistaken for a held button.
    pub fn from_samples(samples: &[bool]) -> Self {
        let pressed = samples.iter().filter(|sample| **sample).count();
        Self {
            confirmed: pressed * 2 > samples.len(),
            debounce_started_ms: None,
        }
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn observe<F>(
        &mut self,
        raw: bool,
        now_ms: u64,
        debounce_ms: u64,
        resample: F,
    ) -> Result<Option<Edge>, InputError>
    where
        F: FnOnce() -> Result<bool, InputError>,
    {
        if raw == self.confirmed {
            self.debounce_started_ms = None;
            return Ok(None);
        }

        let started = *self.debounce_started_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(started) <= debounce_ms {
            return Ok(None);
        }

        self.debounce_started_ms = None;
        let recheck = resample()?;
        if recheck != raw || recheck == self.confirmed {
            return Ok(None);
        }

        self.confirmed = recheck;
        Ok(Some(if recheck {
            Edge::Pressed
        } else {
            Edge::Released
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub pressed: ButtonSet,
    pub failed: ButtonSet,
    pub errors: Vec<InputError>,
}

impl PollOutcome {
    /// Only a pass where no line could be read counts toward back-off.
    pub fn all_failed(&self) -> bool {
        Button::ALL.into_iter().all(|button| self.failed.contains(button))
    }
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    states: [DebounceState; 6],
    debounce_ms: u64,
}

impl Debouncer {
    /// Samples every button `samples` times, calling `pause` between rounds.
    /// Pins that fail to read contribute no sample.
    pub fn initialize<P, F>(pins: &mut P, samples: u8, debounce_ms: u64, mut pause: F) -> Self
    where
        P: ButtonPins,
        F: FnMut(),
    {
        let mut readings: [Vec<bool>; 6] = Default::default();
        for round in 0..samples.max(1) {
            if round > 0 {
                pause();
            }
            for button in Button::ALL {
                match pins.is_pressed(button) {
                    Ok(level) => readings[button.index()].push(level),
                    Err(err) => warn!("startup sample skipped: {err}"),
                }
            }
        }

        let states = Button::ALL.map(|button| {
            let state = DebounceState::from_samples(&readings[button.index()]);
            debug!(
                "button {button} init: {:?} -> pressed={}",
                readings[button.index()],
                state.confirmed()
            );
            state
        });

        Self {
            states,
            debounce_ms,
        }
    }

    pub fn confirmed(&self, button: Button) -> bool {
        self.states[button.index()].confirmed()
    }

    /// One polling pass over all buttons. A failing pin is reported and
    /// skipped; the others are still processed.
    pub fn poll<P: ButtonPins>(&mut self, pins: &mut P, now_ms: u64) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        for button in Button::ALL {
            let raw = match pins.is_pressed(button) {
                Ok(raw) => raw,
                Err(err) => {
                    outcome.failed.insert(button);
                    outcome.errors.push(err);
                    continue;
                }
            };

            let state = &mut self.states[button.index()];
            match state.observe(raw, now_ms, self.debounce_ms, || pins.is_pressed(button)) {
                Ok(Some(Edge::Pressed)) => {
                    debug!("button {button} press confirmed");
                    outcome.pressed.insert(button);
                }
                Ok(Some(Edge::Released)) => debug!("button {button} released"),
                Ok(None) => {}
                Err(err) => {
                    outcome.failed.insert(button);
                    outcome.errors.push(err);
                }
            }
        }

        outcome
    }
}

/// Pause to apply after a polling pass, escalating after a run of failures.
#[derive(Debug, Clone)]
pub struct ErrorBackoff {
    consecutive: u32,
    threshold: u32,
    pause_ms: u64,
    backoff_ms: u64,
}

impl ErrorBackoff {
    pub fn new(threshold: u32, pause_ms: u64, backoff_ms: u64) -> Self {
        Self {
            consecutive: 0,
            threshold,
            pause_ms,
            backoff_ms,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// `None` after a clean pass. Otherwise the extra sleep before the next
    /// pass: the short pause normally, the long back-off once the failure
    /// count exceeds the threshold (which also resets the count).
    pub fn record(&mut self, failed: bool) -> Option<u64> {
        if !failed {
            self.consecutive = 0;
            return None;
        }

        self.consecutive += 1;
        if self.consecutive > self.threshold {
            warn!(
                "button polling failed {} times in a row; backing off {}ms",
                self.consecutive, self.backoff_ms
            );
            self.consecutive = 0;
            Some(self.backoff_ms)
        } else {
            Some(self.pause_ms)
        }
    }
}
