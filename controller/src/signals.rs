use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use doser_common::{
    types::{Button, ButtonSet},
    CalibrationProgress,
};

#[derive(Debug, Default)]
struct SignalState {
    pending: ButtonSet,
    progress: CalibrationProgress,
    calibration_stop: bool,
    calibration_completed: bool,
}

/// The only lock shared with the poller and calibration threads.
#[derive(Clone, Default)]
pub struct Signals {
    inner: Arc<Mutex<SignalState>>,
}

impl Signals {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        // Flags and counters stay meaningful even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn raise(&self, pressed: ButtonSet) {
        let mut state = self.lock();
        for button in pressed.iter() {
            state.pending.insert(button);
        }
    }

    /// Reads and clears one button's press flag.
    pub fn take_button(&self, button: Button) -> bool {
        self.lock().pending.remove(button)
    }

    /// Drains every pending press, one button at a time.
    pub fn take_pressed(&self) -> ButtonSet {
        Button::ALL
            .into_iter()
            .filter(|button| self.take_button(*button))
            .collect()
    }

    pub fn begin_calibration(&self, duration_ms: u64) {
        let mut state = self.lock();
        state.progress = CalibrationProgress::at(0, duration_ms);
        state.calibration_stop = false;
        state.calibration_completed = false;
    }

    pub fn request_calibration_stop(&self) {
        self.lock().calibration_stop = true;
    }

    pub fn calibration_stop_requested(&self) -> bool {
        self.lock().calibration_stop
    }

    pub fn set_progress(&self, progress: CalibrationProgress) {
        self.lock().progress = progress;
    }

    pub fn progress(&self) -> CalibrationProgress {
        self.lock().progress
    }

    /// Called by the worker after the pump is off.
    pub fn finish_calibration(&self, completed: bool) {
        let mut state = self.lock();
        state.calibration_completed = completed;
        state.calibration_stop = false;
    }

    pub fn take_calibration_completed(&self) -> bool {
        std::mem::take(&mut self.lock().calibration_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_button_reads_and_clears_one_flag() {
        let signals = Signals::default();
        signals.raise([Button::Up, Button::Select].into_iter().collect());

        assert!(signals.take_button(Button::Select));
        assert!(!signals.take_button(Button::Select));

        let rest = signals.take_pressed();
        assert!(rest.contains(Button::Up));
        assert!(signals.take_pressed().is_empty());
    }

    #[test]
    fn presses_accumulate_until_taken() {
        let signals = Signals::default();
        signals.raise(ButtonSet::single(Button::Back));
        signals.raise(ButtonSet::single(Button::Select));

        let pressed = signals.take_pressed();
        assert!(pressed.contains(Button::Back));
        assert!(pressed.contains(Button::Select));
    }

    #[test]
    fn completion_flag_is_one_shot() {
        let signals = Signals::default();
        signals.begin_calibration(50_000);
        assert_eq!(signals.progress().remaining_s, 50);

        signals.request_calibration_stop();
        assert!(signals.calibration_stop_requested());
        signals.finish_calibration(false);
        assert!(!signals.calibration_stop_requested());
        assert!(!signals.take_calibration_completed());

        signals.begin_calibration(50_000);
        signals.finish_calibration(true);
        assert!(signals.take_calibration_completed());
        assert!(!signals.take_calibration_completed());
    }
}
