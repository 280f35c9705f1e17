use std::{
    io::{self, BufRead},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, info, warn};

use doser_common::{
    input::{ButtonPins, Debouncer, ErrorBackoff},
    Button, ButtonSet, DoserConfig, InputError,
};

use crate::{clock::monotonic_ms, signals::Signals};

/// Owns the polling thread; dropping it stops and joins the thread.
pub struct InputPoller {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
struct PollTiming {
    settle: Duration,
    init_samples: u8,
    init_gap: Duration,
    debounce_ms: u64,
    poll_ms: u64,
    error_threshold: u32,
    error_pause_ms: u64,
    error_backoff_ms: u64,
}

impl From<&DoserConfig> for PollTiming {
    fn from(config: &DoserConfig) -> Self {
        Self {
            settle: Duration::from_millis(config.button_settle_ms),
            init_samples: config.button_init_samples,
            init_gap: Duration::from_millis(config.button_init_sample_gap_ms),
            debounce_ms: config.button_debounce_ms,
            poll_ms: config.button_poll_ms,
            error_threshold: config.button_error_threshold,
            error_pause_ms: config.button_error_pause_ms,
            error_backoff_ms: config.button_error_backoff_ms,
        }
    }
}

impl InputPoller {
    pub fn spawn<P>(pins: P, signals: Signals, config: &DoserConfig) -> io::Result<Self>
    where
        P: ButtonPins + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let timing = PollTiming::from(config);

        let join = thread::Builder::new()
            .name("button-poller".to_string())
            .spawn(move || poll_loop(pins, &signals, &stop, timing))?;

        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }
}

impl Drop for InputPoller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("button poller panicked");
            }
        }
    }
}

fn poll_loop<P: ButtonPins>(mut pins: P, signals: &Signals, stop: &AtomicBool, timing: PollTiming) {
    // Pull-ups need a moment after power-up before the lines read true.
    thread::sleep(timing.settle);
    let mut debouncer = Debouncer::initialize(
        &mut pins,
        timing.init_samples,
        timing.debounce_ms,
        || thread::sleep(timing.init_gap),
    );
    let mut backoff = ErrorBackoff::new(
        timing.error_threshold,
        timing.error_pause_ms,
        timing.error_backoff_ms,
    );
    info!("button poller started");

    let mut failing = ButtonSet::empty();
    while !stop.load(Ordering::Relaxed) {
        let outcome = debouncer.poll(&mut pins, monotonic_ms());
        for err in &outcome.errors {
            match err {
                InputError::PinRead { button, .. } if !failing.contains(*button) => {
                    warn!("button read failed: {err}");
                }
                _ => debug!("button read failed: {err}"),
            }
        }
        for button in failing.iter().filter(|button| !outcome.failed.contains(*button)) {
            info!("button {button} readable again");
        }
        failing = outcome.failed;
        if !outcome.pressed.is_empty() {
            signals.raise(outcome.pressed);
        }

        let pause_ms = backoff
            .record(outcome.all_failed())
            .unwrap_or(timing.poll_ms);
        thread::sleep(Duration::from_millis(pause_ms));
    }
    debug!("button poller exiting");
}

/// Button lines driven by software, shared between the poller and whoever
/// presses them.
#[derive(Debug, Clone, Default)]
pub struct VirtualPins {
    levels: Arc<[AtomicBool; 6]>,
}

impl VirtualPins {
    /// Holds `buttons` down together for `hold`, then releases them.
    pub fn press(&self, buttons: &[Button], hold: Duration) {
        for button in buttons {
            self.levels[button.index()].store(true, Ordering::Relaxed);
        }
        thread::sleep(hold);
        for button in buttons {
            self.levels[button.index()].store(false, Ordering::Relaxed);
        }
    }
}

impl ButtonPins for VirtualPins {
    fn is_pressed(&mut self, button: Button) -> Result<bool, InputError> {
        Ok(self.levels[button.index()].load(Ordering::Relaxed))
    }
}

/// Maps a console line to buttons: a full name (`select`) or a run of keys
/// pressed together (`eq` is SELECT with BACK).
pub fn parse_keys(line: &str) -> Vec<Button> {
    let line = line.trim();
    if let Some(button) = Button::from_name(line) {
        return vec![button];
    }

    let mut buttons = Vec::new();
    for key in line.chars() {
        let button = match key.to_ascii_lowercase() {
            'w' => Button::Up,
            'a' => Button::Left,
            's' => Button::Down,
            'd' => Button::Right,
            'e' => Button::Select,
            'q' => Button::Back,
            other => {
                debug!("ignoring key {other:?}");
                continue;
            }
        };
        if !buttons.contains(&button) {
            buttons.push(button);
        }
    }
    buttons
}

/// Reads stdin on a detached thread and presses the matching virtual lines.
pub fn spawn_console_buttons(pins: VirtualPins, hold: Duration) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("console-buttons".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("console input closed: {err}");
                        break;
                    }
                };
                let buttons = parse_keys(&line);
                if !buttons.is_empty() {
                    pins.press(&buttons, hold);
                }
            }
            debug!("console input reached end of stream");
        })
}
