use std::{
    io,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::info;

use doser_common::{calibration::ReferenceRun, CalibrationProgress};

use crate::{pump::CalibrationClaim, signals::Signals};

/// Starts the worker. The caller has already reset the shared progress with
/// [`Signals::begin_calibration`]. If the thread cannot be spawned the claim
/// is dropped with the closure, which powers the pump off.
pub fn spawn_worker(
    run: ReferenceRun,
    claim: CalibrationClaim,
    signals: Signals,
    tick_ms: u64,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("calibration-{}", run.pump))
        .spawn(move || measure(run, claim, &signals, tick_ms))
}

fn measure(run: ReferenceRun, claim: CalibrationClaim, signals: &Signals, tick_ms: u64) {
    let started = Instant::now();
    claim.drive(run.duty);

    let completed = loop {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        signals.set_progress(CalibrationProgress::at(
            elapsed_ms.min(run.duration_ms),
            run.duration_ms,
        ));
        if elapsed_ms >= run.duration_ms {
            break true;
        }
        if signals.calibration_stop_requested() {
            break false;
        }
        let left = run.duration_ms - elapsed_ms;
        thread::sleep(Duration::from_millis(tick_ms.min(left).max(1)));
    };

    // Pump off before anyone is told the run is over.
    drop(claim);
    info!(
        "CAL: {} worker finished after {}ms ({})",
        run.pump,
        started.elapsed().as_millis(),
        if completed { "completed" } else { "stopped" }
    );
    signals.finish_calibration(completed);
}
