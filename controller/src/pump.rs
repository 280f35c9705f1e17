use std::{
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use doser_common::{DutyMap, PumpActivity, PumpId, StartOutcome};

/// Output stage for the two pump channels.
pub trait PumpDriver: Send + Sync {
    fn drive(&self, pump: PumpId, duty: u16);
    fn off(&self, pump: PumpId);
}

/// Host stand-in for the PWM outputs.
#[derive(Debug, Default)]
pub struct SimulatedPumps {
    levels: [AtomicU16; 2],
}

impl SimulatedPumps {
    pub fn level(&self, pump: PumpId) -> u16 {
        self.levels[pump.index()].load(Ordering::Relaxed)
    }
}

impl PumpDriver for SimulatedPumps {
    fn drive(&self, pump: PumpId, duty: u16) {
        self.levels[pump.index()].store(duty, Ordering::Relaxed);
        debug!("pump {pump} output duty {duty}");
    }

    fn off(&self, pump: PumpId) {
        self.levels[pump.index()].store(0, Ordering::Relaxed);
        debug!("pump {pump} output off");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpEvent {
    pub pump: PumpId,
    pub activity: PumpActivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    Off,
    Timed,
    Manual,
    Calibration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Cancelled,
    ReleasedManual,
    AlreadyOff,
    Calibrating,
}

/// Exactly one per pump.
enum PumpOwner {
    Idle,
    Timed {
        run_id: u64,
        cancel: Option<oneshot::Sender<()>>,
    },
    Manual,
    Calibration,
}

impl PumpOwner {
    fn mode(&self) -> PumpMode {
        match self {
            Self::Idle => PumpMode::Off,
            Self::Timed { .. } => PumpMode::Timed,
            Self::Manual => PumpMode::Manual,
            Self::Calibration => PumpMode::Calibration,
        }
    }

    fn cancel_timed(&mut self) {
        if let Self::Timed { cancel, .. } = self {
            if let Some(cancel) = cancel.take() {
                let _ = cancel.send(());
            }
        }
    }
}

struct Slots {
    owners: [PumpOwner; 2],
    duties: DutyMap,
    next_run_id: u64,
}

#[derive(Clone)]
pub struct PumpActuator {
    driver: Arc<dyn PumpDriver>,
    slots: Arc<Mutex<Slots>>,
    events: mpsc::UnboundedSender<PumpEvent>,
}

impl PumpActuator {
    pub fn new(
        driver: Arc<dyn PumpDriver>,
        duties: DutyMap,
        events: mpsc::UnboundedSender<PumpEvent>,
    ) -> Self {
        Self {
            driver,
            slots: Arc::new(Mutex::new(Slots {
                owners: [PumpOwner::Idle, PumpOwner::Idle],
                duties,
                next_run_id: 0,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, pump: PumpId, activity: PumpActivity) {
        // The receiver only goes away during shutdown.
        let _ = self.events.send(PumpEvent { pump, activity });
    }

    /// Runs `pump` for `duration_ms` unless a timed run or calibration already
    /// owns it. A manual override is taken over by the run.
    pub fn start(&self, pump: PumpId, duration_ms: u64) -> StartOutcome {
        let mut slots = self.lock();
        let index = pump.index();
        match slots.owners[index].mode() {
            PumpMode::Timed | PumpMode::Calibration => {
                info!("pump {pump} start ignored (busy)");
                return StartOutcome::Busy;
            }
            PumpMode::Manual => info!("pump {pump} manual override replaced by timed run"),
            PumpMode::Off => {}
        }

        let run_id = slots.next_run_id;
        slots.next_run_id = slots.next_run_id.wrapping_add(1);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        slots.owners[index] = PumpOwner::Timed {
            run_id,
            cancel: Some(cancel_tx),
        };
        let duty = slots.duties.get(pump);
        self.driver.drive(pump, duty);
        drop(slots);

        info!("pump {pump} started for {duration_ms}ms at duty {duty}");
        self.notify(pump, PumpActivity::On);

        let guard = RunGuard {
            actuator: self.clone(),
            pump,
            run_id,
        };
        tokio::spawn(async move {
            let guard = guard;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    info!("pump {} run completed", guard.pump);
                }
                _ = cancel_rx => {
                    info!("pump {} run cancelled", guard.pump);
                }
            }
        });

        StartOutcome::Started
    }

    /// Cancels a timed run or releases a manual override. The timed run's
    /// guard powers the pump off once its task observes the cancellation.
    pub fn stop(&self, pump: PumpId) -> StopOutcome {
        let mut slots = self.lock();
        let index = pump.index();
        match slots.owners[index].mode() {
            PumpMode::Timed => {
                slots.owners[index].cancel_timed();
                info!("pump {pump} stop requested");
                StopOutcome::Cancelled
            }
            PumpMode::Manual => {
                slots.owners[index] = PumpOwner::Idle;
                self.driver.off(pump);
                drop(slots);
                info!("pump {pump} manual override stopped");
                self.notify(pump, PumpActivity::Off);
                StopOutcome::ReleasedManual
            }
            PumpMode::Off => StopOutcome::AlreadyOff,
            PumpMode::Calibration => {
                warn!("pump {pump} stop ignored: calibration in progress");
                StopOutcome::Calibrating
            }
        }
    }

    /// Cancels any timed run, then flips the manual override.
    pub fn toggle_manual(&self, pump: PumpId) -> PumpActivity {
        let mut slots = self.lock();
        let index = pump.index();
        let duty = slots.duties.get(pump);
        let activity = match slots.owners[index].mode() {
            PumpMode::Calibration => {
                warn!("pump {pump} manual toggle ignored: calibration in progress");
                return PumpActivity::On;
            }
            PumpMode::Manual => {
                slots.owners[index] = PumpOwner::Idle;
                self.driver.off(pump);
                PumpActivity::Off
            }
            PumpMode::Timed => {
                // The run's guard no longer matches and leaves the output alone.
                slots.owners[index].cancel_timed();
                slots.owners[index] = PumpOwner::Manual;
                self.driver.drive(pump, duty);
                PumpActivity::On
            }
            PumpMode::Off => {
                slots.owners[index] = PumpOwner::Manual;
                self.driver.drive(pump, duty);
                PumpActivity::On
            }
        };
        drop(slots);

        info!("pump {pump} manual {}", activity.as_str());
        self.notify(pump, activity);
        activity
    }

    /// Powers off every manually driven pump and returns which ones.
    pub fn release_manual(&self) -> Vec<PumpId> {
        let mut slots = self.lock();
        let released: Vec<PumpId> = PumpId::ALL
            .into_iter()
            .filter(|pump| slots.owners[pump.index()].mode() == PumpMode::Manual)
            .collect();
        for pump in &released {
            slots.owners[pump.index()] = PumpOwner::Idle;
            self.driver.off(*pump);
        }
        drop(slots);

        for pump in &released {
            info!("pump {pump} manual override released");
            self.notify(*pump, PumpActivity::Off);
        }
        released
    }

    /// Reserves an idle pump for the calibration worker.
    pub fn claim_calibration(&self, pump: PumpId) -> Option<CalibrationClaim> {
        let mut slots = self.lock();
        let index = pump.index();
        if slots.owners[index].mode() != PumpMode::Off {
            info!("pump {pump} calibration rejected (busy)");
            return None;
        }
        slots.owners[index] = PumpOwner::Calibration;
        Some(CalibrationClaim {
            actuator: self.clone(),
            pump,
        })
    }

    pub fn mode(&self, pump: PumpId) -> PumpMode {
        self.lock().owners[pump.index()].mode()
    }

    pub fn activity(&self, pump: PumpId) -> PumpActivity {
        PumpActivity::from_on(self.mode(pump) != PumpMode::Off)
    }

    pub fn duty(&self, pump: PumpId) -> u16 {
        self.lock().duties.get(pump)
    }

    /// Takes effect on the next start.
    pub fn set_duties(&self, duties: DutyMap) {
        self.lock().duties = duties;
    }

    /// Powers everything off, whoever owns it.
    pub fn shutdown(&self) {
        let mut slots = self.lock();
        for pump in PumpId::ALL {
            let owner = &mut slots.owners[pump.index()];
            owner.cancel_timed();
            *owner = PumpOwner::Idle;
            self.driver.off(pump);
        }
        info!("all pumps off");
    }
}

/// Powers the pump off when its timed run ends, unless another owner has
/// taken the pump over in the meantime.
struct RunGuard {
    actuator: PumpActuator,
    pump: PumpId,
    run_id: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut slots = self.actuator.lock();
        let owner = &mut slots.owners[self.pump.index()];
        if !matches!(owner, PumpOwner::Timed { run_id, .. } if *run_id == self.run_id) {
            return;
        }
        *owner = PumpOwner::Idle;
        self.actuator.driver.off(self.pump);
        drop(slots);
        info!("pump {} stopped", self.pump);
        self.actuator.notify(self.pump, PumpActivity::Off);
    }
}

/// Exclusive use of one pump by the calibration worker. Dropping the claim
/// powers the pump off and frees it.
pub struct CalibrationClaim {
    actuator: PumpActuator,
    pump: PumpId,
}

impl CalibrationClaim {
    pub fn pump(&self) -> PumpId {
        self.pump
    }

    pub fn drive(&self, duty: u16) {
        self.actuator.driver.drive(self.pump, duty);
        self.actuator.notify(self.pump, PumpActivity::On);
    }
}

impl Drop for CalibrationClaim {
    fn drop(&mut self) {
        let mut slots = self.actuator.lock();
        let owner = &mut slots.owners[self.pump.index()];
        if matches!(owner, PumpOwner::Calibration) {
            *owner = PumpOwner::Idle;
        }
        self.actuator.driver.off(self.pump);
        drop(slots);
        self.actuator.notify(self.pump, PumpActivity::Off);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn actuator() -> (
        PumpActuator,
        Arc<SimulatedPumps>,
        mpsc::UnboundedReceiver<PumpEvent>,
    ) {
        let driver = Arc::new(SimulatedPumps::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let actuator = PumpActuator::new(driver.clone(), DutyMap::uniform(800), tx);
        (actuator, driver, rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<PumpEvent>) -> Vec<PumpActivity> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.activity);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn timed_run_powers_off_after_its_duration() {
        let (actuator, driver, mut events) = actuator();

        assert_eq!(actuator.start(PumpId::One, 2_000), StartOutcome::Started);
        assert_eq!(driver.level(PumpId::One), 800);
        assert_eq!(driver.level(PumpId::Two), 0);

        tokio::time::sleep(Duration::from_millis(1_990)).await;
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Timed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Off);
        assert_eq!(driver.level(PumpId::One), 0);
        assert_eq!(drain(&mut events), vec![PumpActivity::On, PumpActivity::Off]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_running_is_ignored() {
        let (actuator, _driver, mut events) = actuator();

        assert_eq!(actuator.start(PumpId::Two, 5_000), StartOutcome::Started);
        assert_eq!(actuator.start(PumpId::Two, 60_000), StartOutcome::Busy);
        assert_eq!(actuator.start(PumpId::One, 1_000), StartOutcome::Started);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(actuator.activity(PumpId::Two), PumpActivity::Off);
        assert_eq!(drain(&mut events).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_run_and_powers_off() {
        let (actuator, driver, _events) = actuator();

        actuator.start(PumpId::One, 30_000);
        assert_eq!(actuator.stop(PumpId::One), StopOutcome::Cancelled);
        settle().await;

        assert_eq!(driver.level(PumpId::One), 0);
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Off);
        assert_eq!(actuator.stop(PumpId::One), StopOutcome::AlreadyOff);
        assert_eq!(actuator.start(PumpId::One, 1_000), StartOutcome::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_toggle_replaces_a_timed_run() {
        let (actuator, driver, _events) = actuator();

        actuator.start(PumpId::One, 5_000);
        assert_eq!(actuator.toggle_manual(PumpId::One), PumpActivity::On);
        settle().await;

        // The cancelled run must not switch off the manually driven pump.
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Manual);
        assert_eq!(driver.level(PumpId::One), 800);
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(driver.level(PumpId::One), 800);

        assert_eq!(actuator.toggle_manual(PumpId::One), PumpActivity::Off);
        assert_eq!(driver.level(PumpId::One), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_manual_only_touches_manual_pumps() {
        let (actuator, driver, _events) = actuator();

        actuator.toggle_manual(PumpId::One);
        actuator.start(PumpId::Two, 10_000);

        assert_eq!(actuator.release_manual(), vec![PumpId::One]);
        assert_eq!(driver.level(PumpId::One), 0);
        assert_eq!(actuator.mode(PumpId::Two), PumpMode::Timed);
        assert!(actuator.release_manual().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_run_takes_over_manual_override() {
        let (actuator, driver, _events) = actuator();

        actuator.toggle_manual(PumpId::Two);
        assert_eq!(actuator.start(PumpId::Two, 1_000), StartOutcome::Started);
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(actuator.mode(PumpId::Two), PumpMode::Off);
        assert_eq!(driver.level(PumpId::Two), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_claim_is_exclusive_until_dropped() {
        let (actuator, driver, _events) = actuator();

        let claim = actuator.claim_calibration(PumpId::One).unwrap();
        assert!(actuator.claim_calibration(PumpId::One).is_none());
        assert_eq!(actuator.start(PumpId::One, 1_000), StartOutcome::Busy);
        assert_eq!(actuator.stop(PumpId::One), StopOutcome::Calibrating);

        claim.drive(650);
        assert_eq!(actuator.toggle_manual(PumpId::One), PumpActivity::On);
        assert_eq!(driver.level(PumpId::One), 650);

        drop(claim);
        assert_eq!(driver.level(PumpId::One), 0);
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_pump_cannot_be_claimed() {
        let (actuator, _driver, _events) = actuator();

        actuator.toggle_manual(PumpId::Two);
        assert!(actuator.claim_calibration(PumpId::Two).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn duty_changes_apply_to_the_next_start() {
        let (actuator, driver, _events) = actuator();

        let mut duties = DutyMap::uniform(1023);
        assert_eq!(duties.set(PumpId::One, 10), 100);
        actuator.set_duties(duties);
        assert_eq!(actuator.duty(PumpId::One), 100);
        actuator.start(PumpId::One, 1_000);
        assert_eq!(driver.level(PumpId::One), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_powers_everything_off() {
        let (actuator, driver, _events) = actuator();

        actuator.start(PumpId::One, 60_000);
        actuator.toggle_manual(PumpId::Two);
        actuator.shutdown();
        settle().await;

        assert_eq!(driver.level(PumpId::One), 0);
        assert_eq!(driver.level(PumpId::Two), 0);
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Off);
    }

    fn assert_output_matches_owner(actuator: &PumpActuator, driver: &SimulatedPumps) {
        for pump in PumpId::ALL {
            let level = driver.level(pump);
            match actuator.mode(pump) {
                PumpMode::Off => assert_eq!(level, 0, "{pump} is idle but driven"),
                PumpMode::Timed | PumpMode::Manual => {
                    assert_eq!(level, 800, "{pump} is owned but not driven")
                }
                PumpMode::Calibration => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn commands_racing_a_pending_cancel_keep_one_owner() {
        let (actuator, driver, _events) = actuator();

        // Restart before the cancelled run has wound down.
        actuator.start(PumpId::One, 30_000);
        assert_eq!(actuator.stop(PumpId::One), StopOutcome::Cancelled);
        assert_eq!(actuator.start(PumpId::One, 1_000), StartOutcome::Busy);
        assert_eq!(actuator.stop(PumpId::One), StopOutcome::Cancelled);
        settle().await;
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Off);
        assert_output_matches_owner(&actuator, &driver);
        assert_eq!(actuator.start(PumpId::One, 1_000), StartOutcome::Started);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_output_matches_owner(&actuator, &driver);

        // Manual takeover while the old run's guard is still alive.
        actuator.start(PumpId::Two, 30_000);
        actuator.stop(PumpId::Two);
        assert_eq!(actuator.toggle_manual(PumpId::Two), PumpActivity::On);
        settle().await;
        assert_eq!(actuator.mode(PumpId::Two), PumpMode::Manual);
        assert_eq!(driver.level(PumpId::Two), 800);
        assert_output_matches_owner(&actuator, &driver);
        assert_eq!(actuator.toggle_manual(PumpId::Two), PumpActivity::Off);
        settle().await;
        assert_output_matches_owner(&actuator, &driver);

        // Shutdown with both pumps mid-cancel, then a fresh run.
        actuator.start(PumpId::One, 30_000);
        actuator.start(PumpId::Two, 30_000);
        actuator.stop(PumpId::One);
        actuator.stop(PumpId::Two);
        actuator.shutdown();
        assert_eq!(actuator.start(PumpId::One, 5_000), StartOutcome::Started);
        settle().await;
        assert_eq!(actuator.mode(PumpId::One), PumpMode::Timed);
        assert_eq!(actuator.mode(PumpId::Two), PumpMode::Off);
        assert_output_matches_owner(&actuator, &driver);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        for pump in PumpId::ALL {
            assert_eq!(actuator.mode(pump), PumpMode::Off);
        }
        assert_output_matches_owner(&actuator, &driver);
    }
}
