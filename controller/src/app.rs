use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use doser_common::{
    calibration::ReferenceRun, CalibrationEngine, DoserConfig, DutyMap, PumpActivity,
    PumpCommand, PumpId, RunLog, RuntimeConfig, ScheduleEntry, ScheduleError, ScheduleEvaluator,
    ScheduleStore, StartOutcome, UiContext, UiEffect, UiLimits, UiMachine,
};

use crate::{
    calibration,
    clock::{monotonic_ms, synced_local_time},
    connectivity::LinkMonitor,
    display::{compose, Frame, FrameView},
    mqtt::Telemetry,
    pump::{PumpActuator, PumpEvent, StopOutcome},
    signals::Signals,
    store::AppStore,
};

pub struct Core {
    pub schedules: ScheduleStore,
    pub run_log: RunLog,
    pub duties: DutyMap,
    pub calibration: CalibrationEngine,
    pub ui: UiMachine,
    pub evaluator: ScheduleEvaluator,
    redraw: bool,
}

impl Core {
    pub fn new(
        config: &DoserConfig,
        schedules: ScheduleStore,
        run_log: RunLog,
        duties: DutyMap,
        now_ms: u64,
    ) -> Self {
        Self {
            schedules,
            run_log,
            duties,
            calibration: CalibrationEngine::new(
                config.calibration_reference_ml,
                config.calibration_duration_ms,
            ),
            ui: UiMachine::new(UiLimits::from(config), now_ms),
            evaluator: ScheduleEvaluator::new(),
            redraw: true,
        }
    }

    fn calibration_in_progress(&self) -> bool {
        self.calibration.is_active() || self.ui.screen().is_calibration()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Mutex<Core>>,
    pub actuator: PumpActuator,
    pub signals: Signals,
    pub store: AppStore,
    pub telemetry: Telemetry,
    pub link: Arc<Mutex<LinkMonitor>>,
    pub config: Arc<RuntimeConfig>,
}

impl AppState {
    pub fn local_now(&self) -> Option<NaiveDateTime> {
        synced_local_time(&self.config.timezone)
    }

    /// One input-dispatch cycle: calibration completion, inactivity, then
    /// whatever presses the poller confirmed since the last cycle.
    pub async fn dispatch_input(&self) {
        let now_ms = monotonic_ms();
        let now = self.local_now();
        let effects = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let mut effects = Vec::new();

            if self.signals.take_calibration_completed() {
                effects.extend(core.ui.on_calibration_finished(&mut core.calibration));
            }

            let timed_out = core.ui.check_inactivity(now_ms, &core.calibration);
            if timed_out.is_empty() {
                let pressed = self.signals.take_pressed();
                let mut ctx = UiContext {
                    schedules: &mut core.schedules,
                    calibration: &mut core.calibration,
                    duties: &mut core.duties,
                    now,
                };
                effects.extend(core.ui.handle(pressed, now_ms, &mut ctx));
            } else {
                effects.extend(timed_out);
            }
            effects
        };

        self.apply_ui_effects(effects).await;
    }

    pub async fn apply_ui_effects(&self, effects: Vec<UiEffect>) {
        for effect in effects {
            match effect {
                UiEffect::ToggleManual(pump) => {
                    self.actuator.toggle_manual(pump);
                }
                UiEffect::ReleaseManualPumps => {
                    self.actuator.release_manual();
                }
                UiEffect::PersistSchedules => {
                    let schedules = self.persist_schedules().await;
                    self.telemetry.publish_schedules(&schedules);
                }
                UiEffect::PersistCalibration => {
                    let duties = self.core.lock().await.duties;
                    self.actuator.set_duties(duties);
                    info!(
                        "CAL: output duty P1={} P2={}",
                        self.actuator.duty(PumpId::One),
                        self.actuator.duty(PumpId::Two)
                    );
                    if let Err(err) = self.store.save_duties(&duties).await {
                        warn!("failed to persist calibration: {err:#}");
                    }
                }
                UiEffect::StartCalibration(run) => self.start_calibration(run).await,
                UiEffect::StopCalibration => self.signals.request_calibration_stop(),
                UiEffect::Redraw => self.core.lock().await.redraw = true,
            }
        }
    }

    async fn start_calibration(&self, run: ReferenceRun) {
        let Some(claim) = self.actuator.claim_calibration(run.pump) else {
            warn!("CAL: {} is busy; calibration not started", run.pump);
            self.reject_calibration().await;
            return;
        };

        self.signals.begin_calibration(run.duration_ms);
        let tick_ms = self.config.doser.calibration_tick_ms;
        if let Err(err) = calibration::spawn_worker(run, claim, self.signals.clone(), tick_ms) {
            warn!("CAL: failed to start measurement worker: {err}");
            self.reject_calibration().await;
        }
    }

    async fn reject_calibration(&self) {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        core.ui.on_calibration_rejected(&mut core.calibration);
        core.redraw = true;
    }

    pub async fn evaluate_schedules_at(&self, now: Option<NaiveDateTime>) {
        let changed_log = {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let actuator = &self.actuator;
            let report = core
                .evaluator
                .run(now, &core.schedules, &mut core.run_log, |pump, entry| {
                    actuator.start(pump, u64::from(entry.duration_ms))
                });
            report.run_log_changed().then(|| core.run_log.clone())
        };

        if let Some(run_log) = changed_log {
            if let Err(err) = self.store.save_run_log(&run_log).await {
                warn!("failed to persist run log: {err:#}");
            }
        }
    }

    pub async fn pump_command(&self, pump: PumpId, command: PumpCommand) {
        match command {
            PumpCommand::On => self.remote_run(pump, self.config.doser.remote_on_duration_ms),
            PumpCommand::Run { duration_ms } => self.remote_run(pump, duration_ms),
            PumpCommand::Off => match self.actuator.stop(pump) {
                StopOutcome::AlreadyOff => {
                    info!("CMD: {pump} OFF (already off)");
                    self.telemetry.publish_pump(pump, PumpActivity::Off);
                }
                outcome => info!("CMD: {pump} OFF ({outcome:?})"),
            },
        }
    }

    fn remote_run(&self, pump: PumpId, duration_ms: u64) {
        match self.actuator.start(pump, duration_ms) {
            StartOutcome::Started => info!("CMD: {pump} run {duration_ms}ms"),
            StartOutcome::Busy => info!("CMD: {pump} run {duration_ms}ms ignored (busy)"),
        }
    }

    pub async fn add_schedule(&self, pump: PumpId, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        self.core.lock().await.schedules.add(pump, entry)?;
        info!(
            "SCHED: added {pump} {:02}:{:02} ({}ms, every {} day(s))",
            entry.hour, entry.minute, entry.duration_ms, entry.interval_days
        );
        self.schedules_changed().await;
        Ok(())
    }

    pub async fn delete_schedule(&self, pump: PumpId, hour: u8, minute: u8) -> Result<(), ScheduleError> {
        {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            core.schedules.delete(pump, hour, minute)?;
            core.ui.on_schedules_changed(pump, &core.schedules);
        }
        info!("SCHED: deleted {pump} {hour:02}:{minute:02}");
        self.schedules_changed().await;
        Ok(())
    }

    async fn schedules_changed(&self) {
        let schedules = self.persist_schedules().await;
        self.telemetry.publish_schedules(&schedules);
        self.request_redraw().await;
    }

    /// Saves the current store and returns the snapshot that was written.
    async fn persist_schedules(&self) -> ScheduleStore {
        let schedules = self.core.lock().await.schedules.clone();
        if let Err(err) = self.store.save_schedules(&schedules).await {
            warn!("failed to persist schedules: {err:#}");
        }
        schedules
    }

    pub async fn publish_all(&self) {
        for pump in PumpId::ALL {
            self.telemetry.publish_pump(pump, self.actuator.activity(pump));
        }
        let schedules = self.core.lock().await.schedules.clone();
        self.telemetry.publish_schedules(&schedules);
    }

    pub async fn on_pump_event(&self, event: PumpEvent) {
        self.telemetry.publish_pump(event.pump, event.activity);
        self.request_redraw().await;
    }

    /// Asks the display for a full repaint, unless a calibration is on screen
    /// or in progress.
    pub async fn request_redraw(&self) {
        let mut core = self.core.lock().await;
        if core.calibration_in_progress() {
            debug!("redraw request suppressed during calibration");
            return;
        }
        core.redraw = true;
    }

    /// The frame to show now, whether it needs a full repaint, and how long
    /// to wait before the next one.
    pub async fn next_frame(&self) -> (Frame, bool, u64) {
        let pumps = PumpId::ALL.map(|pump| self.actuator.mode(pump));
        let progress = self.signals.progress();
        let now = self.local_now();
        let bus_connected = self.telemetry.is_connected();

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let frame = compose(&FrameView {
            ui: &core.ui,
            schedules: &core.schedules,
            calibration: &core.calibration,
            duties: &core.duties,
            progress,
            pumps,
            now,
            bus_connected,
        });
        let full = std::mem::take(&mut core.redraw);
        (frame, full, core.ui.screen().refresh_interval_ms())
    }
}

#[cfg(test)]
pub(crate) mod rig {
    use std::sync::Arc as StdArc;

    use rumqttc::{AsyncClient, EventLoop, MqttOptions};
    use tokio::sync::mpsc;

    use doser_common::{Button, ButtonSet, DoseTopics, Screen};

    use super::*;
    use crate::pump::SimulatedPumps;

    pub(crate) struct Rig {
        pub state: AppState,
        pub driver: StdArc<SimulatedPumps>,
        _eventloop: EventLoop,
        _dir: tempfile::TempDir,
    }

    pub(crate) fn rig_with(doser: DoserConfig) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            doser,
            ..RuntimeConfig::default()
        };
        let topics = DoseTopics::new(&config.device_id);
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1883), 16);
        let driver = StdArc::new(SimulatedPumps::default());
        let (events, _rx) = mpsc::unbounded_channel();
        let duties = DutyMap::uniform(config.doser.default_duty);
        let core = Core::new(
            &config.doser,
            ScheduleStore::default(),
            RunLog::default(),
            duties,
            monotonic_ms(),
        );

        let state = AppState {
            core: Arc::new(Mutex::new(core)),
            actuator: PumpActuator::new(driver.clone(), duties, events),
            signals: Signals::default(),
            store: AppStore::new(dir.path()),
            telemetry: Telemetry::new(client, topics, "a"),
            link: Arc::new(Mutex::new(LinkMonitor::default())),
            config: Arc::new(config),
        };
        Rig {
            state,
            driver,
            _eventloop: eventloop,
            _dir: dir,
        }
    }

    pub(crate) fn rig() -> Rig {
        rig_with(DoserConfig::default())
    }

    pub(crate) async fn press(state: &AppState, buttons: &[Button]) {
        state
            .signals
            .raise(buttons.iter().copied().collect::<ButtonSet>());
        state.dispatch_input().await;
    }

    pub(crate) async fn screen(state: &AppState) -> Screen {
        state.core.lock().await.ui.screen()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use doser_common::{Button, CalibrationStage, Screen};

    use super::{rig::*, *};
    use crate::pump::PumpMode;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn remote_on_runs_for_the_configured_time() {
        let rig = rig();
        let state = &rig.state;

        state.pump_command(PumpId::One, PumpCommand::On).await;
        assert_eq!(state.actuator.mode(PumpId::One), PumpMode::Timed);
        state
            .pump_command(PumpId::One, PumpCommand::Run { duration_ms: 60_000 })
            .await;

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(state.actuator.mode(PumpId::One), PumpMode::Off);
        assert_eq!(rig.driver.level(PumpId::One), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_off_cancels_a_run() {
        let rig = rig();
        let state = &rig.state;

        state
            .pump_command(PumpId::Two, PumpCommand::Run { duration_ms: 600_000 })
            .await;
        state.pump_command(PumpId::Two, PumpCommand::Off).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(state.actuator.mode(PumpId::Two), PumpMode::Off);
        state.pump_command(PumpId::Two, PumpCommand::Off).await;
    }

    #[tokio::test]
    async fn remote_schedule_changes_are_persisted() {
        let rig = rig();
        let state = &rig.state;
        let entry = ScheduleEntry::new(8, 0, 3_000, 2).unwrap();

        state.add_schedule(PumpId::One, entry).await.unwrap();
        let duplicate = ScheduleEntry::daily(8, 0, 9_000).unwrap();
        assert!(matches!(
            state.add_schedule(PumpId::One, duplicate).await,
            Err(ScheduleError::Duplicate { .. })
        ));

        let saved = state.store.load_schedules().await.unwrap();
        assert_eq!(saved.entries(PumpId::One), &[entry]);

        state.delete_schedule(PumpId::One, 8, 0).await.unwrap();
        assert!(state.delete_schedule(PumpId::One, 8, 0).await.is_err());
        assert!(state.store.load_schedules().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn due_entry_fires_once_and_logs_its_run() {
        let rig = rig();
        let state = &rig.state;
        let entry = ScheduleEntry::new(7, 30, 2_000, 3).unwrap();
        state.add_schedule(PumpId::Two, entry).await.unwrap();

        state.evaluate_schedules_at(Some(at(7, 30))).await;
        assert_eq!(state.actuator.mode(PumpId::Two), PumpMode::Timed);

        let run_log = state.store.load_run_log().await.unwrap();
        assert_eq!(run_log.last_run(PumpId::Two, 7, 30), Some("2026-10-18"));

        // Unsynced clock: nothing is evaluated.
        state.evaluate_schedules_at(None).await;
        assert_eq!(state.core.lock().await.run_log, run_log);
    }

    #[tokio::test]
    async fn view_schedule_chord_deletes_and_persists() {
        let rig = rig();
        let state = &rig.state;
        state
            .add_schedule(PumpId::One, ScheduleEntry::daily(6, 0, 1_000).unwrap())
            .await
            .unwrap();

        press(state, &[Button::Select]).await;
        press(state, &[Button::Select]).await;
        press(state, &[Button::Select]).await;
        assert_eq!(screen(state).await, Screen::ViewSchedule);

        press(state, &[Button::Select, Button::Back]).await;
        assert_eq!(screen(state).await, Screen::ViewSchedule);
        assert!(state.store.load_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaving_manual_control_releases_pumps() {
        let rig = rig();
        let state = &rig.state;

        press(state, &[Button::Right]).await;
        press(state, &[Button::Select]).await;
        assert_eq!(state.actuator.mode(PumpId::One), PumpMode::Manual);

        press(state, &[Button::Left]).await;
        assert_eq!(screen(state).await, Screen::Main);
        assert_eq!(state.actuator.mode(PumpId::One), PumpMode::Off);
    }

    #[tokio::test]
    async fn redraw_requests_are_suppressed_on_calibration_screens() {
        let rig = rig();
        let state = &rig.state;
        let (_, full, _) = state.next_frame().await;
        assert!(full);

        state.request_redraw().await;
        assert!(state.next_frame().await.1);

        press(state, &[Button::Select]).await;
        press(state, &[Button::Select]).await;
        press(state, &[Button::Down]).await;
        press(state, &[Button::Select]).await;
        assert_eq!(screen(state).await, Screen::CalibratePump);
        state.next_frame().await;

        state.request_redraw().await;
        assert!(!state.next_frame().await.1);
    }

    #[tokio::test]
    async fn calibration_walkthrough_saves_a_corrected_duty() {
        let rig = rig_with(DoserConfig {
            calibration_duration_ms: 100,
            calibration_tick_ms: 10,
            ..DoserConfig::default()
        });
        let state = &rig.state;

        press(state, &[Button::Select]).await;
        press(state, &[Button::Select]).await;
        press(state, &[Button::Down]).await;
        press(state, &[Button::Select]).await;
        press(state, &[Button::Select]).await;
        assert_eq!(state.actuator.mode(PumpId::One), PumpMode::Calibration);

        let mut waited = 0;
        while screen(state).await != Screen::CalibrateInput && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state.dispatch_input().await;
            waited += 1;
        }
        assert_eq!(screen(state).await, Screen::CalibrateInput);
        assert_eq!(state.actuator.mode(PumpId::One), PumpMode::Off);
        assert_eq!(rig.driver.level(PumpId::One), 0);

        // 50 ml expected, 150 ml measured.
        press(state, &[Button::Up]).await;
        press(state, &[Button::Select]).await;

        assert_eq!(screen(state).await, Screen::PumpMenu);
        assert_eq!(state.actuator.duty(PumpId::One), 341);
        let saved = state.store.load_duties(1023).await.unwrap();
        assert_eq!(saved.get(PumpId::One), 341);
        assert_eq!(
            state.core.lock().await.calibration.stage(),
            CalibrationStage::Idle
        );
    }

    #[tokio::test]
    async fn calibration_on_a_busy_pump_is_rejected() {
        let rig = rig();
        let state = &rig.state;
        state.actuator.toggle_manual(PumpId::One);

        press(state, &[Button::Select]).await;
        press(state, &[Button::Select]).await;
        press(state, &[Button::Down]).await;
        press(state, &[Button::Select]).await;
        press(state, &[Button::Select]).await;

        assert_eq!(screen(state).await, Screen::CalibratePump);
        assert_eq!(
            state.core.lock().await.calibration.stage(),
            CalibrationStage::Idle
        );
        assert_eq!(state.actuator.mode(PumpId::One), PumpMode::Manual);
    }
}
