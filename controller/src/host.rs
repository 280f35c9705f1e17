use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rumqttc::AsyncClient;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use doser_common::{DoseTopics, DutyMap, PumpId, RunLog, RuntimeConfig, ScheduleStore};

use crate::{
    app::{AppState, Core},
    clock::monotonic_ms,
    connectivity::{LinkMonitor, RetryPolicy},
    display::{ConsoleDisplay, Display, Frame},
    input::{spawn_console_buttons, InputPoller, VirtualPins},
    mqtt::{mqtt_options, spawn_mqtt_loop, Telemetry},
    pump::{PumpActuator, PumpEvent, SimulatedPumps},
    remote_log::{spawn_forwarder, RemoteLogLayer},
    signals::Signals,
    store::AppStore,
    watchdog::{StallMonitor, Watchdog},
};

const MQTT_QUEUE_CAPACITY: usize = 64;

pub async fn run() -> anyhow::Result<()> {
    let (remote_log, log_rx) = RemoteLogLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(remote_log)
        .init();

    let store = AppStore::from_env();
    info!("data directory {}", store.data_dir().display());
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    if let Err(err) = store.save_runtime_config(&runtime).await {
        warn!("failed to write runtime config: {err:#}");
    }
    apply_env_overrides(&mut runtime);
    runtime.sanitize();
    let headless = env_flag("DOSER_HEADLESS");

    let schedules = store.load_schedules().await.unwrap_or_else(|err| {
        warn!("failed to load schedules from store: {err:#}");
        ScheduleStore::default()
    });
    let run_log = store.load_run_log().await.unwrap_or_else(|err| {
        warn!("failed to load run log from store: {err:#}");
        RunLog::default()
    });
    let duties = store
        .load_duties(runtime.doser.default_duty)
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load calibration from store: {err:#}");
            DutyMap::uniform(runtime.doser.default_duty)
        });
    info!(
        "loaded {} + {} schedule entries, duty P1={} P2={}",
        schedules.len(PumpId::One),
        schedules.len(PumpId::Two),
        duties.get(PumpId::One),
        duties.get(PumpId::Two),
    );

    let topics = DoseTopics::new(&runtime.device_id);
    let (client, eventloop) =
        AsyncClient::new(mqtt_options(&runtime, &topics), MQTT_QUEUE_CAPACITY);
    let telemetry = Telemetry::new(client, topics, &runtime.doser.heartbeat_payload);

    let (pump_events, pump_event_rx) = mpsc::unbounded_channel();
    let driver = Arc::new(SimulatedPumps::default());
    let actuator = PumpActuator::new(driver.clone(), duties, pump_events);
    let signals = Signals::default();

    let core = Core::new(&runtime.doser, schedules, run_log, duties, monotonic_ms());
    let app_state = AppState {
        core: Arc::new(Mutex::new(core)),
        actuator,
        signals: signals.clone(),
        store,
        telemetry: telemetry.clone(),
        link: Arc::new(Mutex::new(LinkMonitor::new(RetryPolicy::default()))),
        config: Arc::new(runtime),
    };
    let doser = &app_state.config.doser;

    let pins = VirtualPins::default();
    let _poller = InputPoller::spawn(pins.clone(), signals, doser)
        .context("failed to start button poller")?;
    let hold = Duration::from_millis(doser.button_debounce_ms * 4 + doser.button_poll_ms * 2);
    spawn_console_buttons(pins, hold).context("failed to start console buttons")?;

    let (watchdog, _watchdog_thread) =
        StallMonitor::spawn(Duration::from_millis(doser.watchdog_timeout_ms))
            .context("failed to start stall monitor")?;

    spawn_forwarder(log_rx, telemetry, doser.log_max_len);
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_pump_event_loop(app_state.clone(), pump_event_rx);
    spawn_input_loop(app_state.clone());
    spawn_schedule_loop(app_state.clone());
    if headless {
        warn!("display disabled; running headless");
    } else {
        spawn_display_loop(app_state.clone(), ConsoleDisplay::default());
    }
    spawn_heartbeat_loop(app_state.clone());
    spawn_status_publish_loop(app_state.clone());
    spawn_maintenance_loop(app_state.clone(), watchdog.clone(), driver);
    spawn_connectivity_monitor(app_state.clone());

    info!("doser {} running", app_state.config.device_id);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut feed = tokio::time::interval(Duration::from_millis(doser.maintenance_interval_ms));
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    error!("failed to listen for shutdown signal: {err}");
                }
                break;
            }
            _ = feed.tick() => watchdog.feed(),
        }
    }

    info!("shutting down");
    watchdog.stop();
    app_state.actuator.shutdown();
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Ok(device_id) = std::env::var("DOSER_DEVICE_ID") {
        runtime.device_id = device_id;
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn spawn_pump_event_loop(app_state: AppState, mut events: mpsc::UnboundedReceiver<PumpEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            app_state.on_pump_event(event).await;
        }
    });
}

fn spawn_input_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.config.doser.input_dispatch_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            app_state.dispatch_input().await;
        }
    });
}

fn spawn_schedule_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.config.doser.schedule_check_ms);
        let mut interval = tokio::time::interval(period);
        let mut warned_unsynced = false;
        loop {
            interval.tick().await;
            let now = app_state.local_now();
            if now.is_none() && !warned_unsynced {
                warn!("wall clock not synced; schedules are paused");
            }
            warned_unsynced = now.is_none();
            app_state.evaluate_schedules_at(now).await;
        }
    });
}

fn spawn_display_loop<D: Display + 'static>(app_state: AppState, mut display: D) {
    tokio::spawn(async move {
        let mut last = Frame::default();
        loop {
            let (frame, full, interval_ms) = app_state.next_frame().await;
            if full || frame != last {
                if let Err(err) = display.render(&frame, full) {
                    warn!("display render failed: {err:#}");
                }
                last = frame;
            }
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    });
}

fn spawn_heartbeat_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.config.doser.heartbeat_interval_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            app_state.telemetry.heartbeat();
        }
    });
}

fn spawn_status_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.config.doser.status_publish_interval_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            app_state.publish_all().await;
        }
    });
}

fn spawn_maintenance_loop(app_state: AppState, watchdog: StallMonitor, driver: Arc<SimulatedPumps>) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.config.doser.maintenance_interval_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            watchdog.feed();
            let link_up = app_state.link.lock().await.is_connected();
            debug!(
                "maintenance: uptime {}s, link {}, output P1={} P2={}",
                monotonic_ms() / 1_000,
                if link_up { "up" } else { "down" },
                driver.level(PumpId::One),
                driver.level(PumpId::Two),
            );
        }
    });
}

fn spawn_connectivity_monitor(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.config.doser.connectivity_check_ms);
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let (report, escalated) = {
                let link = app_state.link.lock().await;
                (link.report(), link.escalated())
            };
            if escalated {
                error!("connectivity: {report}");
            } else {
                info!("connectivity: {report}");
            }
        }
    });
}
