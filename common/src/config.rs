use serde::{Deserialize, Serialize};

/// Timing and bound tunables for the dosing core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoserConfig {
    pub button_poll_ms: u64,
    pub button_debounce_ms: u64,
    pub button_init_samples: u8,
    pub button_init_sample_gap_ms: u64,
    pub button_settle_ms: u64,
    pub button_error_pause_ms: u64,
    pub button_error_backoff_ms: u64,
    pub button_error_threshold: u32,
    pub input_dispatch_ms: u64,
    pub ui_inactivity_ms: u64,
    pub schedule_check_ms: u64,
    pub calibration_duration_ms: u64,
    pub calibration_reference_ml: u16,
    pub calibration_tick_ms: u64,
    pub default_duty: u16,
    pub remote_on_duration_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_payload: String,
    pub status_publish_interval_ms: u64,
    pub maintenance_interval_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub connectivity_check_ms: u64,
    pub mqtt_reconnect_delay_ms: u64,
    pub log_max_len: usize,
    pub max_payload_bytes: usize,
    pub max_duration_s: u32,
    pub max_interval_days: u16,
    pub default_duration_s: u32,
}

impl Default for DoserConfig {
    fn default() -> Self {
        Self {
            button_poll_ms: 5,
            button_debounce_ms: 15,
            button_init_samples: 10,
            button_init_sample_gap_ms: 5,
            button_settle_ms: 500,
            button_error_pause_ms: 500,
            button_error_backoff_ms: 5_000,
            button_error_threshold: 10,
            input_dispatch_ms: 20,
            ui_inactivity_ms: 120_000,
            schedule_check_ms: 10_000,
            calibration_duration_ms: 50_000,
            calibration_reference_ml: 50,
            calibration_tick_ms: 50,
            default_duty: 1023,
            remote_on_duration_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_payload: "a".to_string(),
            status_publish_interval_ms: 60_000,
            maintenance_interval_ms: 10_000,
            watchdog_timeout_ms: 30_000,
            connectivity_check_ms: 60_000,
            mqtt_reconnect_delay_ms: 10_000,
            log_max_len: 200,
            max_payload_bytes: 512,
            max_duration_s: 3_600,
            max_interval_days: 30,
            default_duration_s: 5,
        }
    }
}

impl DoserConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.button_poll_ms = self.button_poll_ms.clamp(1, 100);
        self.button_debounce_ms = self.button_debounce_ms.clamp(1, 500);
        self.button_init_samples = self.button_init_samples.clamp(1, 50);
        self.input_dispatch_ms = self.input_dispatch_ms.clamp(5, 500);
        self.ui_inactivity_ms = self.ui_inactivity_ms.max(5_000);
        self.schedule_check_ms = self.schedule_check_ms.clamp(1_000, 30_000);
        self.calibration_duration_ms = self.calibration_duration_ms.clamp(1_000, 600_000);
        if self.calibration_reference_ml == 0 {
            self.calibration_reference_ml = defaults.calibration_reference_ml;
        }
        self.calibration_tick_ms = self.calibration_tick_ms.clamp(10, 1_000);
        self.default_duty = crate::calibration::clamp_duty(u32::from(self.default_duty));
        if self.remote_on_duration_ms == 0 {
            self.remote_on_duration_ms = defaults.remote_on_duration_ms;
        }
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(1_000);
        if self.heartbeat_payload.is_empty() {
            self.heartbeat_payload = defaults.heartbeat_payload;
        }
        self.maintenance_interval_ms = self.maintenance_interval_ms.clamp(1_000, 60_000);
        // The watchdog must outlive at least two maintenance periods.
        self.watchdog_timeout_ms = self
            .watchdog_timeout_ms
            .max(self.maintenance_interval_ms.saturating_mul(2));
        self.log_max_len = self.log_max_len.clamp(32, 1_024);
        self.max_duration_s = self.max_duration_s.clamp(1, 86_400);
        self.max_interval_days = self.max_interval_days.clamp(1, 365);
        self.default_duration_s = self.default_duration_s.clamp(1, self.max_duration_s);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub keep_alive_s: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            keep_alive_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device_id: String,
    pub timezone: String,
    pub network: NetworkConfig,
    pub doser: DoserConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_id: "doser".to_string(),
            timezone: "Asia/Seoul".to_string(),
            network: NetworkConfig::default(),
            doser: DoserConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.device_id.trim().trim_matches('/');
        self.device_id = if trimmed.is_empty() || trimmed.contains(['#', '+']) {
            Self::default().device_id
        } else {
            trimmed.to_string()
        };
        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = NetworkConfig::default().mqtt_port;
        }
        self.network.keep_alive_s = self.network.keep_alive_s.clamp(5, 600);
        self.doser.sanitize();
    }
}
