//! Key-value persistence backed by one JSON file per key.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde_json::Value;
use tokio::sync::Mutex;

use doser_common::{DutyMap, RunLog, RuntimeConfig, ScheduleStore};

pub const KEY_RUNTIME: &str = "runtime";
pub const KEY_SCHEDULES: &str = "schedules";
pub const KEY_RUN_LOG: &str = "run_log";
pub const KEY_CALIBRATION: &str = "calibration";

#[derive(Clone)]
pub struct AppStore {
    data_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Arc::new(data_dir.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("DOSER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.doser"));
        Self::new(data_dir)
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.as_ref()
    }

    fn path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.json"))
    }

    /// `Ok(None)` when nothing was ever saved under `key`.
    pub async fn load(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let value = serde_json::from_slice(&raw)
                    .with_context(|| format!("invalid JSON in {}", path.display()))?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub async fn save(&self, key: &str, value: &Value) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match self.load(KEY_RUNTIME).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        self.save(KEY_RUNTIME, &serde_json::to_value(runtime)?).await
    }

    pub async fn load_schedules(&self) -> anyhow::Result<ScheduleStore> {
        Ok(self
            .load(KEY_SCHEDULES)
            .await?
            .map(|value| ScheduleStore::from_value(&value))
            .unwrap_or_default())
    }

    pub async fn save_schedules(&self, schedules: &ScheduleStore) -> anyhow::Result<()> {
        self.save(KEY_SCHEDULES, &schedules.to_value()).await
    }

    pub async fn load_run_log(&self) -> anyhow::Result<RunLog> {
        match self.load(KEY_RUN_LOG).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(RunLog::default()),
        }
    }

    pub async fn save_run_log(&self, run_log: &RunLog) -> anyhow::Result<()> {
        self.save(KEY_RUN_LOG, &serde_json::to_value(run_log)?).await
    }

    pub async fn load_duties(&self, default_duty: u16) -> anyhow::Result<DutyMap> {
        Ok(match self.load(KEY_CALIBRATION).await? {
            Some(value) => DutyMap::from_value(&value, default_duty),
            None => DutyMap::uniform(default_duty),
        })
    }

    pub async fn save_duties(&self, duties: &DutyMap) -> anyhow::Result<()> {
        self.save(KEY_CALIBRATION, &duties.to_value()).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use doser_common::{PumpId, ScheduleEntry};

    use super::*;

    #[tokio::test]
    async fn missing_keys_load_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::new(dir.path().join("nested"));

        assert!(store.load("anything").await.unwrap().is_none());
        assert!(store.load_schedules().await.unwrap().is_empty());
        assert!(store.load_run_log().await.unwrap().is_empty());
        assert_eq!(
            store.load_duties(1023).await.unwrap(),
            DutyMap::uniform(1023)
        );
        assert_eq!(
            store.load_runtime_config().await.unwrap(),
            RuntimeConfig::default()
        );
    }

    #[tokio::test]
    async fn saved_state_reloads_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::new(dir.path().join("nested"));

        let mut schedules = ScheduleStore::default();
        schedules
            .add(PumpId::One, ScheduleEntry::new(8, 30, 5_000, 3).unwrap())
            .unwrap();
        schedules
            .add(PumpId::Two, ScheduleEntry::daily(21, 0, 1_500).unwrap())
            .unwrap();
        store.save_schedules(&schedules).await.unwrap();

        let mut run_log = RunLog::default();
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        run_log.record(PumpId::One, 8, 30, today);
        store.save_run_log(&run_log).await.unwrap();

        let mut duties = DutyMap::uniform(1023);
        duties.set(PumpId::Two, 640);
        store.save_duties(&duties).await.unwrap();

        assert_eq!(store.load_schedules().await.unwrap(), schedules);
        assert_eq!(store.load_run_log().await.unwrap(), run_log);
        assert_eq!(store.load_duties(1023).await.unwrap(), duties);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::new(dir.path());
        tokio::fs::write(dir.path().join("run_log.json"), b"{not json")
            .await
            .unwrap();

        assert!(store.load_run_log().await.is_err());
    }

    #[tokio::test]
    async fn legacy_schedule_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::new(dir.path());
        store
            .save(KEY_SCHEDULES, &json!({ "1": [[7, 15, 2000]], "2": [] }))
            .await
            .unwrap();

        let schedules = store.load_schedules().await.unwrap();
        assert_eq!(schedules.entries(PumpId::One)[0].interval_days, 1);
    }
}
