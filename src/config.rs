use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub logging: LoggingConfig,
    pub input: InputConfig,
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    /// Явный список путей evdev; пустой список = автопоиск в /dev/input
    #[serde(default)]
    pub devices: Vec<String>,
    /// Подстроки имён устройств, которые никогда не считаются клавиатурами
    #[serde(default)]
    pub exclude_names: Vec<String>,
    /// Количество клавиатур в режиме сухого запуска
    pub simulated_keyboards: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    pub poll_timeout_ms: u64,
    pub max_devices: usize,
    /// Приоритет SCHED_FIFO для потока сборщика, 0 = не менять
    pub realtime_priority: u8,
}

impl LoggingConfig {
    /// Директива для EnvFilter: общий уровень плюс уточняющий фильтр
    pub fn directive(&self) -> String {
        if self.filter.trim().is_empty() {
            self.level.clone()
        } else {
            format!("{},{}", self.level, self.filter)
        }
    }
}

impl CollectorConfig {
    pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
    pub const DEFAULT_MAX_DEVICES: usize = 64;
    pub const DEFAULT_REALTIME_PRIORITY: u8 = 10;
    pub const MAX_REALTIME_PRIORITY: u8 = 99;

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: Self::DEFAULT_POLL_TIMEOUT_MS,
            max_devices: Self::DEFAULT_MAX_DEVICES,
            realtime_priority: Self::DEFAULT_REALTIME_PRIORITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
                filter: "kbqueue=info".to_string(),
            },
            input: InputConfig {
                devices: Vec::new(),
                exclude_names: vec![
                    "mouse".to_string(),
                    "touchpad".to_string(),
                    "trackpoint".to_string(),
                ],
                simulated_keyboards: 2,
            },
            collector: CollectorConfig::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("KBQ_").split("__"));

        let config: Config = figment
            .extract()
            .with_context(|| format!("Не удалось загрузить конфигурацию из {:?}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Валидация настроек логирования
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Неверный уровень логирования: {}", self.logging.level),
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            _ => anyhow::bail!("Неверный формат логирования: {}", self.logging.format),
        }

        // Валидация сборщика
        if self.collector.poll_timeout_ms == 0 {
            anyhow::bail!("poll_timeout_ms должно быть больше 0");
        }

        if self.collector.poll_timeout_ms > 1000 {
            anyhow::bail!("poll_timeout_ms должно быть не больше 1000");
        }

        if self.collector.max_devices == 0 {
            anyhow::bail!("max_devices должно быть больше 0");
        }

        if self.collector.realtime_priority > CollectorConfig::MAX_REALTIME_PRIORITY {
            anyhow::bail!(
                "realtime_priority должно быть не больше {}",
                CollectorConfig::MAX_REALTIME_PRIORITY
            );
        }

        for (i, path) in self.input.devices.iter().enumerate() {
            if path.trim().is_empty() {
                anyhow::bail!("Пустой путь устройства в input.devices #{}", i + 1);
            }
        }

        Ok(())
    }

    pub fn is_excluded_name(&self, device_name: &str) -> bool {
        let lower = device_name.to_lowercase();
        self.input
            .exclude_names
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }
}
