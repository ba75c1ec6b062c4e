use config::{Config, ConfigError, Environment};
use serde::Deserialize;

const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_SIM_TICK_US: u64 = 50;
const DEFAULT_TARGET_BURST_US: u64 = 2_000;
const DEFAULT_TARGET_SLEEP_US: u64 = 10_000;

/// Tracer consumer tuning
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TracerSettings {
    /// Upper bound on how long the consumer waits between ring buffer
    /// drains when no readiness notification arrives.
    pub poll_interval_ms: Option<u64>,
}

/// Policy host workload tuning
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct SimSettings {
    pub tick_us: Option<u64>,
    pub target_burst_us: Option<u64>,
    pub target_sleep_us: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub tracer: TracerSettings,
    #[serde(default)]
    pub sim: SimSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.tracer
            .poll_interval_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
    }

    pub fn sim_tick_ns(&self) -> u64 {
        self.sim.tick_us.filter(|us| *us > 0).unwrap_or(DEFAULT_SIM_TICK_US) * 1000
    }

    pub fn target_burst_ns(&self) -> u64 {
        self.sim
            .target_burst_us
            .filter(|us| *us > 0)
            .unwrap_or(DEFAULT_TARGET_BURST_US)
            * 1000
    }

    pub fn target_sleep_ns(&self) -> u64 {
        self.sim
            .target_sleep_us
            .unwrap_or(DEFAULT_TARGET_SLEEP_US)
            * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_settings() {
        unsafe {
            std::env::set_var("TRACER__POLL_INTERVAL_MS", "25");
            std::env::set_var("SIM__TICK_US", "10");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert_eq!(settings.tracer.poll_interval_ms, Some(25));
        assert_eq!(settings.poll_interval_ms(), 25);
        assert_eq!(settings.sim_tick_ns(), 10_000);

        unsafe {
            std::env::remove_var("TRACER__POLL_INTERVAL_MS");
            std::env::remove_var("SIM__TICK_US");
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.poll_interval_ms(), DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(settings.target_burst_ns(), DEFAULT_TARGET_BURST_US * 1000);
        assert_eq!(settings.target_sleep_ns(), DEFAULT_TARGET_SLEEP_US * 1000);
    }

    #[test]
    fn test_zero_values_fall_back() {
        let settings = Settings {
            tracer: TracerSettings {
                poll_interval_ms: Some(0),
            },
            sim: SimSettings {
                tick_us: Some(0),
                target_burst_us: Some(0),
                target_sleep_us: Some(0),
            },
            ..Default::default()
        };
        assert_eq!(settings.poll_interval_ms(), DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(settings.sim_tick_ns(), DEFAULT_SIM_TICK_US * 1000);
        assert_eq!(settings.target_burst_ns(), DEFAULT_TARGET_BURST_US * 1000);
        // A zero sleep is a valid always-runnable target.
        assert_eq!(settings.target_sleep_ns(), 0);
    }
}
