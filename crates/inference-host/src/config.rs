use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::dispatcher::DispatchConfig;
use crate::model_runtime::{ServerFlavor, ServerSettings, TargetKind};
use crate::policy::PolicyConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub memory_budget_fraction: f64,
    pub reserved_baseline_fraction: f64,
    pub profile_refresh_seconds: u64,
    pub cpu_thread_cap: u32,
    pub gpu_thread_cap: u32,
    pub accelerator_thread_cap: u32,
    pub small_model_bytes: u64,
    pub small_embed_input_chars: usize,
    pub thermal_throttle_headroom: u8,
    pub runtime_host: String,
    pub runtime_base_port: u16,
    pub llama_bin: Option<PathBuf>,
    pub mlx_server_bin: Option<PathBuf>,
    pub coreml_server_bin: Option<PathBuf>,
    pub onnx_server_bin: Option<PathBuf>,
    pub torch_server_bin: Option<PathBuf>,
    pub health_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_budget_fraction: 0.60,
            reserved_baseline_fraction: 0.10,
            profile_refresh_seconds: 30,
            cpu_thread_cap: 16,
            gpu_thread_cap: 8,
            accelerator_thread_cap: 4,
            small_model_bytes: 1024 * 1024 * 1024,
            small_embed_input_chars: 512,
            thermal_throttle_headroom: 20,
            runtime_host: "127.0.0.1".to_string(),
            runtime_base_port: 8101,
            llama_bin: None,
            mlx_server_bin: None,
            coreml_server_bin: None,
            onnx_server_bin: None,
            torch_server_bin: None,
            health_timeout_seconds: 60,
            request_timeout_seconds: 600,
        }
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.into())
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}", name))
}

fn path_var(name: &str) -> Option<PathBuf> {
    env::var(name).ok().filter(|v| !v.trim().is_empty()).map(PathBuf::from)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let config = Self {
            memory_budget_fraction: parse_var("MEMORY_BUDGET_FRACTION", "0.60")?,
            reserved_baseline_fraction: parse_var("RESERVED_BASELINE_FRACTION", "0.10")?,
            profile_refresh_seconds: parse_var("PROFILE_REFRESH_SECONDS", "30")?,
            cpu_thread_cap: parse_var("CPU_THREAD_CAP", "16")?,
            gpu_thread_cap: parse_var("GPU_THREAD_CAP", "8")?,
            accelerator_thread_cap: parse_var("ACCELERATOR_THREAD_CAP", "4")?,
            small_model_bytes: parse_var("SMALL_MODEL_BYTES", "1073741824")?,
            small_embed_input_chars: parse_var("SMALL_EMBED_INPUT_CHARS", "512")?,
            thermal_throttle_headroom: parse_var("THERMAL_THROTTLE_HEADROOM", "20")?,
            runtime_host: env::var("RUNTIME_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            runtime_base_port: parse_var("RUNTIME_BASE_PORT", "8101")?,
            llama_bin: path_var("LLAMA_BIN"),
            mlx_server_bin: path_var("MLX_SERVER_BIN"),
            coreml_server_bin: path_var("COREML_SERVER_BIN"),
            onnx_server_bin: path_var("ONNX_SERVER_BIN"),
            torch_server_bin: path_var("TORCH_SERVER_BIN"),
            health_timeout_seconds: parse_var("HEALTH_TIMEOUT_SECONDS", "60")?,
            request_timeout_seconds: parse_var("REQUEST_TIMEOUT_SECONDS", "600")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects fractions outside (0, 1], a baseline at or above the budget
    /// fraction and zero thread caps.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |message: String| Err(crate::error::Error::InvalidConfig { message });
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;

        if !in_unit(self.memory_budget_fraction) {
            return invalid(format!(
                "MEMORY_BUDGET_FRACTION must be in (0, 1], got {}",
                self.memory_budget_fraction
            ));
        }
        if !in_unit(self.reserved_baseline_fraction) {
            return invalid(format!(
                "RESERVED_BASELINE_FRACTION must be in (0, 1], got {}",
                self.reserved_baseline_fraction
            ));
        }
        if self.reserved_baseline_fraction >= self.memory_budget_fraction {
            return invalid(format!(
                "RESERVED_BASELINE_FRACTION ({}) must be below MEMORY_BUDGET_FRACTION ({})",
                self.reserved_baseline_fraction, self.memory_budget_fraction
            ));
        }
        if self.runtime_base_port == 0 {
            return invalid("RUNTIME_BASE_PORT must be a fixed port, got 0".to_string());
        }
        if self.cpu_thread_cap == 0 || self.gpu_thread_cap == 0 || self.accelerator_thread_cap == 0 {
            return invalid("thread caps must be positive".to_string());
        }
        if self.thermal_throttle_headroom > 100 {
            return invalid(format!(
                "THERMAL_THROTTLE_HEADROOM is a percentage, got {}",
                self.thermal_throttle_headroom
            ));
        }
        Ok(())
    }

    pub fn budget(&self) -> PolicyConfig {
        PolicyConfig {
            budget_fraction: self.memory_budget_fraction,
            reserved_fraction: self.reserved_baseline_fraction,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            small_model_bytes: self.small_model_bytes,
            small_embed_input_chars: self.small_embed_input_chars,
            thermal_throttle_headroom: self.thermal_throttle_headroom,
        }
    }

    pub fn profile_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.profile_refresh_seconds.max(1))
    }

    /// Server settings for `flavor`; the thread cap follows its fastest target.
    pub fn server_settings(&self, flavor: ServerFlavor) -> ServerSettings {
        let fastest = flavor.targets().iter().map(|t| t.kind).max();
        let thread_cap = match fastest {
            Some(TargetKind::NeuralAccelerator) => self.accelerator_thread_cap,
            Some(TargetKind::Gpu) => self.gpu_thread_cap,
            _ => self.cpu_thread_cap,
        };
        ServerSettings {
            host: self.runtime_host.clone(),
            health_timeout: Duration::from_secs(self.health_timeout_seconds),
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            thread_cap,
        }
    }

    /// Configured binary for `flavor`, if any.
    pub fn server_binary(&self, flavor: ServerFlavor) -> Option<PathBuf> {
        match flavor {
            ServerFlavor::LlamaCpp => self.llama_bin.clone(),
            ServerFlavor::Mlx => self.mlx_server_bin.clone(),
            ServerFlavor::CoreMl => self.coreml_server_bin.clone(),
            ServerFlavor::Onnx => self.onnx_server_bin.clone(),
            ServerFlavor::Torch => self.torch_server_bin.clone(),
        }
    }

    pub fn print_config(&self) {
        info!("Configuration:");
        info!("  Memory budget: {:.0}% after {:.0}% baseline",
            self.memory_budget_fraction * 100.0, self.reserved_baseline_fraction * 100.0);
        info!("  Thread caps: cpu={} gpu={} accelerator={}",
            self.cpu_thread_cap, self.gpu_thread_cap, self.accelerator_thread_cap);
        info!("  Profile refresh: {}s", self.profile_refresh_seconds);
        info!("  Model servers: {}:{}+", self.runtime_host, self.runtime_base_port);
        info!("  Timeouts: health={}s request={}s", self.health_timeout_seconds, self.request_timeout_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            llama_bin: Some(PathBuf::from("/test/llama-server")),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.budget(), PolicyConfig::default());
        assert_eq!(config.dispatch_config().small_model_bytes, DispatchConfig::default().small_model_bytes);
    }

    #[test]
    fn test_fraction_bounds() {
        let mut config = create_test_config();
        config.memory_budget_fraction = 0.0;
        assert_eq!(config.validate().unwrap_err().code(), "invalid_config");

        config.memory_budget_fraction = 1.5;
        assert!(config.validate().is_err());

        config.memory_budget_fraction = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_baseline_must_stay_below_budget() {
        let mut config = create_test_config();
        config.reserved_baseline_fraction = 0.6;
        assert!(config.validate().is_err());
        config.reserved_baseline_fraction = 0.2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_thread_cap_rejected() {
        let mut config = create_test_config();
        config.gpu_thread_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_base_port_rejected() {
        let mut config = create_test_config();
        config.runtime_base_port = 0;
        assert_eq!(config.validate().unwrap_err().code(), "invalid_config");
    }

    #[test]
    fn test_server_settings_thread_caps() {
        let config = create_test_config();
        assert_eq!(config.server_settings(ServerFlavor::CoreMl).thread_cap, 4);
        assert_eq!(config.server_settings(ServerFlavor::LlamaCpp).thread_cap, 8);
        assert_eq!(config.server_settings(ServerFlavor::Onnx).thread_cap, 16);
        assert_eq!(config.server_settings(ServerFlavor::Torch).request_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_server_binary_lookup() {
        let config = create_test_config();
        assert_eq!(
            config.server_binary(ServerFlavor::LlamaCpp),
            Some(PathBuf::from("/test/llama-server"))
        );
        assert_eq!(config.server_binary(ServerFlavor::Mlx), None);
    }

    #[test]
    fn test_refresh_interval_never_zero() {
        let mut config = create_test_config();
        config.profile_refresh_seconds = 0;
        assert_eq!(config.profile_refresh_interval(), Duration::from_secs(1));
    }
}
