pub mod apply_field;
pub mod compose_fields;
pub mod config;
pub mod info;
pub mod invert_field;
pub mod jacobian;
pub mod register;
pub mod register_one;
pub mod template;

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use meridian_core::compute::DevicePreference;
use meridian_core::pipeline::{OrchestratorConfig, RegistrationConfig};
use tracing::debug;

#[derive(Clone, Copy, ValueEnum)]
pub enum DeviceArg {
    Auto,
    Cpu,
    Gpu,
}

impl From<DeviceArg> for DevicePreference {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Cpu => DevicePreference::Cpu,
            DeviceArg::Gpu => DevicePreference::Gpu,
        }
    }
}

/// Read an orchestrator config from TOML.
pub fn load_orchestrator_config(path: &Path) -> Result<OrchestratorConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: OrchestratorConfig =
        toml::from_str(&contents).context("Invalid registration config")?;
    debug!(path = %path.display(), "Loaded run config");
    Ok(config)
}

/// Read a per-volume registration config from TOML. Accepts either a bare
/// `RegistrationConfig` or the `[registration]` table of a full run config.
pub fn load_registration_config(path: &Path) -> Result<RegistrationConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let value: toml::Table = toml::from_str(&contents).context("Invalid registration config")?;
    let table = match value.get("registration") {
        Some(toml::Value::Table(t)) => t.clone(),
        _ => value,
    };
    let config: RegistrationConfig = toml::Value::Table(table)
        .try_into()
        .context("Invalid registration config")?;
    debug!(path = %path.display(), "Loaded registration config");
    Ok(config)
}
