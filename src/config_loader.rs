//! Configuration loader for the vending machine motor subsystem.
//!
//! Single source of truth: all machine configuration comes from
//! vending_machine.yaml (next to Cargo.toml, or the path in VENDING_CONFIG).
//! Host blocks are looked up by hostname under the known OS sections.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use gethostname::gethostname;
use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONSUMER: &str = "vending-motors";
pub const DEFAULT_MAPPING_FILE: &str = "motor_mapping.json";
pub const DEFAULT_MAX_DISPENSE_SECONDS: f64 = 30.0;
pub const DEFAULT_CALIBRATION_SECONDS: f64 = 10.0;
pub const DEFAULT_LOGICAL_SLOTS: u8 = 9;

const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

/// Forward/reverse line offsets for one physical slot, as written in MOTOR_PINS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinPairSetting {
    pub forward: u32,
    pub reverse: u32,
}

/// Everything the motor subsystem needs for one host.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub hostname: String,
    pub gpio_enabled: bool,
    pub gpio_chip: Option<String>,
    pub gpio_consumer: String,
    pub motor_pins: BTreeMap<u8, PinPairSetting>,
    pub mapping_file: PathBuf,
    pub max_dispense_seconds: f64,
    pub calibration_seconds: f64,
    pub logical_slots: u8,
}

/// Resolve the path of vending_machine.yaml.
/// VENDING_CONFIG (environment or .env) wins over the crate directory default.
pub fn config_path() -> PathBuf {
    let _ = dotenv();
    match env::var("VENDING_CONFIG") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("vending_machine.yaml"),
    }
}

/// Load machine settings for the current hostname.
/// Fails loudly if the file or the host entry is missing.
pub fn load_machine_settings() -> Result<MachineSettings> {
    let hostname = gethostname().to_string_lossy().to_string();
    load_machine_settings_from(&config_path(), &hostname)
}

/// Load machine settings for `hostname` from an explicit YAML file.
pub fn load_machine_settings_from(yaml_path: &Path, hostname: &str) -> Result<MachineSettings> {
    let file = File::open(yaml_path)
        .map_err(|e| anyhow!("Missing required vending_machine.yaml at {:?}: {}", yaml_path, e))?;
    let yaml: serde_yaml::Value = serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse {:?}", yaml_path))?;

    let base_dir = yaml_path.parent().unwrap_or_else(|| Path::new("."));
    let settings = parse_host_settings(&yaml, hostname, base_dir)?;

    log::info!(target: "config_loader", "MachineSettings: host={}, gpio_enabled={}, slots={}, mapping={:?}",
               settings.hostname, settings.gpio_enabled, settings.motor_pins.len(), settings.mapping_file);

    Ok(settings)
}

/// Search across known OS sections to find a host block matching hostname.
fn find_host_block<'a>(yaml: &'a serde_yaml::Value, hostname: &str) -> Option<&'a serde_yaml::Mapping> {
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    return v.as_mapping();
                }
            }
        }
    }
    None
}

/// Build MachineSettings from a parsed YAML document.
/// Relative MAPPING_FILE paths are resolved against `base_dir`.
pub fn parse_host_settings(yaml: &serde_yaml::Value, hostname: &str, base_dir: &Path) -> Result<MachineSettings> {
    let host_block = find_host_block(yaml, hostname)
        .ok_or_else(|| anyhow!("No host entry for '{}' in vending_machine.yaml", hostname))?;

    let key = |name: &str| host_block.get(&serde_yaml::Value::from(name));

    let gpio_enabled = key("GPIO_ENABLED")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let gpio_chip = key("GPIO_CHIP")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Fail-fast: a real board needs to know which chip to open
    if gpio_enabled && gpio_chip.is_none() {
        return Err(anyhow!("GPIO_ENABLED is true but GPIO_CHIP is missing for '{}' in vending_machine.yaml", hostname));
    }

    let gpio_consumer = key("GPIO_CONSUMER")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_CONSUMER)
        .to_string();

    let pins_map = key("MOTOR_PINS")
        .and_then(|v| v.as_mapping())
        .ok_or_else(|| anyhow!("MOTOR_PINS missing for '{}' in vending_machine.yaml", hostname))?;
    let motor_pins = parse_motor_pins(pins_map, hostname)?;

    let mapping_file = key("MAPPING_FILE")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_MAPPING_FILE);
    let mapping_file = {
        let p = PathBuf::from(mapping_file);
        if p.is_absolute() { p } else { base_dir.join(p) }
    };

    let max_dispense_seconds = positive_seconds(key("MAX_DISPENSE_SECONDS"), DEFAULT_MAX_DISPENSE_SECONDS)
        .ok_or_else(|| anyhow!("MAX_DISPENSE_SECONDS must be a positive number for '{}'", hostname))?;

    let calibration_seconds = positive_seconds(key("CALIBRATION_SECONDS"), DEFAULT_CALIBRATION_SECONDS)
        .ok_or_else(|| anyhow!("CALIBRATION_SECONDS must be a positive number for '{}'", hostname))?;

    if calibration_seconds > max_dispense_seconds {
        return Err(anyhow!(
            "CALIBRATION_SECONDS ({}) exceeds MAX_DISPENSE_SECONDS ({}) for '{}'",
            calibration_seconds, max_dispense_seconds, hostname
        ));
    }

    let logical_slots = match key("LOGICAL_SLOTS") {
        None => DEFAULT_LOGICAL_SLOTS,
        Some(v) => v.as_u64()
            .filter(|n| (1..=u8::MAX as u64).contains(n))
            .map(|n| n as u8)
            .ok_or_else(|| anyhow!("LOGICAL_SLOTS must be an integer in 1..=255 for '{}'", hostname))?,
    };

    Ok(MachineSettings {
        hostname: hostname.to_string(),
        gpio_enabled,
        gpio_chip,
        gpio_consumer,
        motor_pins,
        mapping_file,
        max_dispense_seconds,
        calibration_seconds,
        logical_slots,
    })
}

fn positive_seconds(value: Option<&serde_yaml::Value>, default: f64) -> Option<f64> {
    match value {
        None => Some(default),
        Some(v) => v.as_f64().filter(|s| s.is_finite() && *s > 0.0),
    }
}

/// Parse MOTOR_PINS: `slot: {FORWARD: n, REVERSE: m}`.
/// Structural problems only; pin-pair invariants are checked by PinRegistry.
fn parse_motor_pins(pins_map: &serde_yaml::Mapping, hostname: &str) -> Result<BTreeMap<u8, PinPairSetting>> {
    let mut motor_pins = BTreeMap::new();

    for (k, v) in pins_map.iter() {
        let slot = k.as_u64()
            .or_else(|| k.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|n| (1..=u8::MAX as u64).contains(n))
            .map(|n| n as u8)
            .ok_or_else(|| anyhow!("Invalid physical slot id {:?} in MOTOR_PINS for '{}'", k, hostname))?;

        let pair = v.as_mapping()
            .ok_or_else(|| anyhow!("MOTOR_PINS[{}] must be a mapping with FORWARD and REVERSE for '{}'", slot, hostname))?;

        let line = |name: &str| -> Result<u32> {
            pair.get(&serde_yaml::Value::from(name))
                .and_then(|v| v.as_u64())
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| anyhow!("MOTOR_PINS[{}].{} missing or invalid for '{}'", slot, name, hostname))
        };

        let setting = PinPairSetting {
            forward: line("FORWARD")?,
            reverse: line("REVERSE")?,
        };

        if motor_pins.insert(slot, setting).is_some() {
            return Err(anyhow!("Physical slot {} listed twice in MOTOR_PINS for '{}'", slot, hostname));
        }
    }

    if motor_pins.is_empty() {
        return Err(anyhow!("MOTOR_PINS is empty for '{}' in vending_machine.yaml", hostname));
    }

    Ok(motor_pins)
}
