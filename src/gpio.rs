//! GPIO ownership for the motor lines.
//!
//! Supports libgpiod (character device, `gpiod` feature) and a simulated
//! backend for hosts with GPIO_ENABLED false. All pin writes go through a
//! HardwareHandle borrowed from the process-wide HardwareLifecycle.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config_loader::MachineSettings;

#[cfg(feature = "gpiod")]
use gpiocdev::line::Value;
#[cfg(feature = "gpiod")]
use gpiocdev::request::Request;

/// Electrical level of an output line. High energizes the motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Backend that actually drives output lines.
pub trait OutputLines: Send {
    /// Configure `pins` as outputs, initially Low. Must be idempotent.
    fn claim(&mut self, pins: &[u32]) -> Result<()>;
    fn write(&mut self, pin: u32, level: Level) -> Result<()>;
    /// Give the lines back to the kernel.
    fn free(&mut self);
}

/// Pick the backend for this host: libgpiod when GPIO_ENABLED, simulated otherwise.
pub fn open_output_lines(settings: &MachineSettings) -> Box<dyn OutputLines> {
    if !settings.gpio_enabled {
        log::info!(target: "gpio", "GPIO disabled for '{}', using simulated output lines", settings.hostname);
        return Box::new(SimulatedLines::default());
    }

    let chip = settings.gpio_chip.clone().unwrap_or_default();
    hardware_lines(chip, settings.gpio_consumer.clone())
}

#[cfg(feature = "gpiod")]
fn hardware_lines(chip: String, consumer: String) -> Box<dyn OutputLines> {
    Box::new(CdevLines::new(chip, consumer))
}

#[cfg(not(feature = "gpiod"))]
fn hardware_lines(chip: String, _consumer: String) -> Box<dyn OutputLines> {
    Box::new(UnavailableLines { chip })
}

/// libgpiod character-device lines, requested together as one output request.
#[cfg(feature = "gpiod")]
pub struct CdevLines {
    chip: String,
    consumer: String,
    request: Option<Request>,
}

#[cfg(feature = "gpiod")]
impl CdevLines {
    pub fn new(chip: String, consumer: String) -> Self {
        Self { chip, consumer, request: None }
    }
}

#[cfg(feature = "gpiod")]
impl OutputLines for CdevLines {
    fn claim(&mut self, pins: &[u32]) -> Result<()> {
        if self.request.is_some() {
            return Ok(());
        }
        let request = Request::builder()
            .on_chip(&self.chip)
            .with_consumer(&self.consumer)
            .with_lines(pins)
            .as_output(Value::Inactive)
            .request()
            .map_err(|e| anyhow!("Failed to request lines {:?} on {}: {}", pins, self.chip, e))?;
        self.request = Some(request);
        Ok(())
    }

    fn write(&mut self, pin: u32, level: Level) -> Result<()> {
        let request = self.request.as_ref()
            .ok_or_else(|| anyhow!("Line {} written before lines were claimed", pin))?;
        let value = match level {
            Level::Low => Value::Inactive,
            Level::High => Value::Active,
        };
        request.set_value(pin, value)
            .map_err(|e| anyhow!("Failed to set line {} {:?}: {}", pin, level, e))?;
        Ok(())
    }

    fn free(&mut self) {
        // Lines are released when the request is dropped
        self.request = None;
    }
}

/// Stand-in for hosts with GPIO_ENABLED but no libgpiod support compiled in.
#[cfg(not(feature = "gpiod"))]
struct UnavailableLines {
    chip: String,
}

#[cfg(not(feature = "gpiod"))]
impl OutputLines for UnavailableLines {
    fn claim(&mut self, _pins: &[u32]) -> Result<()> {
        Err(anyhow!("GPIO support not compiled in (chip {}). Enable 'gpiod' feature.", self.chip))
    }

    fn write(&mut self, pin: u32, _level: Level) -> Result<()> {
        Err(anyhow!("GPIO support not compiled in, cannot write line {}", pin))
    }

    fn free(&mut self) {}
}

/// Dry-run backend: tracks levels in memory and logs every write.
#[derive(Debug, Default)]
pub struct SimulatedLines {
    levels: BTreeMap<u32, Level>,
}

impl SimulatedLines {
    pub fn level(&self, pin: u32) -> Option<Level> {
        self.levels.get(&pin).copied()
    }
}

impl OutputLines for SimulatedLines {
    fn claim(&mut self, pins: &[u32]) -> Result<()> {
        for &pin in pins {
            self.levels.entry(pin).or_insert(Level::Low);
        }
        log::debug!(target: "gpio", "[simulated] claimed lines {:?}", pins);
        Ok(())
    }

    fn write(&mut self, pin: u32, level: Level) -> Result<()> {
        let slot = self.levels.get_mut(&pin)
            .ok_or_else(|| anyhow!("Line {} was never claimed", pin))?;
        *slot = level;
        log::info!(target: "gpio", "[simulated] line {} -> {:?}", pin, level);
        Ok(())
    }

    fn free(&mut self) {
        self.levels.clear();
        log::debug!(target: "gpio", "[simulated] lines freed");
    }
}

struct Lifecycle {
    lines: Box<dyn OutputLines>,
    acquired: bool,
    shut_down: bool,
}

/// Process-wide owner of the motor lines.
///
/// `acquire` claims every registry line (Low) on first use and hands out a
/// HardwareHandle; only one handle exists at a time, so a second caller waits
/// until the first actuation is finished. `release` drives every line Low and
/// frees them. Both are safe to call repeatedly. `shutdown` is a final
/// release: after it every `acquire` fails.
pub struct HardwareLifecycle {
    pins: Vec<u32>,
    inner: Mutex<Lifecycle>,
}

impl HardwareLifecycle {
    pub fn new(lines: Box<dyn OutputLines>, pins: Vec<u32>) -> Self {
        Self {
            pins,
            inner: Mutex::new(Lifecycle { lines, acquired: false, shut_down: false }),
        }
    }

    // A panic mid-actuation poisons the lock; we still need the lines to force them Low.
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the lines if needed and return exclusive write access.
    pub fn acquire(&self) -> Result<HardwareHandle<'_>> {
        let mut guard = self.lock();
        if guard.shut_down {
            return Err(anyhow!("GPIO has been shut down"));
        }
        if !guard.acquired {
            guard.lines.claim(&self.pins)?;
            guard.acquired = true;
            log::info!(target: "gpio", "GPIO acquired: {} motor lines claimed", self.pins.len());
        }
        Ok(HardwareHandle { guard })
    }

    pub fn is_acquired(&self) -> bool {
        self.lock().acquired
    }

    /// Drive every owned line Low, then free them. No-op if not acquired.
    /// The lines are freed even if some writes fail; failures are reported in the error.
    pub fn release(&self) -> Result<()> {
        let mut guard = self.lock();
        self.release_locked(&mut guard)
    }

    /// Release and refuse any further `acquire`. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.lock();
        if !guard.shut_down {
            guard.shut_down = true;
            log::info!(target: "gpio", "GPIO shutting down");
        }
        self.release_locked(&mut guard)
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    fn release_locked(&self, guard: &mut Lifecycle) -> Result<()> {
        if !guard.acquired {
            return Ok(());
        }

        let mut stuck = Vec::new();
        for &pin in &self.pins {
            if let Err(e) = guard.lines.write(pin, Level::Low) {
                log::error!(target: "gpio", "Failed to drive line {} low during release: {:#}", pin, e);
                stuck.push(pin);
            }
        }

        guard.lines.free();
        guard.acquired = false;

        if stuck.is_empty() {
            log::info!(target: "gpio", "GPIO resources released.");
            Ok(())
        } else {
            Err(anyhow!("GPIO released but lines {:?} could not be driven low", stuck))
        }
    }
}

impl Drop for HardwareLifecycle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!(target: "gpio", "{:#}", e);
        }
    }
}

/// Exclusive write access to the claimed lines, held for one actuation.
pub struct HardwareHandle<'a> {
    guard: MutexGuard<'a, Lifecycle>,
}

impl HardwareHandle<'_> {
    pub fn write(&mut self, pin: u32, level: Level) -> Result<()> {
        self.guard.lines.write(pin, level)
    }
}
