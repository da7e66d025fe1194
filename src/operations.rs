//! Operations: the composition root the kiosk/CLI talks to.
//!
//! Single source of truth: configuration comes from vending_machine.yaml via
//! config_loader, the mapping from the mapping file via MappingStore.
//! Owns the HardwareLifecycle; `cleanup` shuts it down for good (drop releases it).

use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::actuator::{Actuation, Actuator, DispenseError};
use crate::calibration::{run_wizard, CalibrationError, CalibrationWizard, OperatorConsole};
use crate::config_loader::{load_machine_settings, MachineSettings};
use crate::gpio::{open_output_lines, HardwareLifecycle, OutputLines};
use crate::mapping::{MappingEntry, MappingStore, SlotMapper};
use crate::pins::{Direction, PinRegistry};

/// Effective wiring of one logical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotReport {
    pub logical_slot: u8,
    pub physical_slot: u8,
    pub invert: bool,
    /// Line driven when the caller asks for forward
    pub forward_line: u32,
    /// Line driven when the caller asks for reverse
    pub reverse_line: u32,
}

pub struct Operations {
    settings: MachineSettings,
    hardware: Arc<HardwareLifecycle>,
    actuator: Actuator,
    store: MappingStore,
}

impl Operations {
    /// Create Operations for the current hostname.
    /// Loads config from vending_machine.yaml and the mapping file it names.
    pub fn new() -> Result<Self> {
        let settings = load_machine_settings()?;
        let lines = open_output_lines(&settings);
        Self::with_lines(settings, lines)
    }

    /// Create Operations over an explicit output backend.
    pub fn with_lines(settings: MachineSettings, lines: Box<dyn OutputLines>) -> Result<Self> {
        let registry = PinRegistry::new(&settings.motor_pins)?;
        let store = MappingStore::new(settings.mapping_file.clone());
        let mapper = SlotMapper::new(&store.load(), &registry);

        let hardware = Arc::new(HardwareLifecycle::new(lines, registry.all_pins()));
        let actuator = Actuator::new(registry, mapper, Arc::clone(&hardware), settings.max_dispense_seconds);

        Ok(Self {
            settings,
            hardware,
            actuator,
            store,
        })
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn actuator(&self) -> &Actuator {
        &self.actuator
    }

    /// Claim the GPIO lines now instead of on first dispense.
    pub fn init_hardware(&self) -> Result<()> {
        self.hardware.acquire().map(|_| ())
    }

    /// Dispense from a logical slot.
    pub fn dispense(&self, logical_slot: u8, direction: Direction, seconds: f64) -> Result<Actuation, DispenseError> {
        self.actuator.dispense(logical_slot, direction, seconds)
    }

    /// Dispense and report plain success, logging the reason on failure.
    pub fn dispense_ok(&self, logical_slot: u8, direction: Direction, seconds: f64) -> bool {
        match self.dispense(logical_slot, direction, seconds) {
            Ok(done) => {
                log::info!(target: "operations", "Dispensed from slot {} ({})", done.logical_slot, done.direction);
                true
            }
            Err(e) => {
                log::warn!(target: "operations", "Dispense from slot {} failed: {}", logical_slot, e);
                false
            }
        }
    }

    /// Run the calibration wizard on `console`, save the result and start using it.
    pub fn calibrate(&self, console: &mut dyn OperatorConsole) -> Result<Vec<MappingEntry>, CalibrationError> {
        let wizard = CalibrationWizard::new(
            self.settings.logical_slots,
            self.actuator.registry(),
            self.settings.calibration_seconds,
        )?;
        let entries = run_wizard(wizard, &self.actuator, &self.store, console)?;
        self.actuator.set_mapper(SlotMapper::new(&entries, self.actuator.registry()));
        Ok(entries)
    }

    /// Forward test of every logical slot in turn.
    /// Keeps going past ordinary failures; stops at the first fatal one.
    pub fn run_all(&self, seconds: f64, pause: Duration) -> Vec<(u8, Result<Actuation, DispenseError>)> {
        let mut results = Vec::new();
        for slot in 1..=self.settings.logical_slots {
            if !results.is_empty() {
                thread::sleep(pause);
            }
            log::info!(target: "operations", "Starting motor {}", slot);
            let result = self.dispense(slot, Direction::Forward, seconds);
            let fatal = matches!(&result, Err(e) if e.is_fatal());
            results.push((slot, result));
            if fatal {
                log::error!(target: "operations", "Stopping sequential test after fatal fault on slot {}", slot);
                break;
            }
        }
        results
    }

    /// Effective resolution of every logical slot; unwired slots are omitted.
    pub fn mapping_report(&self) -> Vec<SlotReport> {
        (1..=self.settings.logical_slots)
            .filter_map(|logical| {
                let (slot, invert) = self.actuator.resolve(logical).ok()?;
                let driven = |d: Direction| slot.pin_for(if invert { d.flipped() } else { d });
                Some(SlotReport {
                    logical_slot: logical,
                    physical_slot: slot.id,
                    invert,
                    forward_line: driven(Direction::Forward),
                    reverse_line: driven(Direction::Reverse),
                })
            })
            .collect()
    }

    /// Operator acknowledgement after a failed deactivation.
    pub fn clear_fault(&self) {
        self.actuator.clear_fault();
    }

    /// Drive every motor line low and release the GPIO. Safe to call more than once.
    /// Afterwards every dispense fails with `HardwareUnavailable`.
    pub fn cleanup(&self) -> Result<()> {
        self.hardware.shutdown()
    }
}
