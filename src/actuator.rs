//! Actuator: resolves a logical slot to a motor line and pulses it.
//!
//! One actuation at a time. The HardwareHandle is held for the whole pulse, so
//! a concurrent `dispense` waits behind the one in flight. The energized line
//! is wrapped in a guard that drives it Low on every exit path, including a
//! panic unwinding through the hold.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::gpio::{HardwareHandle, HardwareLifecycle, Level};
use crate::mapping::SlotMapper;
use crate::pins::{Direction, PhysicalSlot, PinRegistry};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispenseError {
    #[error("Unknown slot {slot}")]
    UnknownSlot { slot: u8 },

    #[error("Invalid duration {seconds}s (must be greater than 0 and at most {max}s)")]
    InvalidDuration { seconds: f64, max: f64 },

    #[error("GPIO hardware unavailable: {reason}")]
    HardwareUnavailable { reason: String },

    #[error("Hardware fault on line {pin}: {reason}")]
    HardwareFault { pin: u32, reason: String },

    /// Line could not be forced Low. The motor may still be energized.
    #[error("Line {pin} could not be driven low, motor may be energized: {reason}")]
    DeactivationFailed { pin: u32, reason: String },

    #[error("Actuation halted after line {pin} failed to deactivate; operator must clear the fault")]
    Halted { pin: u32 },
}

impl DispenseError {
    /// True when further automated actuation must stop until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispenseError::DeactivationFailed { .. } | DispenseError::Halted { .. })
    }
}

/// What a successful actuation actually did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Actuation {
    pub logical_slot: u8,
    pub physical_slot: u8,
    /// Direction requested by the caller
    pub direction: Direction,
    /// Direction driven on the physical motor after inversion
    pub driven: Direction,
    pub pin: u32,
    pub duration: Duration,
}

/// Line driven High; forced back Low on drop unless `deenergize` already ran.
/// If the forced Low fails the line is latched as faulted.
struct EnergizedLine<'h, 'a> {
    handle: &'h mut HardwareHandle<'a>,
    fault: &'h Mutex<Option<u32>>,
    pin: u32,
    armed: bool,
}

impl EnergizedLine<'_, '_> {
    fn deenergize(mut self) -> anyhow::Result<()> {
        self.armed = false;
        self.handle.write(self.pin, Level::Low)
    }
}

impl Drop for EnergizedLine<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.handle.write(self.pin, Level::Low) {
            Ok(()) => log::warn!(target: "actuator", "Line {} forced low after interrupted actuation", self.pin),
            Err(e) => {
                latch(self.fault, self.pin, e);
            }
        }
    }
}

/// Record `pin` as stuck; every later actuation is refused until `clear_fault`.
fn latch(fault: &Mutex<Option<u32>>, pin: u32, err: anyhow::Error) -> DispenseError {
    log::error!(target: "actuator", "Line {} could not be driven low: {:#}. Halting actuation.", pin, err);
    *fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(pin);
    DispenseError::DeactivationFailed { pin, reason: format!("{:#}", err) }
}

pub struct Actuator {
    registry: PinRegistry,
    mapper: RwLock<SlotMapper>,
    hardware: Arc<HardwareLifecycle>,
    max_seconds: f64,
    // Line that failed to deactivate; blocks actuation until cleared
    fault: Mutex<Option<u32>>,
}

impl Actuator {
    pub fn new(registry: PinRegistry, mapper: SlotMapper, hardware: Arc<HardwareLifecycle>, max_seconds: f64) -> Self {
        Self {
            registry,
            mapper: RwLock::new(mapper),
            hardware,
            max_seconds,
            fault: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &PinRegistry {
        &self.registry
    }

    pub fn max_seconds(&self) -> f64 {
        self.max_seconds
    }

    /// Replace the active mapping (after calibration).
    pub fn set_mapper(&self, mapper: SlotMapper) {
        *self.mapper.write().unwrap_or_else(PoisonError::into_inner) = mapper;
    }

    /// Resolve a logical slot through the mapping: (physical slot, invert).
    pub fn resolve(&self, logical_slot: u8) -> Result<(PhysicalSlot, bool), DispenseError> {
        let (physical, invert) = self.mapper
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(logical_slot);
        let slot = self.registry
            .lookup(physical)
            .copied()
            .ok_or(DispenseError::UnknownSlot { slot: logical_slot })?;
        Ok((slot, invert))
    }

    /// Check a requested duration against (0, max_seconds].
    pub fn validate_duration(&self, seconds: f64) -> Result<Duration, DispenseError> {
        let invalid = DispenseError::InvalidDuration { seconds, max: self.max_seconds };
        if !seconds.is_finite() || seconds <= 0.0 || seconds > self.max_seconds {
            return Err(invalid);
        }
        Duration::try_from_secs_f64(seconds).map_err(|_| invalid)
    }

    /// Latched fault line, if any.
    pub fn fault(&self) -> Option<u32> {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Operator acknowledgement that the stuck line has been dealt with.
    pub fn clear_fault(&self) {
        let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pin) = fault.take() {
            log::warn!(target: "actuator", "Fault on line {} cleared by operator", pin);
        }
    }

    /// Dispense from a logical slot: resolve mapping, apply inversion, pulse the line.
    pub fn dispense(&self, logical_slot: u8, direction: Direction, seconds: f64) -> Result<Actuation, DispenseError> {
        let (slot, invert) = self.resolve(logical_slot)?;
        let duration = self.validate_duration(seconds)?;
        let driven = if invert { direction.flipped() } else { direction };
        self.pulse(logical_slot, &slot, direction, driven, duration)
    }

    /// Pulse a physical slot directly, bypassing the mapping (identity, no inversion).
    /// Used by calibration.
    pub fn actuate_physical(&self, physical_slot: u8, direction: Direction, seconds: f64) -> Result<Actuation, DispenseError> {
        let slot = self.registry
            .lookup(physical_slot)
            .copied()
            .ok_or(DispenseError::UnknownSlot { slot: physical_slot })?;
        let duration = self.validate_duration(seconds)?;
        self.pulse(physical_slot, &slot, direction, direction, duration)
    }

    fn pulse(
        &self,
        logical_slot: u8,
        slot: &PhysicalSlot,
        direction: Direction,
        driven: Direction,
        duration: Duration,
    ) -> Result<Actuation, DispenseError> {
        if let Some(pin) = self.fault() {
            return Err(DispenseError::Halted { pin });
        }

        let mut handle = self.hardware
            .acquire()
            .map_err(|e| DispenseError::HardwareUnavailable { reason: format!("{:#}", e) })?;

        // Re-check under the handle: a fault may have latched while we waited
        if let Some(pin) = self.fault() {
            return Err(DispenseError::Halted { pin });
        }

        let pin = slot.pin_for(driven);
        log::info!(target: "actuator", "Dispense: logical {} -> physical {} {} (driving {} on line {}) for {:.2}s",
                   logical_slot, slot.id, direction, driven, pin, duration.as_secs_f64());

        // A previous ungraceful exit may have left the line High
        if let Err(e) = handle.write(pin, Level::Low) {
            return Err(latch(&self.fault, pin, e));
        }

        let line = EnergizedLine { handle: &mut handle, fault: &self.fault, pin, armed: true };
        if let Err(e) = line.handle.write(pin, Level::High) {
            log::error!(target: "actuator", "Failed to energize line {}: {:#}", pin, e);
            return match line.deenergize() {
                Ok(()) => Err(DispenseError::HardwareFault { pin, reason: format!("{:#}", e) }),
                Err(e) => Err(latch(&self.fault, pin, e)),
            };
        }

        thread::sleep(duration);

        line.deenergize().map_err(|e| latch(&self.fault, pin, e))?;

        Ok(Actuation {
            logical_slot,
            physical_slot: slot.id,
            direction,
            driven,
            pin,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_loader::PinPairSetting;
    use crate::gpio::testing::Probe;
    use crate::mapping::MappingEntry;
    use std::collections::BTreeMap;
    use std::panic::{self, AssertUnwindSafe};

    // Physical slot n: forward line 10n, reverse line 10n + 1
    fn registry() -> PinRegistry {
        let table: BTreeMap<u8, PinPairSetting> = (1..=9u8)
            .map(|id| (id, PinPairSetting { forward: id as u32 * 10, reverse: id as u32 * 10 + 1 }))
            .collect();
        PinRegistry::new(&table).unwrap()
    }

    fn actuator_with(entries: &[MappingEntry]) -> (Actuator, Probe) {
        let probe = Probe::default();
        let registry = registry();
        let hardware = Arc::new(HardwareLifecycle::new(probe.lines(), registry.all_pins()));
        let mapper = SlotMapper::new(entries, &registry);
        (Actuator::new(registry, mapper, hardware, 30.0), probe)
    }

    #[test]
    fn test_identity_fallback_drives_forward_pin() {
        let (actuator, probe) = actuator_with(&[]);
        let done = actuator.dispense(3, Direction::Forward, 0.01).unwrap();
        assert_eq!(done.pin, 30);
        assert_eq!(done.physical_slot, 3);
        assert_eq!(probe.write_log(), vec![(30, Level::Low), (30, Level::High), (30, Level::Low)]);
        assert_eq!(probe.level(30), Some(Level::Low));
    }

    #[test]
    fn test_inverted_mapping_swaps_lines() {
        let (actuator, probe) = actuator_with(&[MappingEntry { logical_slot: 2, physical_slot: 7, invert: true }]);

        let fwd = actuator.dispense(2, Direction::Forward, 0.01).unwrap();
        assert_eq!(fwd.pin, 71);
        assert_eq!(fwd.driven, Direction::Reverse);

        let rev = actuator.dispense(2, Direction::Reverse, 0.01).unwrap();
        assert_eq!(rev.pin, 70);

        assert!(probe.write_log().iter().all(|(pin, _)| *pin == 70 || *pin == 71));
    }

    #[test]
    fn test_unknown_slot_touches_nothing() {
        let (actuator, probe) = actuator_with(&[]);
        assert_eq!(
            actuator.dispense(99, Direction::Forward, 1.0).unwrap_err(),
            DispenseError::UnknownSlot { slot: 99 }
        );
        assert_eq!(actuator.dispense(0, Direction::Forward, 1.0).unwrap_err(), DispenseError::UnknownSlot { slot: 0 });
        assert!(probe.writes().is_empty());
        assert_eq!(probe.claims(), 0);
    }

    #[test]
    fn test_duration_bounds() {
        let (actuator, probe) = actuator_with(&[]);
        for seconds in [-1.0, 0.0, 10000.0, f64::NAN, f64::INFINITY] {
            let err = actuator.dispense(1, Direction::Forward, seconds).unwrap_err();
            assert!(matches!(err, DispenseError::InvalidDuration { .. }), "{} accepted", seconds);
        }
        assert!(probe.writes().is_empty());
        assert!(actuator.validate_duration(30.0).is_ok());
    }

    #[test]
    fn test_hold_lasts_requested_duration() {
        let (actuator, probe) = actuator_with(&[]);
        actuator.dispense(1, Direction::Forward, 0.05).unwrap();
        let writes = probe.writes();
        let held = writes[2].at.duration_since(writes[1].at);
        assert!(held >= Duration::from_millis(50), "held only {:?}", held);
    }

    #[test]
    fn test_claim_failure_is_hardware_unavailable() {
        let (actuator, probe) = actuator_with(&[]);
        probe.fail_claim();
        let err = actuator.dispense(1, Direction::Forward, 0.01).unwrap_err();
        assert!(matches!(err, DispenseError::HardwareUnavailable { .. }));
        assert!(probe.writes().is_empty());

        probe.clear_failures();
        assert!(actuator.dispense(1, Direction::Forward, 0.01).is_ok());
    }

    #[test]
    fn test_energize_failure_is_fault_and_line_ends_low() {
        let (actuator, probe) = actuator_with(&[]);
        probe.fail_write(40, Level::High);
        let err = actuator.dispense(4, Direction::Forward, 0.01).unwrap_err();
        assert!(matches!(err, DispenseError::HardwareFault { pin: 40, .. }));
        assert!(!err.is_fatal());
        assert_eq!(probe.level(40), Some(Level::Low));
        assert_eq!(probe.write_log().last(), Some(&(40, Level::Low)));
        assert_eq!(actuator.fault(), None);
    }

    #[test]
    fn test_failed_deactivation_latches_until_cleared() {
        let (actuator, probe) = actuator_with(&[]);
        probe.fail_write(50, Level::Low);

        let err = actuator.dispense(5, Direction::Forward, 0.01).unwrap_err();
        assert!(matches!(err, DispenseError::DeactivationFailed { pin: 50, .. }));
        assert!(err.is_fatal());

        probe.clear_failures();
        let writes_before = probe.writes().len();
        assert_eq!(actuator.dispense(1, Direction::Forward, 0.01).unwrap_err(), DispenseError::Halted { pin: 50 });
        assert_eq!(probe.writes().len(), writes_before);

        actuator.clear_fault();
        assert!(actuator.dispense(1, Direction::Forward, 0.01).is_ok());
    }

    #[test]
    fn test_panic_during_actuation_leaves_line_low() {
        let (actuator, probe) = actuator_with(&[]);
        probe.panic_after_write(60, Level::High);

        let result = panic::catch_unwind(AssertUnwindSafe(|| actuator.dispense(6, Direction::Forward, 0.01)));
        assert!(result.is_err());
        assert_eq!(probe.level(60), Some(Level::Low));

        // Handle is usable again after the unwind
        probe.clear_failures();
        assert!(actuator.dispense(6, Direction::Forward, 0.01).is_ok());
    }

    #[test]
    fn test_unwind_with_stuck_line_latches_fault() {
        let (actuator, probe) = actuator_with(&[]);
        probe.panic_after_write(60, Level::High);
        probe.stick_after_panic(60);

        let result = panic::catch_unwind(AssertUnwindSafe(|| actuator.dispense(6, Direction::Forward, 0.01)));
        assert!(result.is_err());
        assert_eq!(probe.level(60), Some(Level::High));
        assert_eq!(actuator.fault(), Some(60));

        let before = probe.writes().len();
        assert_eq!(actuator.dispense(1, Direction::Forward, 0.01), Err(DispenseError::Halted { pin: 60 }));
        assert_eq!(probe.writes().len(), before);
    }

    #[test]
    fn test_concurrent_dispense_is_serialized() {
        let (actuator, probe) = actuator_with(&[]);
        let actuator = Arc::new(actuator);

        let workers: Vec<_> = [1u8, 2]
            .into_iter()
            .map(|slot| {
                let actuator = Arc::clone(&actuator);
                thread::spawn(move || actuator.dispense(slot, Direction::Forward, 0.03))
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap().is_ok());
        }

        let log = probe.write_log();
        assert_eq!(log.len(), 6);
        // Each actuation's Low/High/Low triple is contiguous
        assert!(log[..3].iter().all(|(pin, _)| *pin == log[0].0));
        assert!(log[3..].iter().all(|(pin, _)| *pin == log[3].0));
        assert_ne!(log[0].0, log[3].0);
    }

    #[test]
    fn test_actuate_physical_ignores_mapping() {
        let (actuator, _probe) = actuator_with(&[MappingEntry { logical_slot: 2, physical_slot: 7, invert: true }]);
        let done = actuator.actuate_physical(2, Direction::Forward, 0.01).unwrap();
        assert_eq!(done.pin, 20);
        assert_eq!(done.driven, Direction::Forward);
    }

    #[test]
    fn test_set_mapper_takes_effect() {
        let (actuator, _probe) = actuator_with(&[]);
        let mapper = SlotMapper::new(&[MappingEntry { logical_slot: 1, physical_slot: 9, invert: false }], actuator.registry());
        actuator.set_mapper(mapper);
        assert_eq!(actuator.dispense(1, Direction::Forward, 0.01).unwrap().pin, 90);
    }
}
