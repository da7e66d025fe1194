//! Operator-assisted calibration of the logical -> physical slot mapping.
//!
//! For each logical slot, ascending:
//! wait for the operator, run that slot's motor forward with identity wiring,
//! ask which physical slot moved (0 = none), and if one did, ask whether it
//! turned forward. Every slot gets an entry; "none" degrades to identity.
//!
//! `CalibrationWizard` is the pure protocol. `OperatorConsole` is the
//! transport. `run_wizard` drives both against the Actuator and saves the
//! result through MappingStore.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use thiserror::Error;

use crate::actuator::{Actuator, DispenseError};
use crate::mapping::{MappingEntry, MappingStore};
use crate::pins::{Direction, PinRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    AwaitOperatorReady { logical: u8 },
    ActuateTest { logical: u8 },
    AwaitPhysicalId { logical: u8 },
    AwaitDirectionConfirm { logical: u8, physical: u8 },
    Finished,
}

/// Question put to the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Ready { logical: u8, seconds: f64 },
    PhysicalId { logical: u8, highest: u8 },
    DirectionMatched { logical: u8, physical: u8 },
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Ready { logical, seconds } => write!(
                f, "Slot {}: press Enter to run its motor forward for {}s and watch which slot moves", logical, seconds
            ),
            Prompt::PhysicalId { logical, highest } => write!(
                f, "Slot {}: which physical slot moved? Enter 1-{}, or 0 if nothing moved", logical, highest
            ),
            Prompt::DirectionMatched { physical, .. } => write!(
                f, "Did physical slot {} turn forward (dispensing direction)? [y/n]", physical
            ),
        }
    }
}

/// What the driver of the wizard has to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum WizardAction {
    Ask(Prompt),
    Actuate { logical: u8, seconds: f64 },
    Finished,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidAnswer {
    #[error("'{0}' is not a slot number")]
    NotANumber(String),
    #[error("Physical slot {0} does not exist")]
    UnknownPhysical(u8),
    #[error("Please answer y or n")]
    NotYesNo,
    #[error("No answer expected right now")]
    Unexpected,
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Logical slot {logical} has no wired motor to test")]
    UnwiredSlot { logical: u8 },

    #[error("Operator input closed during slot {logical}; nothing was saved")]
    InputClosed { logical: u8 },

    #[error("Console I/O failed: {0}")]
    Console(#[from] io::Error),

    #[error("Test actuation of slot {logical} failed: {source}")]
    Actuation { logical: u8, source: DispenseError },

    #[error("Failed to save mapping to {path:?}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct CalibrationWizard {
    pending: VecDeque<u8>,
    known_physical: BTreeSet<u8>,
    observation_seconds: f64,
    step: CalibrationStep,
    entries: Vec<MappingEntry>,
}

impl CalibrationWizard {
    /// Wizard over logical slots 1..=logical_slots.
    /// Each logical slot must also be a physical slot, since the test run uses identity wiring.
    pub fn new(logical_slots: u8, registry: &PinRegistry, observation_seconds: f64) -> Result<Self, CalibrationError> {
        let known_physical: BTreeSet<u8> = registry.slots().map(|s| s.id).collect();
        let mut pending: VecDeque<u8> = (1..=logical_slots).collect();

        if let Some(&logical) = pending.iter().find(|&&l| !known_physical.contains(&l)) {
            return Err(CalibrationError::UnwiredSlot { logical });
        }

        let step = match pending.pop_front() {
            Some(logical) => CalibrationStep::AwaitOperatorReady { logical },
            None => CalibrationStep::Finished,
        };

        Ok(Self {
            pending,
            known_physical,
            observation_seconds,
            step,
            entries: Vec::new(),
        })
    }

    pub fn step(&self) -> CalibrationStep {
        self.step
    }

    pub fn is_finished(&self) -> bool {
        self.step == CalibrationStep::Finished
    }

    /// Entries emitted so far, ascending by logical slot.
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<MappingEntry> {
        self.entries
    }

    pub fn next_action(&self) -> WizardAction {
        match self.step {
            CalibrationStep::AwaitOperatorReady { logical } => WizardAction::Ask(Prompt::Ready {
                logical,
                seconds: self.observation_seconds,
            }),
            CalibrationStep::ActuateTest { logical } => WizardAction::Actuate {
                logical,
                seconds: self.observation_seconds,
            },
            CalibrationStep::AwaitPhysicalId { logical } => WizardAction::Ask(Prompt::PhysicalId {
                logical,
                highest: self.known_physical.iter().next_back().copied().unwrap_or(0),
            }),
            CalibrationStep::AwaitDirectionConfirm { logical, physical } => {
                WizardAction::Ask(Prompt::DirectionMatched { logical, physical })
            }
            CalibrationStep::Finished => WizardAction::Finished,
        }
    }

    /// The test actuation for the current slot has run.
    pub fn actuated(&mut self) {
        if let CalibrationStep::ActuateTest { logical } = self.step {
            self.step = CalibrationStep::AwaitPhysicalId { logical };
        }
    }

    /// Feed an operator answer. Returns the entry when one is emitted.
    /// An invalid answer leaves the wizard where it was.
    pub fn answer(&mut self, input: &str) -> Result<Option<MappingEntry>, InvalidAnswer> {
        let input = input.trim();
        match self.step {
            CalibrationStep::AwaitOperatorReady { logical } => {
                self.step = CalibrationStep::ActuateTest { logical };
                Ok(None)
            }
            CalibrationStep::AwaitPhysicalId { logical } => {
                if input == "0" || input.eq_ignore_ascii_case("none") {
                    return Ok(Some(self.emit(MappingEntry::identity(logical))));
                }
                let physical: u8 = input.parse()
                    .map_err(|_| InvalidAnswer::NotANumber(input.to_string()))?;
                if !self.known_physical.contains(&physical) {
                    return Err(InvalidAnswer::UnknownPhysical(physical));
                }
                self.step = CalibrationStep::AwaitDirectionConfirm { logical, physical };
                Ok(None)
            }
            CalibrationStep::AwaitDirectionConfirm { logical, physical } => {
                let matched = match input.to_ascii_lowercase().as_str() {
                    "y" | "yes" => true,
                    "n" | "no" => false,
                    _ => return Err(InvalidAnswer::NotYesNo),
                };
                Ok(Some(self.emit(MappingEntry { logical_slot: logical, physical_slot: physical, invert: !matched })))
            }
            CalibrationStep::ActuateTest { .. } | CalibrationStep::Finished => Err(InvalidAnswer::Unexpected),
        }
    }

    fn emit(&mut self, entry: MappingEntry) -> MappingEntry {
        log::info!(target: "calibration", "Slot {} -> physical {} (invert={})",
                   entry.logical_slot, entry.physical_slot, entry.invert);
        self.entries.push(entry);
        self.step = match self.pending.pop_front() {
            Some(logical) => CalibrationStep::AwaitOperatorReady { logical },
            None => CalibrationStep::Finished,
        };
        entry
    }
}

/// Where operator questions go and answers come from.
pub trait OperatorConsole {
    /// Ask and wait for one line. `None` means input is closed.
    fn ask(&mut self, prompt: &Prompt) -> io::Result<Option<String>>;
    fn tell(&mut self, message: &str) -> io::Result<()>;
}

/// Line-oriented console over any reader/writer pair (stdin/stdout in the CLI).
pub struct StdioConsole<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> StdioConsole<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> OperatorConsole for StdioConsole<R, W> {
    fn ask(&mut self, prompt: &Prompt) -> io::Result<Option<String>> {
        write!(self.output, "{}: ", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()))
    }

    fn tell(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.output, "{}", message)
    }
}

/// Run the wizard to completion and persist the mapping.
/// Any abort leaves the existing mapping file untouched.
pub fn run_wizard(
    mut wizard: CalibrationWizard,
    actuator: &Actuator,
    store: &MappingStore,
    console: &mut dyn OperatorConsole,
) -> Result<Vec<MappingEntry>, CalibrationError> {
    loop {
        match wizard.next_action() {
            WizardAction::Ask(prompt) => {
                let logical = match prompt {
                    Prompt::Ready { logical, .. }
                    | Prompt::PhysicalId { logical, .. }
                    | Prompt::DirectionMatched { logical, .. } => logical,
                };
                let reply = console.ask(&prompt)?
                    .ok_or(CalibrationError::InputClosed { logical })?;
                if let Err(e) = wizard.answer(&reply) {
                    console.tell(&e.to_string())?;
                }
            }
            WizardAction::Actuate { logical, seconds } => {
                console.tell(&format!("Running slot {} forward...", logical))?;
                actuator
                    .actuate_physical(logical, Direction::Forward, seconds)
                    .map_err(|source| CalibrationError::Actuation { logical, source })?;
                wizard.actuated();
            }
            WizardAction::Finished => break,
        }
    }

    let entries = wizard.into_entries();
    store.save(&entries).map_err(|e| CalibrationError::Persist {
        path: store.path().to_path_buf(),
        reason: format!("{:#}", e),
    })?;
    console.tell(&format!("Calibration complete: {} slots saved to {}", entries.len(), store.path().display()))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_loader::PinPairSetting;
    use crate::gpio::testing::Probe;
    use crate::gpio::{HardwareLifecycle, Level};
    use crate::mapping::SlotMapper;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn registry() -> PinRegistry {
        let table: BTreeMap<u8, PinPairSetting> = (1..=9u8)
            .map(|id| (id, PinPairSetting { forward: id as u32 * 10, reverse: id as u32 * 10 + 1 }))
            .collect();
        PinRegistry::new(&table).unwrap()
    }

    /// Feeds canned answers; records every prompt.
    struct ScriptedConsole {
        answers: VecDeque<String>,
        prompts: Vec<Prompt>,
        told: Vec<String>,
    }

    impl ScriptedConsole {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: answers.iter().map(|a| a.to_string()).collect(),
                prompts: Vec::new(),
                told: Vec::new(),
            }
        }
    }

    impl OperatorConsole for ScriptedConsole {
        fn ask(&mut self, prompt: &Prompt) -> io::Result<Option<String>> {
            self.prompts.push(prompt.clone());
            Ok(self.answers.pop_front())
        }

        fn tell(&mut self, message: &str) -> io::Result<()> {
            self.told.push(message.to_string());
            Ok(())
        }
    }

    /// Drive the pure wizard with answers for one slot.
    fn run_slot(wizard: &mut CalibrationWizard, answers: &[&str]) -> Option<MappingEntry> {
        let mut emitted = None;
        wizard.answer("").unwrap();
        wizard.actuated();
        for a in answers {
            emitted = wizard.answer(a).unwrap();
        }
        emitted
    }

    #[test]
    fn test_state_sequence_for_one_slot() {
        let mut wizard = CalibrationWizard::new(2, &registry(), 10.0).unwrap();
        assert_eq!(wizard.step(), CalibrationStep::AwaitOperatorReady { logical: 1 });
        wizard.answer("").unwrap();
        assert_eq!(wizard.next_action(), WizardAction::Actuate { logical: 1, seconds: 10.0 });
        wizard.actuated();
        assert_eq!(wizard.step(), CalibrationStep::AwaitPhysicalId { logical: 1 });
        wizard.answer("3").unwrap();
        assert_eq!(wizard.step(), CalibrationStep::AwaitDirectionConfirm { logical: 1, physical: 3 });
        let entry = wizard.answer("y").unwrap();
        assert_eq!(entry, Some(MappingEntry { logical_slot: 1, physical_slot: 3, invert: false }));
        assert_eq!(wizard.step(), CalibrationStep::AwaitOperatorReady { logical: 2 });
    }

    #[test]
    fn test_none_observed_gives_identity() {
        let mut wizard = CalibrationWizard::new(9, &registry(), 10.0).unwrap();
        for _ in 1..5 {
            run_slot(&mut wizard, &["0"]);
        }
        let entry = run_slot(&mut wizard, &["0"]).unwrap();
        assert_eq!(entry, MappingEntry { logical_slot: 5, physical_slot: 5, invert: false });
    }

    #[test]
    fn test_direction_mismatch_sets_invert() {
        let mut wizard = CalibrationWizard::new(9, &registry(), 10.0).unwrap();
        run_slot(&mut wizard, &["1", "y"]);
        let entry = run_slot(&mut wizard, &["7", "no"]).unwrap();
        assert_eq!(entry, MappingEntry { logical_slot: 2, physical_slot: 7, invert: true });
    }

    #[test]
    fn test_invalid_answers_keep_state() {
        let mut wizard = CalibrationWizard::new(1, &registry(), 10.0).unwrap();
        assert_eq!(wizard.answer("x"), Ok(None));
        assert_eq!(wizard.answer("1"), Err(InvalidAnswer::Unexpected));
        wizard.actuated();

        assert_eq!(wizard.answer("abc"), Err(InvalidAnswer::NotANumber("abc".into())));
        assert_eq!(wizard.answer("12"), Err(InvalidAnswer::UnknownPhysical(12)));
        assert_eq!(wizard.step(), CalibrationStep::AwaitPhysicalId { logical: 1 });

        wizard.answer("4").unwrap();
        assert_eq!(wizard.answer("maybe"), Err(InvalidAnswer::NotYesNo));
        assert!(wizard.answer("N").unwrap().is_some());
        assert!(wizard.is_finished());
        assert_eq!(wizard.answer(""), Err(InvalidAnswer::Unexpected));
    }

    #[test]
    fn test_every_slot_gets_an_entry() {
        let mut wizard = CalibrationWizard::new(9, &registry(), 10.0).unwrap();
        while !wizard.is_finished() {
            run_slot(&mut wizard, &["none"]);
        }
        let entries = wizard.into_entries();
        assert_eq!(entries.len(), 9);
        assert!(entries.iter().enumerate().all(|(i, e)| *e == MappingEntry::identity(i as u8 + 1)));
    }

    #[test]
    fn test_unwired_logical_slot_rejected() {
        let table: BTreeMap<u8, PinPairSetting> = [(1, PinPairSetting { forward: 1, reverse: 2 })].into_iter().collect();
        let registry = PinRegistry::new(&table).unwrap();
        assert!(matches!(
            CalibrationWizard::new(2, &registry, 1.0),
            Err(CalibrationError::UnwiredSlot { logical: 2 })
        ));
    }

    fn actuator(probe: &Probe) -> Actuator {
        let registry = registry();
        let hardware = Arc::new(HardwareLifecycle::new(probe.lines(), registry.all_pins()));
        Actuator::new(registry, SlotMapper::default(), hardware, 30.0)
    }

    #[test]
    fn test_run_wizard_actuates_forward_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::new(dir.path().join("motor_mapping.json"));
        let probe = Probe::default();
        let actuator = actuator(&probe);

        let wizard = CalibrationWizard::new(3, actuator.registry(), 0.01).unwrap();
        let mut console = ScriptedConsole::new(&["", "2", "n", "", "oops", "0", "", "1", "y"]);

        let entries = run_wizard(wizard, &actuator, &store, &mut console).unwrap();
        assert_eq!(entries, vec![
            MappingEntry { logical_slot: 1, physical_slot: 2, invert: true },
            MappingEntry::identity(2),
            MappingEntry { logical_slot: 3, physical_slot: 1, invert: false },
        ]);
        assert_eq!(store.load(), entries);

        // Test runs use identity wiring, forward lines only
        let highs: Vec<u32> = probe.write_log().into_iter()
            .filter(|(_, level)| *level == Level::High)
            .map(|(pin, _)| pin)
            .collect();
        assert_eq!(highs, vec![10, 20, 30]);
        assert!(console.told.iter().any(|m| m.contains("not a slot number")));
    }

    #[test]
    fn test_closed_input_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::new(dir.path().join("motor_mapping.json"));
        let probe = Probe::default();
        let actuator = actuator(&probe);

        let wizard = CalibrationWizard::new(3, actuator.registry(), 0.01).unwrap();
        let mut console = ScriptedConsole::new(&["", "0", ""]);

        let err = run_wizard(wizard, &actuator, &store, &mut console).unwrap_err();
        assert!(matches!(err, CalibrationError::InputClosed { logical: 2 }));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_actuation_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::new(dir.path().join("motor_mapping.json"));
        let probe = Probe::default();
        probe.fail_claim();
        let actuator = actuator(&probe);

        let wizard = CalibrationWizard::new(2, actuator.registry(), 0.01).unwrap();
        let mut console = ScriptedConsole::new(&[""]);

        let err = run_wizard(wizard, &actuator, &store, &mut console).unwrap_err();
        assert!(matches!(err, CalibrationError::Actuation { logical: 1, source: DispenseError::HardwareUnavailable { .. } }));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_stdio_console_reads_lines() {
        let input = io::Cursor::new(b"7\r\n".to_vec());
        let mut output = Vec::new();
        {
            let mut console = StdioConsole::new(input, &mut output);
            let reply = console.ask(&Prompt::PhysicalId { logical: 2, highest: 9 }).unwrap();
            assert_eq!(reply.as_deref(), Some("7"));
            assert_eq!(console.ask(&Prompt::PhysicalId { logical: 2, highest: 9 }).unwrap(), None);
        }
        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("which physical slot moved"));
    }
}
