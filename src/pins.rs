//! Pin registry: physical slot id -> (forward line, reverse line).
//!
//! Built once from the MOTOR_PINS table in vending_machine.yaml and immutable
//! afterwards. Claiming the lines is HardwareLifecycle's job; the registry only
//! says which lines exist.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config_loader::PinPairSetting;

/// Commanded rotation at the logical level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// The opposite direction (what an inverted slot actually drives).
    pub fn flipped(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    /// Accepts "forward"/"f" and "reverse"/"r", case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "f" => Ok(Direction::Forward),
            "reverse" | "r" => Ok(Direction::Reverse),
            other => Err(anyhow!("Direction must be 'forward'/'f' or 'reverse'/'r', got '{}'", other)),
        }
    }
}

/// The two lines wired to one physical motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalSlot {
    pub id: u8,
    pub forward_pin: u32,
    pub reverse_pin: u32,
}

impl PhysicalSlot {
    pub fn pin_for(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Forward => self.forward_pin,
            Direction::Reverse => self.reverse_pin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PinRegistry {
    slots: BTreeMap<u8, PhysicalSlot>,
}

impl PinRegistry {
    /// Build and validate the registry.
    ///
    /// Rejects slot id 0 and any slot whose forward and reverse lines are the
    /// same. A line shared by two different physical slots is accepted with a
    /// warning, since some boards wire motors in parallel.
    pub fn new(table: &BTreeMap<u8, PinPairSetting>) -> Result<Self> {
        let mut slots = BTreeMap::new();
        let mut owners: BTreeMap<u32, u8> = BTreeMap::new();

        for (&id, pair) in table {
            if id == 0 {
                return Err(anyhow!("Physical slot id 0 is not allowed in MOTOR_PINS"));
            }
            if pair.forward == pair.reverse {
                return Err(anyhow!(
                    "Physical slot {} uses line {} for both forward and reverse",
                    id, pair.forward
                ));
            }

            for pin in [pair.forward, pair.reverse] {
                if let Some(other) = owners.insert(pin, id) {
                    log::warn!(target: "pins",
                        "Line {} is shared by physical slots {} and {}; assuming parallel wiring",
                        pin, other, id);
                }
            }

            slots.insert(id, PhysicalSlot {
                id,
                forward_pin: pair.forward,
                reverse_pin: pair.reverse,
            });
        }

        if slots.is_empty() {
            return Err(anyhow!("Pin registry is empty"));
        }

        log::debug!(target: "pins", "Pin registry loaded: {} physical slots, {} lines", slots.len(), owners.len());

        Ok(Self { slots })
    }

    /// Look up the line pair for a physical slot.
    pub fn lookup(&self, physical_slot: u8) -> Option<&PhysicalSlot> {
        self.slots.get(&physical_slot)
    }

    pub fn contains(&self, physical_slot: u8) -> bool {
        self.slots.contains_key(&physical_slot)
    }

    pub fn slots(&self) -> impl Iterator<Item = &PhysicalSlot> {
        self.slots.values()
    }

    /// Every distinct line in the table, ascending.
    pub fn all_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.slots
            .values()
            .flat_map(|s| [s.forward_pin, s.reverse_pin])
            .collect();
        pins.sort_unstable();
        pins.dedup();
        pins
    }
}
