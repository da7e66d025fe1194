//! Logical -> physical slot mapping and its persisted JSON form.
//!
//! File format (keyed by logical slot as a string):
//!
//! ```json
//! { "2": { "physical": 7, "invert": true } }
//! ```
//!
//! Missing slots resolve to themselves with `invert = false`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::pins::PinRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub logical_slot: u8,
    pub physical_slot: u8,
    pub invert: bool,
}

impl MappingEntry {
    pub fn identity(logical_slot: u8) -> Self {
        Self { logical_slot, physical_slot: logical_slot, invert: false }
    }
}

/// On-disk record for one logical slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct MappingRecord {
    physical: u8,
    invert: bool,
}

/// Resolves logical slots to (physical slot, invert).
#[derive(Debug, Clone, Default)]
pub struct SlotMapper {
    entries: BTreeMap<u8, MappingEntry>,
}

impl SlotMapper {
    /// Build a mapper from loaded entries.
    /// Entries pointing at a physical slot the registry doesn't know are dropped
    /// (that logical slot falls back to identity).
    pub fn new(entries: &[MappingEntry], registry: &PinRegistry) -> Self {
        let mut map = BTreeMap::new();
        for entry in entries {
            if !registry.contains(entry.physical_slot) {
                log::warn!(target: "mapping",
                    "Ignoring mapping {} -> {}: physical slot not in pin registry",
                    entry.logical_slot, entry.physical_slot);
                continue;
            }
            map.insert(entry.logical_slot, *entry);
        }
        Self { entries: map }
    }

    /// Resolve a logical slot. Unmapped slots map to themselves, not inverted.
    pub fn resolve(&self, logical_slot: u8) -> (u8, bool) {
        match self.entries.get(&logical_slot) {
            Some(e) => (e.physical_slot, e.invert),
            None => (logical_slot, false),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }
}

/// Reads and writes the mapping file.
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
}

impl MappingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load entries sorted by logical slot.
    /// A missing or unreadable file yields an empty set; the mapper then uses identity.
    pub fn load(&self) -> Vec<MappingEntry> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(target: "mapping", "No mapping file at {:?}, using identity mapping", self.path);
                return Vec::new();
            }
            Err(e) => {
                log::warn!(target: "mapping", "Could not read mapping file {:?}: {}. Using identity mapping", self.path, e);
                return Vec::new();
            }
        };

        match parse_mapping(&text) {
            Ok(entries) => {
                log::info!(target: "mapping", "Loaded {} mapping entries from {:?}", entries.len(), self.path);
                entries
            }
            Err(e) => {
                log::warn!(target: "mapping", "Corrupt mapping file {:?}: {:#}. Using identity mapping", self.path, e);
                Vec::new()
            }
        }
    }

    /// Atomically replace the mapping file with `entries`.
    /// Written to a sibling temp file, synced, then renamed over the target.
    pub fn save(&self, entries: &[MappingEntry]) -> Result<()> {
        let records: BTreeMap<String, MappingRecord> = entries.iter()
            .map(|e| (e.logical_slot.to_string(), MappingRecord { physical: e.physical_slot, invert: e.invert }))
            .collect();
        let json = serde_json::to_string_pretty(&records)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create mapping directory {:?}", dir))?;
        }

        let mut tmp_name = self.path.file_name()
            .ok_or_else(|| anyhow!("Mapping path {:?} has no file name", self.path))?
            .to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        let written = write_synced(&tmp_path, json.as_bytes()).and_then(|()| {
            fs::rename(&tmp_path, &self.path)
                .with_context(|| format!("Failed to move {:?} into place at {:?}", tmp_path, self.path))
        });
        if let Err(e) = written {
            if let Err(rm) = fs::remove_file(&tmp_path) {
                log::debug!(target: "mapping", "Could not remove {:?}: {}", tmp_path, rm);
            }
            return Err(e);
        }

        log::info!(target: "mapping", "Saved {} mapping entries to {:?}", records.len(), self.path);
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    file.write_all(bytes)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

/// Parse the JSON mapping document. Keys that aren't slot numbers are skipped with a warning.
fn parse_mapping(text: &str) -> Result<Vec<MappingEntry>> {
    let records: BTreeMap<String, MappingRecord> = serde_json::from_str(text)?;
    let mut entries = Vec::with_capacity(records.len());

    for (key, record) in records {
        match key.trim().parse::<u8>() {
            Ok(logical) if logical > 0 => entries.push(MappingEntry {
                logical_slot: logical,
                physical_slot: record.physical,
                invert: record.invert,
            }),
            _ => log::warn!(target: "mapping", "Skipping mapping key '{}': not a logical slot number", key),
        }
    }

    entries.sort_by_key(|e| e.logical_slot);
    entries.dedup_by_key(|e| e.logical_slot);
    Ok(entries)
}
