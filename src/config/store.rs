use crate::config::{AppEntry, EcosystemFile, ProcessSpec};
use crate::error::{Result, WardenError};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// An entry the loader refused, with the reason
#[derive(Debug)]
pub struct RejectedEntry {
    /// App name if the entry had one, `apps[i]` otherwise
    pub label: String,
    pub error: WardenError,
}

/// Outcome of validating every entry of an ecosystem file
#[derive(Debug, Default)]
pub struct LoadReport {
    pub specs: Vec<ProcessSpec>,
    pub rejected: Vec<RejectedEntry>,
}

impl LoadReport {
    /// Validate each entry independently so one bad app does not block the rest
    pub fn from_file(file: &EcosystemFile) -> Result<Self> {
        let mut report = LoadReport::default();

        for (index, raw) in file.apps.iter().enumerate() {
            let label = raw
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("apps[{}]", index));

            let spec = AppEntry::from_value(index, raw.clone())
                .and_then(|entry| ProcessSpec::from_entry(entry, &file.base_dir));

            match spec {
                Ok(spec) if report.specs.iter().any(|s| s.name == spec.name) => {
                    report.rejected.push(RejectedEntry {
                        label,
                        error: WardenError::ConfigError(format!(
                            "duplicate app name '{}'",
                            spec.name
                        )),
                    });
                }
                Ok(spec) => report.specs.push(spec),
                Err(error) => report.rejected.push(RejectedEntry { label, error }),
            }
        }

        for rejected in &report.rejected {
            warn!("Rejected app '{}': {}", rejected.label, rejected.error);
        }

        if report.specs.is_empty() {
            let reasons: Vec<String> = report
                .rejected
                .iter()
                .map(|r| format!("{}: {}", r.label, r.error))
                .collect();
            return Err(WardenError::ConfigError(format!(
                "no valid app in configuration ({})",
                reasons.join("; ")
            )));
        }

        Ok(report)
    }
}

/// Names affected by a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl SpecDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Holds the current set of validated specs, keyed by name
#[derive(Debug, Clone, Default)]
pub struct SpecStore {
    specs: BTreeMap<String, ProcessSpec>,
}

impl SpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the store from a file; per-entry failures are returned, not fatal
    pub fn load(file: &EcosystemFile) -> Result<(Self, Vec<RejectedEntry>)> {
        let report = LoadReport::from_file(file)?;
        let store = Self::from_specs(report.specs);
        info!("Loaded {} app spec(s)", store.len());
        Ok((store, report.rejected))
    }

    pub fn from_specs(specs: impl IntoIterator<Item = ProcessSpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Replace the spec set, keeping the previous spec of any app whose new entry was rejected
    pub fn reload(&mut self, file: &EcosystemFile) -> Result<(SpecDiff, Vec<RejectedEntry>)> {
        let report = LoadReport::from_file(file)?;
        let mut next: BTreeMap<String, ProcessSpec> = report
            .specs
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        for rejected in &report.rejected {
            if let Some(previous) = self.specs.get(&rejected.label) {
                if !next.contains_key(&rejected.label) {
                    warn!(
                        "Keeping previous spec for '{}' after rejected reload entry",
                        rejected.label
                    );
                    next.insert(rejected.label.clone(), previous.clone());
                }
            }
        }

        let diff = Self::diff(&self.specs, &next);
        self.specs = next;

        info!(
            "Reloaded specs: {} added, {} removed, {} changed",
            diff.added.len(),
            diff.removed.len(),
            diff.changed.len()
        );

        Ok((diff, report.rejected))
    }

    fn diff(
        current: &BTreeMap<String, ProcessSpec>,
        next: &BTreeMap<String, ProcessSpec>,
    ) -> SpecDiff {
        let mut diff = SpecDiff::default();

        for (name, spec) in next {
            match current.get(name) {
                None => diff.added.push(name.clone()),
                Some(old) if old != spec => diff.changed.push(name.clone()),
                Some(_) => {}
            }
        }

        diff.removed = current
            .keys()
            .filter(|name| !next.contains_key(*name))
            .cloned()
            .collect();

        diff
    }

    pub fn get(&self, name: &str) -> Option<&ProcessSpec> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
