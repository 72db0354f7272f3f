// src/status/table.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::types::{FragmentKey, FragmentStatus};

/// In-memory status table shared by every [`super::StatusStore`]
/// implementation.
#[derive(Debug, Default, Clone)]
pub struct StatusTable {
    fragments: HashMap<String, BTreeMap<FragmentKey, FragmentStatus>>,
    fingerprints: HashMap<String, String>,
    /// Stages reset since the store was last cleared. Outputs left on disk
    /// by such a stage are stale.
    invalidated: BTreeSet<String>,
}

impl StatusTable {
    /// Apply a status write under the transition rules.
    ///
    /// Returns `true` if the stored state changed.
    pub fn record(&mut self, stage: &str, fragment: FragmentKey, status: FragmentStatus) -> bool {
        let entries = self.fragments.entry(stage.to_string()).or_default();
        match entries.get(&fragment).copied() {
            Some(current) if current == status => false,
            Some(current) if !current.can_transition_to(status) => {
                warn!(
                    stage = %stage,
                    fragment = %fragment,
                    from = %current,
                    to = %status,
                    "ignoring illegal fragment status transition"
                );
                false
            }
            _ => {
                debug!(stage = %stage, fragment = %fragment, status = %status, "fragment status recorded");
                entries.insert(fragment, status);
                true
            }
        }
    }

    /// Store a status without transition checks (journal replay).
    pub(crate) fn set_raw(&mut self, stage: &str, fragment: FragmentKey, status: FragmentStatus) {
        self.fragments
            .entry(stage.to_string())
            .or_default()
            .insert(fragment, status);
    }

    pub fn status_of(&self, stage: &str, fragment: FragmentKey) -> Option<FragmentStatus> {
        self.fragments.get(stage)?.get(&fragment).copied()
    }

    pub fn fragments_of(&self, stage: &str) -> BTreeMap<FragmentKey, FragmentStatus> {
        self.fragments.get(stage).cloned().unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .fragments
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(name, _)| name.clone())
            .chain(self.fingerprints.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn reset_stage(&mut self, stage: &str) {
        self.fragments.remove(stage);
        self.fingerprints.remove(stage);
        self.invalidated.insert(stage.to_string());
    }

    pub fn is_invalidated(&self, stage: &str) -> bool {
        self.invalidated.contains(stage)
    }

    /// Reset stages, sorted.
    pub(crate) fn invalidated(&self) -> impl Iterator<Item = &str> {
        self.invalidated.iter().map(String::as_str)
    }

    pub fn fingerprint(&self, stage: &str) -> Option<&str> {
        self.fingerprints.get(stage).map(String::as_str)
    }

    pub fn set_fingerprint(&mut self, stage: &str, fingerprint: &str) -> bool {
        match self.fingerprints.get(stage) {
            Some(current) if current == fingerprint => false,
            _ => {
                self.fingerprints
                    .insert(stage.to_string(), fingerprint.to_string());
                true
            }
        }
    }

    /// Every `running` fragment becomes `pending`: an execution that did not
    /// survive a restart is not assumed to have completed.
    ///
    /// Returns how many fragments were demoted.
    pub fn demote_running(&mut self) -> usize {
        let mut demoted = 0;
        for entries in self.fragments.values_mut() {
            for status in entries.values_mut() {
                if *status == FragmentStatus::Running {
                    *status = FragmentStatus::Pending;
                    demoted += 1;
                }
            }
        }
        demoted
    }

    /// All fragment records, sorted by stage then fragment.
    pub(crate) fn entries(&self) -> Vec<(&str, FragmentKey, FragmentStatus)> {
        let mut stages: Vec<&String> = self.fragments.keys().collect();
        stages.sort();
        stages
            .into_iter()
            .flat_map(|stage| {
                self.fragments[stage]
                    .iter()
                    .map(move |(k, s)| (stage.as_str(), *k, *s))
            })
            .collect()
    }

    /// All fingerprints, sorted by stage.
    pub(crate) fn fingerprint_entries(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .fingerprints
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        out.sort();
        out
    }
}
