use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Identifier of one field of view in the dataset.
pub type FovId = u32;

/// Unit of work for one stage: a single FOV, or the whole dataset for
/// stages that are not FOV-partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FragmentKey {
    Fov(FovId),
    Whole,
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentKey::Fov(id) => write!(f, "fov:{id}"),
            FragmentKey::Whole => f.write_str("whole"),
        }
    }
}

impl FromStr for FragmentKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "whole" {
            return Ok(FragmentKey::Whole);
        }
        s.strip_prefix("fov:")
            .and_then(|id| id.parse::<FovId>().ok())
            .map(FragmentKey::Fov)
            .ok_or_else(|| format!("invalid fragment key: {s} (expected \"fov:<id>\" or \"whole\")"))
    }
}

/// Durable state of one `(stage, fragment)` pair.
///
/// Advances `pending -> running -> complete | failed`; the only backwards
/// moves are `failed -> pending` (retry) and `running -> pending` (an
/// execution that did not survive a restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl FragmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FragmentStatus::Pending => "pending",
            FragmentStatus::Running => "running",
            FragmentStatus::Complete => "complete",
            FragmentStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: FragmentStatus) -> bool {
        use FragmentStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Complete, _) => false,
            (Pending, Running) | (Pending, Complete) | (Pending, Failed) => true,
            (Running, Complete) | (Running, Failed) | (Running, Pending) => true,
            (Failed, Pending) | (Failed, Running) | (Failed, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FragmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(FragmentStatus::Pending),
            "running" => Ok(FragmentStatus::Running),
            "complete" => Ok(FragmentStatus::Complete),
            "failed" => Ok(FragmentStatus::Failed),
            other => Err(format!("invalid fragment status: {other}")),
        }
    }
}

/// Where fragment status records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatusStorageMode {
    /// Append-only journal under the status directory (`.fovdag/status`).
    #[default]
    File,
    /// Memory only (lost on exit; `resume` has nothing to resume from).
    Memory,
}
