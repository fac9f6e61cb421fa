/*!
Interval scheduling for automatic backups.

The scheduler does not run anything itself; callers ask whether a run is due
and record completed runs. State survives restarts in `schedule.json`.
*/

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

/// Persisted schedule state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Fixed-interval backup schedule
#[derive(Debug)]
pub struct Scheduler {
    state_path: PathBuf,
    interval: chrono::Duration,
    state: ScheduleState,
}

impl Scheduler {
    /// Load the schedule state at `state_path`, starting fresh if absent
    pub fn new<P: AsRef<Path>>(state_path: P, interval: Duration) -> Result<Self> {
        let state_path = state_path.as_ref().to_path_buf();
        let state = if state_path.is_file() {
            serde_json::from_str(&fs::read_to_string(&state_path)?)?
        } else {
            ScheduleState::default()
        };
        let interval = chrono::Duration::from_std(interval)
            .map_err(|e| crate::VaultError::validation(format!("invalid schedule interval: {e}")))?;

        Ok(Self {
            state_path,
            interval,
            state,
        })
    }

    /// Due when never run, or once `next_run` has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state.next_run {
            None => true,
            Some(next) => now >= next,
        }
    }

    /// Record a completed run at `now` and persist the new state
    pub fn record_run(&mut self, now: DateTime<Utc>) -> Result<&ScheduleState> {
        self.state = ScheduleState {
            last_run: Some(now),
            next_run: Some(now + self.interval),
        };
        self.save()?;
        debug!("Next scheduled backup at {:?}", self.state.next_run);
        Ok(&self.state)
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    fn save(&self) -> Result<()> {
        let dir = match self.state_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &self.state)?;
        tmp.as_file_mut().flush()?;
        tmp.persist(&self.state_path).map_err(|e| e.error)?;
        Ok(())
    }
}
