use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::error::StoreError;
use crate::profit_chain::ProfitChainState;
use crate::reentry::ReEntryContext;
use crate::risk_manager::RiskState;
use crate::router::TrendBook;
use crate::types::PositionGroup;

/// Everything needed to resume in-flight lifecycles after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub saved_at: DateTime<Utc>,
    pub risk: RiskState,
    /// Active groups only; closed ones have already been booked.
    pub groups: Vec<PositionGroup>,
    pub chains: Vec<ProfitChainState>,
    pub reentries: Vec<ReEntryContext>,
    #[serde(default)]
    pub trends: HashMap<String, TrendBook>,
}

/// JSON file holding the latest snapshot.
pub struct StateStore {
    path: PathBuf,
    writing: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into(), writing: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<EngineSnapshot>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }

    /// Writes to a sibling temp file and renames it over the old snapshot,
    /// so a crash mid-write leaves the previous snapshot intact. Writers
    /// each get their own temp file and take turns on the rename.
    pub fn save(&self, snapshot: &EngineSnapshot) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(snapshot)?;
        let _writing = self.writing.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = std::fs::write(&tmp, body).and_then(|_| std::fs::rename(&tmp, &self.path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        log::debug!(
            "State saved: {} groups, {} chains, {} re-entry contexts",
            snapshot.groups.len(), snapshot.chains.len(), snapshot.reentries.len()
        );
        Ok(())
    }
}
