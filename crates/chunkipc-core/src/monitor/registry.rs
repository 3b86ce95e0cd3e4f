//! Registered processes and active databases

use super::interface::ProcessKind;
use crate::owner_id::OwnerId;
use crate::segment::segment_name_to_database_name;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// One registered process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub kind: ProcessKind,
    pub segment_name: Option<String>,
}

impl ProcessEntry {
    pub fn database_name(&self) -> Option<&str> {
        self.segment_name.as_deref().and_then(segment_name_to_database_name)
    }
}

/// Processes keyed by owner id, plus the set of active database names
#[derive(Debug)]
pub struct Registry {
    processes: HashMap<OwnerId, ProcessEntry>,
    next_owner: u64,
    active_databases: BTreeSet<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
            next_owner: OwnerId::FIRST_ISSUED,
            active_databases: BTreeSet::new(),
        }
    }

    fn issue_owner(&mut self) -> OwnerId {
        loop {
            let owner = OwnerId::new(self.next_owner);
            self.next_owner += 1;
            if !self.processes.contains_key(&owner) {
                return owner;
            }
        }
    }

    /// Register a process. A database must name a segment whose database
    /// is not active yet.
    pub fn register(&mut self, pid: u32, kind: ProcessKind, segment_name: Option<String>) -> Result<OwnerId> {
        let entry = ProcessEntry { pid, kind, segment_name };
        if kind == ProcessKind::Database {
            let Some(database) = entry.database_name() else {
                warn!(pid, segment = ?entry.segment_name, "database registration without a valid segment name");
                return Err(Error::RegistrationRefused(format!(
                    "invalid segment name {:?}",
                    entry.segment_name
                )));
            };
            if self.active_databases.contains(database) {
                warn!(pid, database, "database already active");
                return Err(Error::RegistrationRefused(format!("database {} already active", database)));
            }
            self.active_databases.insert(database.to_string());
        }
        let owner = self.issue_owner();
        self.processes.insert(owner, entry);
        Ok(owner)
    }

    /// Remove a gracefully exiting process. Owner id and pid must match.
    pub fn unregister(&mut self, owner: OwnerId, pid: u32) -> Result<ProcessEntry> {
        match self.processes.get(&owner.without_clean_up()) {
            Some(entry) if entry.pid == pid => {}
            Some(entry) => {
                warn!(%owner, pid, registered_pid = entry.pid, "unregistration pid mismatch");
                return Err(Error::RegistrationRefused(format!("pid {} does not own {}", pid, owner)));
            }
            None => {
                warn!(%owner, pid, "unregistration of unknown owner");
                return Err(Error::RegistrationRefused(format!("owner {} not registered", owner)));
            }
        }
        self.remove(owner)
            .ok_or_else(|| Error::RegistrationRefused(format!("owner {} not registered", owner)))
    }

    /// Drop a process whatever the reason
    pub fn remove(&mut self, owner: OwnerId) -> Option<ProcessEntry> {
        let entry = self.processes.remove(&owner.without_clean_up())?;
        if let Some(database) = entry.database_name() {
            if entry.kind == ProcessKind::Database {
                self.active_databases.remove(database);
            }
        }
        Some(entry)
    }

    pub fn get(&self, owner: OwnerId) -> Option<&ProcessEntry> {
        self.processes.get(&owner.without_clean_up())
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Snapshot of every registered process
    pub fn entries(&self) -> Vec<(OwnerId, ProcessEntry)> {
        self.processes.iter().map(|(o, e)| (*o, e.clone())).collect()
    }

    /// Active database names in sorted order
    pub fn active_databases(&self) -> Vec<String> {
        self.active_databases.iter().cloned().collect()
    }
}
