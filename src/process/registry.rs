use crate::error::{Result, WardenError};
use crate::process::types::{ProcessInfo, ProcessRecord};
use std::collections::HashMap;
use std::path::Path;

/// Name-keyed collection of supervised processes. At most one record per key.
#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<String, ProcessRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record; a key already in use is rejected
    pub fn insert(&mut self, record: ProcessRecord) -> Result<()> {
        if self.records.contains_key(&record.key) {
            return Err(WardenError::ProcessAlreadyExists(record.key.clone()));
        }
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&ProcessRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ProcessRecord> {
        self.records.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ProcessRecord> {
        self.records.remove(key)
    }

    /// Find the key of the record matching `name` by key or by script path
    pub fn find_key(&self, name: &str) -> Option<String> {
        if self.records.contains_key(name) {
            return Some(name.to_string());
        }

        self.records
            .values()
            .find(|record| record.script == Path::new(name))
            .map(|record| record.key.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self.records.values().map(ProcessRecord::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
