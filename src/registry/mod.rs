//! Durable instance registry.
//!
//! The registry is a single JSON document mapping instance id to its full
//! record. Every mutation is written through to disk before returning; the
//! document is replaced atomically (write to a sibling temp file, then rename)
//! so a crash mid-write leaves the previous state intact.

mod models;

pub use models::*;

#[cfg(test)]
pub(crate) use models::fixtures;

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

pub struct Registry {
    path: PathBuf,
    instances: BTreeMap<String, Instance>,
}

impl Registry {
    /// Create an empty registry that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            instances: BTreeMap::new(),
        }
    }

    /// Load the registry from disk, assigning `default_owner` to records
    /// that predate ownership tracking. The migration is persisted right away.
    pub async fn load(path: impl Into<PathBuf>, default_owner: &str) -> Result<Self> {
        let path = path.into();
        let mut registry = Self::new(&path);

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No instance registry found, starting empty");
                return Ok(registry);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read registry {}", path.display()))
            }
        };

        registry.instances = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse registry {}", path.display()))?;

        let mut migrated = 0;
        for instance in registry.instances.values_mut() {
            if instance.owner.is_empty() {
                tracing::info!(instance = %instance.id, owner = %default_owner, "Assigning owner to legacy instance");
                instance.owner = default_owner.to_string();
                migrated += 1;
            }
        }

        if migrated > 0 {
            registry.save().await?;
            tracing::info!(migrated, "Registry owner migration completed");
        }

        tracing::info!(count = registry.instances.len(), "Instance registry loaded");
        Ok(registry)
    }

    /// Rewrite the whole document.
    pub async fn save(&self) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(&self.instances).context("Failed to serialize registry")?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace registry {}", self.path.display()))?;

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Case-insensitive name lookup.
    pub fn find_by_name(&self, name: &str) -> Option<&Instance> {
        let wanted = name.trim().to_lowercase();
        self.instances
            .values()
            .find(|instance| instance.name.to_lowercase() == wanted)
    }

    /// Every port recorded by any instance.
    pub fn used_ports(&self) -> HashSet<u16> {
        self.instances
            .values()
            .flat_map(|instance| instance.ports.values())
            .collect()
    }

    /// Insert or replace a record and persist. A failed write leaves the
    /// in-memory map as it was.
    pub async fn put(&mut self, instance: Instance) -> Result<()> {
        let id = instance.id.clone();
        let previous = self.instances.insert(id.clone(), instance);
        if let Err(e) = self.save().await {
            self.restore(id, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Apply `f` to a record and persist. Returns the updated record, or
    /// `None` when the id is unknown (nothing is written in that case).
    pub async fn update<F>(&mut self, id: &str, f: F) -> Result<Option<Instance>>
    where
        F: FnOnce(&mut Instance),
    {
        let Some(instance) = self.instances.get_mut(id) else {
            return Ok(None);
        };
        let original = instance.clone();
        f(instance);
        let snapshot = instance.clone();
        if let Err(e) = self.save().await {
            self.restore(id.to_string(), Some(original));
            return Err(e);
        }
        Ok(Some(snapshot))
    }

    /// Remove a record and persist. The record stays when the write fails.
    pub async fn delete(&mut self, id: &str) -> Result<Option<Instance>> {
        let Some(removed) = self.instances.remove(id) else {
            return Ok(None);
        };
        if let Err(e) = self.save().await {
            self.restore(id.to_string(), Some(removed));
            return Err(e);
        }
        Ok(Some(removed))
    }

    fn restore(&mut self, id: String, previous: Option<Instance>) {
        match previous {
            Some(instance) => {
                self.instances.insert(id, instance);
            }
            None => {
                self.instances.remove(&id);
            }
        }
    }
}
