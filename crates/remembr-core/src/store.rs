//! Visitor store: an in-memory list persisted wholesale as a JSON file.

use crate::types::{Visitor, VisitorType};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_TRUSTED_RELATIONSHIP: &str = "Visitor";
const DEFAULT_BLOCKED_RELATIONSHIP: &str = "Restricted";
const DEFAULT_LAST_INTERACTION: &str = "No recorded interaction.";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("visitor id already exists: {0}")]
    DuplicateId(String),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize visitors: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DraftError {
    #[error("name is required")]
    MissingName,
    #[error("photo is required")]
    MissingPhoto,
}

/// Caregiver input for a new visitor, before an id is assigned.
#[derive(Debug, Clone)]
pub struct VisitorDraft {
    pub name: String,
    pub relationship: String,
    pub last_interaction: String,
    pub notes: String,
    pub photo_base64: String,
    pub kind: VisitorType,
}

impl VisitorDraft {
    /// Check required fields without consuming the draft.
    pub fn check(&self) -> Result<(), DraftError> {
        if self.name.trim().is_empty() {
            return Err(DraftError::MissingName);
        }
        if self.photo_base64.trim().is_empty() {
            return Err(DraftError::MissingPhoto);
        }
        Ok(())
    }

    /// Assign a fresh id and fill in defaults for blank fields.
    pub fn into_visitor(self) -> Result<Visitor, DraftError> {
        self.check()?;

        let relationship = match (self.relationship.trim(), self.kind) {
            ("", VisitorType::Trusted) => DEFAULT_TRUSTED_RELATIONSHIP.to_string(),
            ("", VisitorType::Blocked) => DEFAULT_BLOCKED_RELATIONSHIP.to_string(),
            (rel, _) => rel.to_string(),
        };
        let last_interaction = match self.last_interaction.trim() {
            "" => DEFAULT_LAST_INTERACTION.to_string(),
            s => s.to_string(),
        };

        Ok(Visitor {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.trim().to_string(),
            relationship,
            last_interaction,
            notes: self.notes,
            photo_base64: self.photo_base64,
            kind: self.kind,
        })
    }
}

/// Known visitors, loaded once and rewritten on every mutation.
#[derive(Debug)]
pub struct VisitorStore {
    path: Option<PathBuf>,
    visitors: Vec<Visitor>,
}

impl VisitorStore {
    /// A store that never touches disk.
    pub fn in_memory(visitors: Vec<Visitor>) -> Self {
        Self {
            path: None,
            visitors,
        }
    }

    /// Load from `path`. A missing, unreadable or corrupt file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let visitors = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<Visitor>>(&bytes) {
                Ok(list) => dedup_ids(list),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "visitor file is corrupt; starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no visitor file yet; starting empty");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read visitor file; starting empty");
                Vec::new()
            }
        };

        tracing::info!(count = visitors.len(), "visitor store loaded");
        Self {
            path: Some(path),
            visitors,
        }
    }

    pub fn list(&self) -> &[Visitor] {
        &self.visitors
    }

    pub fn list_by_type(&self, kind: VisitorType) -> impl Iterator<Item = &Visitor> {
        self.visitors.iter().filter(move |v| v.kind == kind)
    }

    pub fn get(&self, id: &str) -> Option<&Visitor> {
        self.visitors.iter().find(|v| v.id == id)
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    /// Immutable copy handed to the recognition loop at cycle start.
    pub fn snapshot(&self) -> Arc<[Visitor]> {
        self.visitors.clone().into()
    }

    pub fn add(&mut self, visitor: Visitor) -> Result<(), StoreError> {
        if self.get(&visitor.id).is_some() {
            return Err(StoreError::DuplicateId(visitor.id));
        }
        tracing::info!(id = %visitor.id, kind = %visitor.kind, "visitor added");
        self.visitors.push(visitor);
        self.persist();
        Ok(())
    }

    /// Delete by id. Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.visitors.len();
        self.visitors.retain(|v| v.id != id);
        let removed = self.visitors.len() != before;
        if removed {
            tracing::info!(id, "visitor removed");
            self.persist();
        }
        removed
    }

    /// Rewrite the whole file via a temp sibling and rename.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write_err = |source| StoreError::Write {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_vec(&self.visitors)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }

    /// Save without propagating failure; the in-memory list stays authoritative.
    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "failed to save visitor store");
        }
    }
}

fn dedup_ids(list: Vec<Visitor>) -> Vec<Visitor> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(list.len());
    for v in list {
        if seen.insert(v.id.clone()) {
            out.push(v);
        } else {
            tracing::warn!(id = %v.id, "dropping visitor with duplicate id");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::visitor;

    fn draft(kind: VisitorType) -> VisitorDraft {
        VisitorDraft {
            name: "  Ann ".into(),
            relationship: String::new(),
            last_interaction: String::new(),
            notes: "Brings flowers".into(),
            photo_base64: "data:image/jpeg;base64,AAAA".into(),
            kind,
        }
    }

    #[test]
    fn test_draft_defaults() {
        let trusted = draft(VisitorType::Trusted).into_visitor().unwrap();
        assert_eq!(trusted.name, "Ann");
        assert_eq!(trusted.relationship, "Visitor");
        assert_eq!(trusted.last_interaction, "No recorded interaction.");

        let blocked = draft(VisitorType::Blocked).into_visitor().unwrap();
        assert_eq!(blocked.relationship, "Restricted");
        assert_ne!(trusted.id, blocked.id);
    }

    #[test]
    fn test_draft_requires_name_and_photo() {
        let mut d = draft(VisitorType::Trusted);
        d.photo_base64.clear();
        assert_eq!(d.clone().into_visitor().unwrap_err(), DraftError::MissingPhoto);
        d.name = " ".into();
        assert_eq!(d.into_visitor().unwrap_err(), DraftError::MissingName);
    }

    #[test]
    fn test_add_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/visitors.json");

        let mut store = VisitorStore::load(&path);
        assert!(store.is_empty());
        store.add(visitor("v1", "Ann", VisitorType::Trusted)).unwrap();
        store.add(visitor("v2", "Rex", VisitorType::Blocked)).unwrap();
        assert!(store.remove("v1"));
        assert!(!store.remove("v1"));

        let reloaded = VisitorStore::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("v2").unwrap().name, "Rex");
        assert_eq!(reloaded.list_by_type(VisitorType::Blocked).count(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut store = VisitorStore::in_memory(vec![visitor("v1", "Ann", VisitorType::Trusted)]);
        let err = store.add(visitor("v1", "Other", VisitorType::Trusted)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "v1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visitors.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(VisitorStore::load(&path).is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut store = VisitorStore::in_memory(vec![visitor("v1", "Ann", VisitorType::Trusted)]);
        let snap = store.snapshot();
        store.remove("v1");
        assert_eq!(snap.len(), 1);
        assert!(store.is_empty());
    }
}
