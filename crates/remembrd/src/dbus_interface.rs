use crate::enroll::{self, EnrollError};
use crate::monitor::MonitorSnapshot;
use remembr_core::{phrase_for, Recognizer, StoreError, Visitor, VisitorDraft, VisitorStore, VisitorType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use zbus::interface;

pub const BUS_NAME: &str = "org.remembr.Remembr1";
pub const OBJECT_PATH: &str = "/org/remembr/Remembr1";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read photo {path}: {source}")]
    Photo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown visitor type: {0}")]
    InvalidType(String),
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::InvalidType(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
            _ => zbus::fdo::Error::Failed(e.to_string()),
        }
    }
}

/// Caregiver-facing D-Bus service for managing visitors and observing the loop.
///
/// Bus name: org.remembr.Remembr1
/// Object path: /org/remembr/Remembr1
pub struct RemembrService {
    store: Mutex<VisitorStore>,
    visitors_tx: watch::Sender<Arc<[Visitor]>>,
    status: watch::Receiver<MonitorSnapshot>,
    recognizer: Arc<dyn Recognizer>,
    validation_timeout: Duration,
}

impl RemembrService {
    pub fn new(
        store: VisitorStore,
        visitors_tx: watch::Sender<Arc<[Visitor]>>,
        status: watch::Receiver<MonitorSnapshot>,
        recognizer: Arc<dyn Recognizer>,
        validation_timeout: Duration,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            visitors_tx,
            status,
            recognizer,
            validation_timeout,
        }
    }

    /// Validate and add a visitor, then hand the new snapshot to the loop.
    pub async fn add(&self, draft: VisitorDraft, photo: &[u8]) -> Result<String, ServiceError> {
        let visitor =
            enroll::enroll_visitor(self.recognizer.as_ref(), draft, photo, self.validation_timeout)
                .await?;
        let id = visitor.id.clone();

        let mut store = self.store.lock().await;
        store.add(visitor)?;
        self.visitors_tx.send_replace(store.snapshot());
        tracing::info!(id, total = store.len(), "visitor added");
        Ok(id)
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut store = self.store.lock().await;
        let removed = store.remove(id);
        if removed {
            self.visitors_tx.send_replace(store.snapshot());
            tracing::info!(id, total = store.len(), "visitor removed");
        }
        removed
    }

    /// Photo-free listing, optionally filtered by type.
    pub async fn list_json(&self, kind: Option<VisitorType>) -> String {
        let store = self.store.lock().await;
        let summaries: Vec<_> = match kind {
            Some(kind) => store.list_by_type(kind).map(Visitor::summary).collect(),
            None => store.list().iter().map(Visitor::summary).collect(),
        };
        serde_json::json!(summaries).to_string()
    }

    pub async fn status_json(&self) -> String {
        let snapshot = self.status.borrow().clone();
        let visitors = self.store.lock().await.len();

        let tracked: Vec<_> = snapshot
            .tracked
            .iter()
            .map(|person| {
                serde_json::json!({
                    "person": person,
                    "label": phrase_for(person),
                    "overlay": person.box_2d.overlay_rect(),
                })
            })
            .collect();

        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "visitors": visitors,
            "state": snapshot.state,
            "rate_limited": snapshot.rate_limited,
            "cycles": snapshot.cycles,
            "last_outcome": snapshot.last_outcome,
            "next_delay_ms": snapshot.next_delay_ms,
            "last_success_at": snapshot.last_success_at,
            "tracked": tracked,
        })
        .to_string()
    }
}

/// Empty string means "all types".
fn parse_kind(kind: &str) -> Result<Option<VisitorType>, ServiceError> {
    match kind.trim() {
        "" => Ok(None),
        s => s
            .parse()
            .map(Some)
            .map_err(|_| ServiceError::InvalidType(s.to_string())),
    }
}

#[interface(name = "org.remembr.Remembr1")]
impl RemembrService {
    /// Add a visitor from a photo on disk. Returns the new visitor id.
    async fn add_visitor(
        &self,
        name: &str,
        relationship: &str,
        last_interaction: &str,
        notes: &str,
        kind: &str,
        photo_path: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, kind, photo_path, "add_visitor requested");
        let kind = parse_kind(kind)?.unwrap_or(VisitorType::Trusted);
        let photo = tokio::fs::read(photo_path)
            .await
            .map_err(|source| ServiceError::Photo {
                path: photo_path.to_string(),
                source,
            })?;

        let draft = VisitorDraft {
            name: name.to_string(),
            relationship: relationship.to_string(),
            last_interaction: last_interaction.to_string(),
            notes: notes.to_string(),
            photo_base64: String::new(),
            kind,
        };
        Ok(self.add(draft, &photo).await?)
    }

    async fn remove_visitor(&self, id: &str) -> bool {
        tracing::info!(id, "remove_visitor requested");
        self.remove(id).await
    }

    /// List visitors as JSON. `kind` is "trusted", "blocked" or empty for all.
    async fn list_visitors(&self, kind: &str) -> zbus::fdo::Result<String> {
        let kind = parse_kind(kind)?;
        Ok(self.list_json(kind).await)
    }

    /// Return daemon and recognition loop status.
    async fn status(&self) -> String {
        self.status_json().await
    }
}
