//! remembr-core: Visitor database and cloud face recognition.
//!
//! Holds the known-visitor store, prepares camera frames for the
//! recognition service, talks to that service, and decides which
//! detections deserve a spoken announcement.

pub mod announce;
pub mod imaging;
pub mod recognizer;
pub mod store;
pub mod types;

pub use announce::{phrase_for, Announcement, AnnouncementDeduplicator, Announcer};
pub use imaging::{ImageError, ImageSettings};
pub use recognizer::{GeminiConfig, GeminiRecognizer, RecognitionError, Recognizer};
pub use store::{DraftError, StoreError, VisitorDraft, VisitorStore};
pub use types::{
    AnnouncementKey, BoundingBox, DetectedPerson, RecognitionResult, Visitor, VisitorType,
};
