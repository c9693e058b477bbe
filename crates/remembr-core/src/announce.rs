//! Announcement policy: phrase selection and once-per-session deduplication.

use crate::types::{AnnouncementKey, DetectedPerson, RecognitionResult};
use std::collections::HashSet;

pub const UNCERTAIN_PHRASE: &str = "I'm having trouble seeing clearly.";
pub const RESTRICTED_PHRASE: &str = "Caution: This person is restricted.";
pub const UNRECOGNIZED_PHRASE: &str = "Someone I can't identify entered the room.";

/// Text shown beside a detection and spoken when it is announced.
pub fn phrase_for(person: &DetectedPerson) -> String {
    if person.is_low_confidence() {
        return UNCERTAIN_PHRASE.to_string();
    }
    if person.match_found {
        if person.is_blocked() {
            return RESTRICTED_PHRASE.to_string();
        }
        return format!("Looks like this might be {}.", person.name);
    }
    UNRECOGNIZED_PHRASE.to_string()
}

/// Output surface for spoken or on-screen notices.
pub trait Announcer: Send + Sync {
    fn announce(&self, text: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub key: AnnouncementKey,
    pub phrase: String,
}

/// Tracks which identities have been announced this session.
///
/// The announced set only grows. A new session starts with a new
/// deduplicator.
#[derive(Debug, Default)]
pub struct AnnouncementDeduplicator {
    announced: HashSet<AnnouncementKey>,
    /// Keys that got the uncertainty phrase but no confident greeting yet.
    uncertain: HashSet<AnnouncementKey>,
}

impl AnnouncementDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the announcements this result triggers, marking their keys.
    ///
    /// Only matched detections announce; unknown people are never narrated.
    /// A low-confidence match says the uncertainty phrase once but leaves the
    /// key open, so a later confident sighting still greets by name.
    pub fn process(&mut self, result: &RecognitionResult) -> Vec<Announcement> {
        let mut out = Vec::new();
        for person in &result.people {
            if !person.match_found {
                continue;
            }
            let key = person.announcement_key();
            if self.announced.contains(&key) {
                continue;
            }
            let marked = if person.is_low_confidence() {
                self.uncertain.insert(key.clone())
            } else {
                self.announced.insert(key.clone())
            };
            if marked {
                out.push(Announcement {
                    key,
                    phrase: phrase_for(person),
                });
            }
        }
        out
    }

    pub fn has_announced(&self, key: &AnnouncementKey) -> bool {
        self.announced.contains(key)
    }

    pub fn len(&self) -> usize {
        self.announced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announced.is_empty()
    }
}
