use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Upper bound of the normalized coordinate space used by `box_2d`.
pub const BOX_SCALE: f32 = 1000.0;

/// Placeholder name for a person the service could not match.
pub const UNKNOWN_NAME: &str = "Unknown Person";

/// Classification of a known visitor, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitorType {
    Trusted,
    Blocked,
}

impl VisitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitorType::Trusted => "trusted",
            VisitorType::Blocked => "blocked",
        }
    }
}

impl fmt::Display for VisitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VisitorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trusted" => Ok(VisitorType::Trusted),
            "blocked" => Ok(VisitorType::Blocked),
            other => Err(format!("unknown visitor type: {other:?} (expected trusted or blocked)")),
        }
    }
}

/// A known identity in the local visitor database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    pub id: String,
    pub name: String,
    pub relationship: String,
    pub last_interaction: String,
    pub notes: String,
    /// Reference photo: bare base64 or a `data:` URL.
    pub photo_base64: String,
    #[serde(rename = "type")]
    pub kind: VisitorType,
}

/// Photo-free view of a [`Visitor`] for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSummary<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub relationship: &'a str,
    pub last_interaction: &'a str,
    pub notes: &'a str,
    #[serde(rename = "type")]
    pub kind: VisitorType,
}

impl Visitor {
    pub fn summary(&self) -> VisitorSummary<'_> {
        VisitorSummary {
            id: &self.id,
            name: &self.name,
            relationship: &self.relationship,
            last_interaction: &self.last_interaction,
            notes: &self.notes,
            kind: self.kind,
        }
    }
}

/// Face region as `[ymin, xmin, ymax, xmax]` on the 0–1000 scale.
///
/// Values are clamped into range and inverted edges are swapped on
/// construction, so downstream geometry never sees a negative extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub ymin: f32,
    pub xmin: f32,
    pub ymax: f32,
    pub xmax: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from(raw: [f32; 4]) -> Self {
        let clamp = |v: f32| if v.is_finite() { v.clamp(0.0, BOX_SCALE) } else { 0.0 };
        let (y0, x0, y1, x1) = (clamp(raw[0]), clamp(raw[1]), clamp(raw[2]), clamp(raw[3]));
        Self {
            ymin: y0.min(y1),
            xmin: x0.min(x1),
            ymax: y0.max(y1),
            xmax: x0.max(x1),
        }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.ymin, b.xmin, b.ymax, b.xmax]
    }
}

/// Overlay placement as percentages of the view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayRect {
    pub top: f32,
    pub left: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn overlay_rect(&self) -> OverlayRect {
        let pct = |v: f32| (v / (BOX_SCALE / 100.0)).clamp(0.0, 100.0);
        OverlayRect {
            top: pct(self.ymin),
            left: pct(self.xmin),
            width: pct((self.xmax - self.xmin).max(0.0)),
            height: pct((self.ymax - self.ymin).max(0.0)),
        }
    }
}

/// One person located in one frame by the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedPerson {
    #[serde(rename = "box_2d")]
    pub box_2d: BoundingBox,
    pub match_found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(default = "unknown_name")]
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<VisitorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_is_low: Option<bool>,
}

fn unknown_name() -> String {
    UNKNOWN_NAME.to_string()
}

impl DetectedPerson {
    /// Key used to suppress repeat announcements for the same identity.
    pub fn announcement_key(&self) -> AnnouncementKey {
        match (&self.visitor_id, self.match_found) {
            (Some(id), true) => AnnouncementKey::from_visitor_id(id.clone()),
            _ => AnnouncementKey::unknown(),
        }
    }

    pub fn is_low_confidence(&self) -> bool {
        self.confidence_is_low.unwrap_or(false)
    }

    pub fn is_blocked(&self) -> bool {
        self.match_found && self.kind == Some(VisitorType::Blocked)
    }

    /// Drop the identity claim, keeping only geometry and the confidence flag.
    fn into_unmatched(self) -> Self {
        Self {
            box_2d: self.box_2d,
            match_found: false,
            visitor_id: None,
            name: unknown_name(),
            kind: None,
            relationship: None,
            last_interaction: None,
            notes: None,
            confidence_is_low: self.confidence_is_low,
        }
    }
}

/// Detections for a single frame, in service order. Empty is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub people: Vec<DetectedPerson>,
}

impl RecognitionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reconcile service claims against the visitors that were sent.
    ///
    /// Matches whose `visitorId` is absent or unknown become unmatched.
    /// Known matches take their name, type and details from the store.
    pub fn reconcile(self, visitors: &[Visitor]) -> Self {
        let by_id: HashMap<&str, &Visitor> =
            visitors.iter().map(|v| (v.id.as_str(), v)).collect();

        let people = self
            .people
            .into_iter()
            .map(|person| {
                if !person.match_found {
                    return person.into_unmatched();
                }
                let known = person.visitor_id.as_deref().and_then(|id| by_id.get(id).copied());
                match known {
                    Some(visitor) => DetectedPerson {
                        visitor_id: Some(visitor.id.clone()),
                        name: visitor.name.clone(),
                        kind: Some(visitor.kind),
                        relationship: Some(visitor.relationship.clone()),
                        last_interaction: Some(visitor.last_interaction.clone()),
                        notes: (!visitor.notes.is_empty()).then(|| visitor.notes.clone()),
                        ..person
                    },
                    None => {
                        tracing::warn!(
                            visitor_id = ?person.visitor_id,
                            "match references no known visitor; treating as unmatched"
                        );
                        person.into_unmatched()
                    }
                }
            })
            .collect();

        Self { people }
    }
}

/// Deduplication key for announcements: a visitor id, or the unknown sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AnnouncementKey(String);

impl AnnouncementKey {
    pub const UNKNOWN: &'static str = "unknown_person";

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn from_visitor_id(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }
}

impl fmt::Display for AnnouncementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn visitor(id: &str, name: &str, kind: VisitorType) -> Visitor {
        Visitor {
            id: id.into(),
            name: name.into(),
            relationship: "Daughter".into(),
            last_interaction: "Sunday".into(),
            notes: String::new(),
            photo_base64: "aGVsbG8=".into(),
            kind,
        }
    }

    pub fn matched(id: &str, name: &str, kind: VisitorType) -> DetectedPerson {
        DetectedPerson {
            box_2d: BoundingBox::from([100.0, 100.0, 500.0, 500.0]),
            match_found: true,
            visitor_id: Some(id.into()),
            name: name.into(),
            kind: Some(kind),
            relationship: None,
            last_interaction: None,
            notes: None,
            confidence_is_low: None,
        }
    }

    pub fn unmatched() -> DetectedPerson {
        DetectedPerson {
            box_2d: BoundingBox::from([0.0, 0.0, 200.0, 200.0]),
            match_found: false,
            visitor_id: None,
            name: UNKNOWN_NAME.into(),
            kind: None,
            relationship: None,
            last_interaction: None,
            notes: None,
            confidence_is_low: None,
        }
    }
}
