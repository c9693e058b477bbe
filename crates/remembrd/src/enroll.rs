//! Adding a visitor: required fields, then a face check on the reference photo.

use remembr_core::imaging::{self, ImageError};
use remembr_core::{DraftError, RecognitionError, Recognizer, Visitor, VisitorDraft};
use std::time::Duration;
use thiserror::Error;

/// Why a visitor could not be added. Display strings are caregiver-facing.
#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("Name and photo are required.")]
    MissingField(#[from] DraftError),
    #[error("The photo could not be read as an image.")]
    UnreadablePhoto(#[source] ImageError),
    #[error("No clear face detected. Please ensure the person is facing the camera.")]
    ValidationRejected,
    #[error("System is currently busy (rate limit reached). Please wait a moment and try again.")]
    QuotaExceeded,
    #[error("Validation failed. Please try again.")]
    ValidationFailed(#[source] RecognitionError),
}

/// Validate `photo` with the recognition service and build the visitor.
///
/// The caller adds the result to the store.
pub async fn enroll_visitor(
    recognizer: &dyn Recognizer,
    draft: VisitorDraft,
    photo: &[u8],
    timeout: Duration,
) -> Result<Visitor, EnrollError> {
    let draft = VisitorDraft {
        photo_base64: if photo.is_empty() {
            String::new()
        } else {
            imaging::to_data_url(photo)
        },
        ..draft
    };
    draft.check()?;

    let image = image::load_from_memory(photo)
        .map_err(|e| EnrollError::UnreadablePhoto(ImageError::Decode(e)))?;

    let verdict = tokio::time::timeout(timeout, recognizer.validate_has_face(&image))
        .await
        .unwrap_or(Err(RecognitionError::Timeout(timeout)));

    match verdict {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(name = %draft.name, "reference photo rejected: no clear face");
            return Err(EnrollError::ValidationRejected);
        }
        Err(e) if e.is_quota() => {
            tracing::warn!(error = %e, "face validation rate limited");
            return Err(EnrollError::QuotaExceeded);
        }
        Err(e) => {
            tracing::warn!(error = %e, "face validation failed");
            return Err(EnrollError::ValidationFailed(e));
        }
    }

    Ok(draft.into_visitor()?)
}
