use crate::{errors::ApiError, models::upload::UploadSession};

/// Another user's upload answers like a missing one.
pub fn require_owner(session: &UploadSession, user_id: &str) -> Result<(), ApiError> {
    if session.user_id == user_id {
        Ok(())
    } else {
        log::warn!(
            "AccessDenied: upload id={} owner={} caller={}",
            session.id,
            session.user_id,
            user_id
        );
        Err(ApiError::NotFound)
    }
}
