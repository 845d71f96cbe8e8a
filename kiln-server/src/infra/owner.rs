use axum::{extract::FromRequestParts, http::request::Parts};
use kiln_core::types::OwnerId;

use super::errors::AppError;

/// Header set by the fronting auth layer with the authenticated owner.
pub const OWNER_HEADER: &str = "x-owner-id";

/// The caller's owner identity, taken from [`OWNER_HEADER`].
#[derive(Debug, Clone)]
pub struct Owner(pub OwnerId);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing X-Owner-Id header"))?
            .to_str()
            .map_err(|_| AppError::bad_request("X-Owner-Id must be visible ASCII"))?;
        OwnerId::parse(raw).map(Owner).map_err(AppError::from)
    }
}
