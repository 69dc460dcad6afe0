//! Caller identity for the EcoVault API.
//!
//! Session issuance and verification live in the upstream auth gateway; by
//! the time a request reaches this service the gateway has resolved the
//! caller and forwards identity and role as trusted headers. The role string
//! is parsed into [`UserRole`] exactly once here, so handlers check
//! capabilities against an enum instead of re-deriving role strings.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use uuid::Uuid;

use crate::models::{ApiResponse, UserRole};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Resolved caller identity.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl AuthenticatedUser {
    pub fn can_moderate(&self) -> bool {
        matches!(self.role, UserRole::Moderator | UserRole::Admin)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, UserRole::Admin)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Uuid>().ok())
            .ok_or_else(|| unauthorized("missing or invalid user identity"))?;

        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<UserRole>().ok())
            .ok_or_else(|| unauthorized("missing or invalid user role"))?;

        Ok(AuthenticatedUser { user_id, role })
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_from_gateway_strings() {
        assert_eq!("member".parse::<UserRole>(), Ok(UserRole::Member));
        assert_eq!("moderator".parse::<UserRole>(), Ok(UserRole::Moderator));
        assert_eq!("admin".parse::<UserRole>(), Ok(UserRole::Admin));
        assert!("superuser".parse::<UserRole>().is_err());
    }

    #[test]
    fn moderation_capability_covers_moderator_and_admin() {
        let member = AuthenticatedUser {
            user_id: Uuid::new_v4(),
            role: UserRole::Member,
        };
        let moderator = AuthenticatedUser {
            user_id: Uuid::new_v4(),
            role: UserRole::Moderator,
        };
        let admin = AuthenticatedUser {
            user_id: Uuid::new_v4(),
            role: UserRole::Admin,
        };

        assert!(!member.can_moderate());
        assert!(moderator.can_moderate());
        assert!(admin.can_moderate());
        assert!(!moderator.is_admin());
        assert!(admin.is_admin());
    }
}
