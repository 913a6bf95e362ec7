//! Authentication utilities: JWT validation and the elevated-role gate

use anyhow::{anyhow, Result};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ImportError;
use crate::types::Request;

/// Roles allowed to run imports
pub const ELEVATED_ROLES: &[&str] = &["admin", "manager"];

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// User email
    pub email: String,
    /// User role (admin, manager, worker, ...)
    pub role: String,
    /// Owner ID (for workers - the tenant user who created them)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Issued at (unix timestamp)
    pub iat: usize,
    /// Expiration (unix timestamp)
    pub exp: usize,
}

/// Authentication result from extract_auth
#[derive(Debug, Clone, PartialEq)]
pub struct AuthInfo {
    pub user_id: Uuid,
    pub role: String,
    /// For workers, the tenant's user_id (used for data queries)
    pub owner_id: Option<Uuid>,
}

impl AuthInfo {
    /// Returns the user_id to use for data queries.
    /// Non-owner accounts act on their owner's data.
    pub fn data_user_id(&self) -> Uuid {
        self.owner_id.unwrap_or(self.user_id)
    }

    pub fn is_elevated(&self) -> bool {
        ELEVATED_ROLES.contains(&self.role.as_str())
    }
}

/// Validate a JWT token and return claims
pub fn validate_token(token: &str, secret: &str) -> Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| anyhow!("Invalid token: {}", e))?;

    Ok(token_data.claims)
}

/// Extract authentication info from a NATS request.
pub fn extract_auth<T>(request: &Request<T>, jwt_secret: &str) -> Result<AuthInfo> {
    let token = request
        .token
        .as_deref()
        .ok_or_else(|| anyhow!("No authentication provided: JWT token is required"))?;

    let claims = validate_token(token, jwt_secret)?;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|e| anyhow!("Invalid user_id in token: {}", e))?;
    let owner_id = claims
        .owner_id
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|e| anyhow!("Invalid owner_id in token: {}", e))?;

    Ok(AuthInfo {
        user_id,
        role: claims.role,
        owner_id,
    })
}

/// Authorization gate of every import operation.
pub fn require_elevated_role<T>(request: &Request<T>, jwt_secret: &str) -> Result<AuthInfo, ImportError> {
    let auth = extract_auth(request, jwt_secret).map_err(|_| ImportError::Unauthorized)?;
    if !auth.is_elevated() {
        return Err(ImportError::Forbidden(format!(
            "Role '{}' may not manage imports",
            auth.role
        )));
    }
    Ok(auth)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const TEST_SECRET: &str = "test-secret-key-for-jwt-at-least-32-bytes-long";

    fn token_for(user_id: Uuid, role: &str, owner_id: Option<Uuid>, secret: &str) -> String {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            email: "test@example.com".to_string(),
            role: role.to_string(),
            owner_id: owner_id.map(|id| id.to_string()),
            iat: now,
            exp: now + 3600,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn request(token: Option<String>) -> Request<serde_json::Value> {
        Request {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            token,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_validate_token_round_trip() {
        let user_id = Uuid::new_v4();
        let claims = validate_token(&token_for(user_id, "admin", None, TEST_SECRET), TEST_SECRET).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn test_validate_token_wrong_secret() {
        let token = token_for(Uuid::new_v4(), "admin", None, TEST_SECRET);
        assert!(validate_token(&token, "another-secret-key-at-least-32-bytes!!").is_err());
    }

    #[test]
    fn test_extract_auth_no_token_fails() {
        assert!(extract_auth(&request(None), TEST_SECRET).is_err());
    }

    #[test]
    fn test_data_user_id_prefers_owner() {
        let user_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();
        let token = token_for(user_id, "manager", Some(owner_id), TEST_SECRET);
        let auth = extract_auth(&request(Some(token)), TEST_SECRET).unwrap();
        assert_eq!(auth.user_id, user_id);
        assert_eq!(auth.data_user_id(), owner_id);
    }

    #[test]
    fn test_require_elevated_role_accepts_admin_and_manager() {
        for role in ["admin", "manager"] {
            let token = token_for(Uuid::new_v4(), role, None, TEST_SECRET);
            assert!(require_elevated_role(&request(Some(token)), TEST_SECRET).is_ok());
        }
    }

    #[test]
    fn test_require_elevated_role_rejects_worker() {
        let token = token_for(Uuid::new_v4(), "worker", Some(Uuid::new_v4()), TEST_SECRET);
        let err = require_elevated_role(&request(Some(token)), TEST_SECRET).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn test_require_elevated_role_without_token_is_unauthorized() {
        let err = require_elevated_role(&request(None), TEST_SECRET).unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }
}
