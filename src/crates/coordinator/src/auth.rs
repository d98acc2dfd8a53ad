//! Authentication seam
//!
//! The HTTP layer delegates credential checks to an `Authenticator`.
//! Issuance, revocation, and storage live outside this service; the
//! in-tree implementation validates a single static bearer token.

use std::sync::Arc;

/// Validated caller identity.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub permissions: Vec<String>,
}

/// Credential validation and permission checks.
pub trait Authenticator: Send + Sync {
    /// Validate a bearer token; `None` means the credential is not accepted.
    fn validate(&self, token: &str) -> Option<AuthContext>;

    /// Whether `subject` holds `permission`.
    fn has_permission(&self, subject: &str, permission: &str) -> bool;
}

/// Single shared-token authenticator.
pub struct StaticTokenAuthenticator {
    token: String,
    subject: String,
    permissions: Vec<String>,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            subject: "default".to_string(),
            permissions: vec!["builds:read".to_string(), "builds:write".to_string()],
        })
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn validate(&self, token: &str) -> Option<AuthContext> {
        if token == self.token {
            Some(AuthContext {
                subject: self.subject.clone(),
                permissions: self.permissions.clone(),
            })
        } else {
            None
        }
    }

    fn has_permission(&self, subject: &str, permission: &str) -> bool {
        subject == self.subject && self.permissions.iter().any(|p| p == permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token_validation() {
        let auth = StaticTokenAuthenticator::new("sekrit");
        assert!(auth.validate("sekrit").is_some());
        assert!(auth.validate("wrong").is_none());
        assert!(auth.validate("").is_none());
    }

    #[test]
    fn test_permissions() {
        let auth = StaticTokenAuthenticator::new("sekrit");
        let ctx = auth.validate("sekrit").unwrap();
        assert!(auth.has_permission(&ctx.subject, "builds:read"));
        assert!(auth.has_permission(&ctx.subject, "builds:write"));
        assert!(!auth.has_permission(&ctx.subject, "admin"));
        assert!(!auth.has_permission("someone-else", "builds:read"));
    }
}
