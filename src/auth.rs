//! Admission credential check
//!
//! The engine only consults `is_authorized` at connection admission; the
//! credential's provenance (cookies, pairing, expiry) belongs to the
//! surrounding application.

/// Pure credential check consulted once per connection handshake.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, credential: &str) -> bool;
}

/// Shared-token authorizer: the credential must equal the configured token.
pub struct TokenAuthorizer {
    token: String,
}

impl TokenAuthorizer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authorizer for TokenAuthorizer {
    fn is_authorized(&self, credential: &str) -> bool {
        !self.token.is_empty() && credential == self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_match() {
        let auth = TokenAuthorizer::new("secret");
        assert!(auth.is_authorized("secret"));
        assert!(!auth.is_authorized("wrong"));
        assert!(!auth.is_authorized(""));
    }

    #[test]
    fn test_empty_token_rejects_everything() {
        let auth = TokenAuthorizer::new("");
        assert!(!auth.is_authorized(""));
        assert!(!auth.is_authorized("anything"));
    }
}
