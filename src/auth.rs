use std::collections::HashSet;

use crate::error::ApiError;

/// Flat bearer-token allow-list, loaded once at startup.
///
/// A credential is valid iff it is a member of the configured set. Tokens
/// carry no claims, never expire and are not tied to a caller identity.
/// An empty allow-list therefore accepts nothing.
pub struct AccessGuard {
    tokens: HashSet<String>,
}

impl AccessGuard {
    /// Parses a comma-delimited token list; whitespace around entries is
    /// ignored and empty entries are dropped.
    pub fn from_tokens(list: &str) -> Self {
        let tokens = list
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
            .collect();
        Self { tokens }
    }

    /// Checks an `Authorization` header value. Absent, malformed, or unknown
    /// credentials are all the same rejection.
    pub fn authorize(&self, header: Option<&str>) -> Result<(), ApiError> {
        let token = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;
        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}
