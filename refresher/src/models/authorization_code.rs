use std::fmt;

use crate::error::RefreshError;

/// Query marker Kite appends to the post-login redirect.
pub const REQUEST_TOKEN_MARKER: &str = "request_token";

/// Single-use `request_token` taken from the login redirect.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationCode(String);

impl AuthorizationCode {
    /// Splits on `request_token=` and keeps the first `&`-delimited segment.
    pub fn from_redirect_url(url: &str) -> Result<Self, RefreshError> {
        let needle = format!("{REQUEST_TOKEN_MARKER}=");
        let (_, tail) =
            url.split_once(needle.as_str())
                .ok_or_else(|| RefreshError::AuthorizationCodeExtraction {
                    reason: format!("redirect URL has no {REQUEST_TOKEN_MARKER} parameter"),
                })?;

        let code = tail
            .split('&')
            .next()
            .unwrap_or_default()
            .split('#')
            .next()
            .unwrap_or_default();
        if code.is_empty() {
            return Err(RefreshError::AuthorizationCodeExtraction {
                reason: format!("{REQUEST_TOKEN_MARKER} parameter is empty"),
            });
        }

        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthorizationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorizationCode({})", crate::utils::security::mask_secret(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_code_before_next_parameter() {
        let code = AuthorizationCode::from_redirect_url(
            "https://example.com/callback?request_token=ABC123&status=success",
        )
        .expect("code");
        assert_eq!(code.as_str(), "ABC123");
    }

    #[test]
    fn extracts_code_when_it_is_the_last_parameter() {
        let code = AuthorizationCode::from_redirect_url(
            "https://example.com/callback?action=login&type=login&request_token=xYz789",
        )
        .expect("code");
        assert_eq!(code.as_str(), "xYz789");
    }

    #[test]
    fn fails_without_marker() {
        let err = AuthorizationCode::from_redirect_url("https://example.com/callback?status=success")
            .expect_err("no marker");
        assert!(matches!(
            err,
            RefreshError::AuthorizationCodeExtraction { .. }
        ));
    }

    #[test]
    fn fails_on_empty_value() {
        let err =
            AuthorizationCode::from_redirect_url("https://example.com/callback?request_token=&x=1")
                .expect_err("empty value");
        assert!(matches!(
            err,
            RefreshError::AuthorizationCodeExtraction { .. }
        ));
    }
}
