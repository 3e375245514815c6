//! Secret material needed for one login run.

use std::fmt;

use crate::error::RefreshError;
use crate::utils::security::mask_secret;

/// Canonical environment names, in the order they are reported when missing.
pub const USER_ID_VAR: &str = "ZERODHA_USER_ID";
pub const PASSWORD_VAR: &str = "ZERODHA_PASSWORD";
pub const TOTP_SECRET_VAR: &str = "ZERODHA_TOTP_SECRET";
pub const API_KEY_VAR: &str = "ZERODHA_API_KEY";
pub const API_SECRET_VAR: &str = "ZERODHA_API_SECRET";

pub const CREDENTIAL_VARS: [&str; 5] = [
    USER_ID_VAR,
    PASSWORD_VAR,
    TOTP_SECRET_VAR,
    API_KEY_VAR,
    API_SECRET_VAR,
];

/// Broker login and API credentials. Every field is non-empty.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user_id: String,
    password: String,
    totp_secret: String,
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(
        user_id: impl Into<String>,
        password: impl Into<String>,
        totp_secret: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self, RefreshError> {
        let fields = [
            (USER_ID_VAR, user_id.into()),
            (PASSWORD_VAR, password.into()),
            (TOTP_SECRET_VAR, totp_secret.into()),
            (API_KEY_VAR, api_key.into()),
            (API_SECRET_VAR, api_secret.into()),
        ];

        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(RefreshError::missing(missing));
        }

        let [(_, user_id), (_, password), (_, totp_secret), (_, api_key), (_, api_secret)] =
            fields;
        Ok(Self {
            user_id,
            password,
            totp_secret,
            api_key,
            api_secret,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn totp_secret(&self) -> &str {
        &self.totp_secret
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &mask_secret(&self.password))
            .field("totp_secret", &mask_secret(&self.totp_secret))
            .field("api_key", &self.api_key)
            .field("api_secret", &mask_secret(&self.api_secret))
            .finish()
    }
}
