use std::env;

use crate::error::RefreshError;
use crate::models::credentials::{Credentials, CREDENTIAL_VARS};

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads broker secrets from the environment, all-or-nothing.
///
/// With a prefix such as `USR1_`, `USR1_ZERODHA_USER_ID` takes precedence over
/// `ZERODHA_USER_ID`. Missing values are always reported by their canonical
/// (unprefixed) names.
pub struct CredentialProvider {
    prefix: Option<String>,
    lookup: Lookup,
}

impl CredentialProvider {
    pub fn from_env(prefix: Option<&str>) -> Self {
        Self::with_lookup(prefix, |name| env::var(name).ok())
    }

    pub fn with_lookup<F>(prefix: Option<&str>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            prefix: prefix.map(str::to_string),
            lookup: Box::new(lookup),
        }
    }

    pub fn load(&self) -> Result<Credentials, RefreshError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(RefreshError::missing(missing));
        }

        let [user_id, password, totp_secret, api_key, api_secret] =
            CREDENTIAL_VARS.map(|name| self.resolve(name).unwrap_or_default());
        Credentials::new(user_id, password, totp_secret, api_key, api_secret)
    }

    /// Canonical names of every credential that is unset or blank.
    pub fn missing(&self) -> Vec<&'static str> {
        CREDENTIAL_VARS
            .into_iter()
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }

    fn resolve(&self, name: &str) -> Option<String> {
        let prefixed = self
            .prefix
            .as_deref()
            .and_then(|prefix| self.read(&format!("{prefix}{name}")));
        prefixed.or_else(|| self.read(name))
    }

    fn read(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }
}
