use base32::Alphabet::RFC4648;
use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, TOTP};

use crate::error::RefreshError;

const CODE_DIGITS: usize = 6;
const STEP_SECONDS: u64 = 30;
const ALLOWED_SKEW: u8 = 1;

/// Returns the RFC 6238 code (SHA-1, 30 s step, 6 digits) for `secret` at `at`.
pub fn current_code(secret: &str, at: DateTime<Utc>) -> Result<String, RefreshError> {
    let timestamp = u64::try_from(at.timestamp())
        .map_err(|_| RefreshError::InvalidSecret("time precedes the Unix epoch".into()))?;
    let totp = build_totp(secret)?;
    Ok(totp.generate(timestamp))
}

/// Seconds left before the code produced at `at` rolls over.
pub fn seconds_remaining(at: DateTime<Utc>) -> u64 {
    let elapsed = at.timestamp().rem_euclid(STEP_SECONDS as i64) as u64;
    STEP_SECONDS - elapsed
}

fn build_totp(secret: &str) -> Result<TOTP, RefreshError> {
    let secret_bytes = decode_secret(secret)?;
    Ok(TOTP::new_unchecked(
        Algorithm::SHA1,
        CODE_DIGITS,
        ALLOWED_SKEW,
        STEP_SECONDS,
        secret_bytes,
    ))
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, RefreshError> {
    let cleaned = secret
        .trim()
        .replace(' ', "")
        .trim_end_matches('=')
        .to_uppercase();
    if cleaned.is_empty() {
        return Err(RefreshError::InvalidSecret("secret is empty".into()));
    }
    base32::decode(RFC4648 { padding: false }, cleaned.as_str())
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| RefreshError::InvalidSecret("secret is not valid base32".into()))
}
