use std::fmt;

use thiserror::Error;

/// Named stages of the interactive login, used to report where an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    LaunchBrowser,
    OpenLoginPage,
    EnterUserId,
    EnterPassword,
    SubmitCredentials,
    EnterTotp,
    SubmitTotp,
    AwaitRedirect,
}

impl LoginStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStep::LaunchBrowser => "launch_browser",
            LoginStep::OpenLoginPage => "open_login_page",
            LoginStep::EnterUserId => "enter_user_id",
            LoginStep::EnterPassword => "enter_password",
            LoginStep::SubmitCredentials => "submit_credentials",
            LoginStep::EnterTotp => "enter_totp",
            LoginStep::SubmitTotp => "submit_totp",
            LoginStep::AwaitRedirect => "await_redirect",
        }
    }
}

impl fmt::Display for LoginStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("missing required configuration: {}", missing.join(", "))]
    Configuration { missing: Vec<String> },
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
    #[error("invalid TOTP secret: {0}")]
    InvalidSecret(String),
    #[error("login step {step} timed out")]
    LoginStepTimeout { step: LoginStep },
    #[error("login step {step} failed: {cause:#}")]
    Browser { step: LoginStep, cause: anyhow::Error },
    #[error("could not extract authorization code: {reason}")]
    AuthorizationCodeExtraction { reason: String },
    #[error("token exchange failed: {0:#}")]
    TokenExchange(anyhow::Error),
    #[error("token persistence failed: {0:#}")]
    Persistence(anyhow::Error),
    #[error("login cancelled")]
    Cancelled,
}

impl RefreshError {
    /// Transient UI and network failures are worth a fresh login; bad input is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RefreshError::LoginStepTimeout { .. }
                | RefreshError::Browser { .. }
                | RefreshError::AuthorizationCodeExtraction { .. }
                | RefreshError::TokenExchange(_)
        )
    }

    /// Short stage label used in diagnostics and structured logs.
    pub fn stage(&self) -> &'static str {
        match self {
            RefreshError::Configuration { .. } | RefreshError::InvalidSetting { .. } => {
                "configuration"
            }
            RefreshError::InvalidSecret(_) => "totp",
            RefreshError::LoginStepTimeout { step } | RefreshError::Browser { step, .. } => {
                step.as_str()
            }
            RefreshError::AuthorizationCodeExtraction { .. } => "extract_authorization_code",
            RefreshError::TokenExchange(_) => "token_exchange",
            RefreshError::Persistence(_) => "persistence",
            RefreshError::Cancelled => "cancelled",
        }
    }

    pub fn missing(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        RefreshError::Configuration {
            missing: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<sqlx::Error> for RefreshError {
    fn from(err: sqlx::Error) -> Self {
        RefreshError::Persistence(err.into())
    }
}
