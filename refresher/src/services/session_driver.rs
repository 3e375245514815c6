//! Scripted Kite login: credentials, TOTP, then the `request_token` redirect.

use std::{sync::Arc, time::Duration};

use crate::browser::{AutomationError, BrowserLauncher, BrowserSession, Locator};
use crate::error::{LoginStep, RefreshError};
use crate::models::{
    authorization_code::REQUEST_TOKEN_MARKER, AuthorizationCode, Credentials,
};
use crate::utils::{totp, Clock, Sleeper};

pub const USER_ID_INPUT: Locator = Locator::css("input#userid");
pub const PASSWORD_INPUT: Locator = Locator::css("input#password");
pub const TOTP_INPUT: Locator = Locator::css("input#totp");
pub const SUBMIT_BUTTON: Locator = Locator::css(r#"button[type="submit"]"#);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTimeouts {
    /// Upper bound for each element to become clickable.
    pub element_wait: Duration,
    /// Upper bound for the redirect carrying `request_token`.
    pub redirect_wait: Duration,
    pub redirect_poll: Duration,
    /// Pause for the credential form to hand over to the TOTP form.
    pub settle_delay: Duration,
    pub before_totp_submit: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        Self {
            element_wait: Duration::from_secs(20),
            redirect_wait: Duration::from_secs(20),
            redirect_poll: Duration::from_millis(500),
            settle_delay: Duration::from_secs(2),
            before_totp_submit: Duration::from_secs(1),
        }
    }
}

pub struct SessionDriver<L: BrowserLauncher> {
    launcher: L,
    timeouts: DriverTimeouts,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl<L: BrowserLauncher> SessionDriver<L> {
    pub fn new(
        launcher: L,
        timeouts: DriverTimeouts,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            launcher,
            timeouts,
            clock,
            sleeper,
        }
    }

    /// Runs one login in a fresh browser session and returns the redirect's code.
    ///
    /// The session is closed on every path out of this function.
    pub async fn run_login(
        &self,
        login_url: &str,
        creds: &Credentials,
    ) -> Result<AuthorizationCode, RefreshError> {
        let mut session = self
            .launcher
            .launch()
            .await
            .map_err(|err| step_error(LoginStep::LaunchBrowser, err))?;

        let result = self.drive(&mut session, login_url, creds).await;

        if let Err(err) = session.close().await {
            tracing::warn!(error = %err, "Failed to close browser session");
        }
        result
    }

    async fn drive(
        &self,
        session: &mut L::Session,
        login_url: &str,
        creds: &Credentials,
    ) -> Result<AuthorizationCode, RefreshError> {
        tracing::info!(user_id = %creds.user_id(), "Opening Kite login page");
        session
            .open(login_url)
            .await
            .map_err(|err| step_error(LoginStep::OpenLoginPage, err))?;

        self.fill(session, LoginStep::EnterUserId, &USER_ID_INPUT, creds.user_id())
            .await?;
        self.fill(session, LoginStep::EnterPassword, &PASSWORD_INPUT, creds.password())
            .await?;
        session
            .click(&SUBMIT_BUTTON)
            .await
            .map_err(|err| step_error(LoginStep::SubmitCredentials, err))?;

        self.sleeper.sleep(self.timeouts.settle_delay).await;

        let totp_input = session
            .wait_clickable(&TOTP_INPUT, self.timeouts.element_wait)
            .await
            .map_err(|err| step_error(LoginStep::EnterTotp, err))?;
        // Computed only once the field is ready so the code is as fresh as possible.
        let now = self.clock.now();
        let code = totp::current_code(creds.totp_secret(), now)?;
        tracing::debug!(
            valid_for_secs = totp::seconds_remaining(now),
            "Generated one-time code"
        );
        session
            .type_text(&totp_input, &code)
            .await
            .map_err(|err| step_error(LoginStep::EnterTotp, err))?;

        self.sleeper.sleep(self.timeouts.before_totp_submit).await;
        session
            .click(&SUBMIT_BUTTON)
            .await
            .map_err(|err| step_error(LoginStep::SubmitTotp, err))?;

        let redirect = self.await_redirect(session).await?;
        let code = AuthorizationCode::from_redirect_url(&redirect)?;
        tracing::info!("Login redirect received");
        Ok(code)
    }

    async fn fill(
        &self,
        session: &mut L::Session,
        step: LoginStep,
        locator: &Locator,
        text: &str,
    ) -> Result<(), RefreshError> {
        let element = session
            .wait_clickable(locator, self.timeouts.element_wait)
            .await
            .map_err(|err| step_error(step, err))?;
        session
            .type_text(&element, text)
            .await
            .map_err(|err| step_error(step, err))
    }

    /// Polls the current URL until it carries the `request_token` marker.
    async fn await_redirect(&self, session: &mut L::Session) -> Result<String, RefreshError> {
        let poll = self.timeouts.redirect_poll.max(Duration::from_millis(1));
        let max_polls = self.timeouts.redirect_wait.as_millis() / poll.as_millis();

        for polled in 0..=max_polls {
            let url = session
                .current_url()
                .await
                .map_err(|err| step_error(LoginStep::AwaitRedirect, err))?;
            if let Some(url) = url.filter(|url| url.contains(REQUEST_TOKEN_MARKER)) {
                return Ok(url);
            }
            if polled < max_polls {
                self.sleeper.sleep(poll).await;
            }
        }

        Err(RefreshError::LoginStepTimeout {
            step: LoginStep::AwaitRedirect,
        })
    }
}

fn step_error(step: LoginStep, err: AutomationError) -> RefreshError {
    match err {
        AutomationError::Timeout { .. } => RefreshError::LoginStepTimeout { step },
        AutomationError::Backend(cause) => RefreshError::Browser { step, cause },
    }
}
