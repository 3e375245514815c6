//! Login orchestration: bounded retries around login + exchange, then one store write.
//!
//! ```text
//! Idle -> Attempting{1} -> Attempting{2} -> ... -> Succeeded | Failed
//! ```
//!
//! Credentials are loaded once, before the first attempt, so configuration
//! problems fail immediately. Each attempt runs a complete browser login and
//! exchange because an authorization code cannot be exchanged twice.

use std::{io::Write, sync::Arc, time::Duration};

use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::browser::BrowserLauncher;
use crate::error::RefreshError;
use crate::models::{AccessToken, Credentials, UpsertOutcome};
use crate::repositories::TokenStore;
use crate::services::credentials::CredentialProvider;
use crate::services::session_driver::SessionDriver;
use crate::services::token_exchange::{self, TokenExchanger};
use crate::utils::{in_timezone, Sleeper};

pub const EXIT_SUCCESS: u8 = 0;
/// Configuration error, bad secret, exhausted retries or cancellation. Nothing on stdout.
pub const EXIT_FAILURE: u8 = 1;
/// Token printed, but the store write failed.
pub const EXIT_NOT_PERSISTED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    Attempting { attempt: u32 },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct LoginReport {
    pub token: AccessToken,
    pub attempts: u32,
}

/// Result of a full run. The token is valid even when `persistence` failed.
#[derive(Debug)]
pub struct RunOutcome {
    pub token: AccessToken,
    pub attempts: u32,
    pub persistence: Result<UpsertOutcome, RefreshError>,
}

pub struct LoginOrchestrator<L: BrowserLauncher> {
    credentials: CredentialProvider,
    driver: SessionDriver<L>,
    exchanger: Box<dyn TokenExchanger>,
    login_base_url: String,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    state: LoginState,
    transitions: Vec<LoginState>,
}

impl<L: BrowserLauncher> LoginOrchestrator<L> {
    pub fn new(
        credentials: CredentialProvider,
        driver: SessionDriver<L>,
        exchanger: Box<dyn TokenExchanger>,
        login_base_url: impl Into<String>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            credentials,
            driver,
            exchanger,
            login_base_url: login_base_url.into(),
            policy,
            sleeper,
            cancel: CancellationToken::new(),
            state: LoginState::Idle,
            transitions: vec![LoginState::Idle],
        }
    }

    /// Stops the run at the next attempt boundary or during the retry delay.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn transitions(&self) -> &[LoginState] {
        &self.transitions
    }

    /// Acquires a token and writes it to `store` under `owner_key`.
    ///
    /// The store is called only after a successful acquisition, and a store
    /// failure never triggers another login.
    pub async fn acquire_and_persist(
        &mut self,
        store: &dyn TokenStore,
        owner_key: &str,
    ) -> Result<RunOutcome, RefreshError> {
        let report = self.acquire_token().await?;

        let persistence = store.upsert(&report.token, owner_key).await;
        match &persistence {
            Ok(outcome) => tracing::info!(
                owner_key,
                matched = outcome.matched_count,
                modified = outcome.modified_count,
                "Access token persisted"
            ),
            Err(err) => tracing::error!(
                owner_key,
                error = %err,
                "Access token obtained but could not be persisted"
            ),
        }

        Ok(RunOutcome {
            token: report.token,
            attempts: report.attempts,
            persistence,
        })
    }

    pub async fn acquire_token(&mut self) -> Result<LoginReport, RefreshError> {
        let creds = match self.credentials.load() {
            Ok(creds) => creds,
            Err(err) => return Err(self.fail(0, err)),
        };
        let login_url = match token_exchange::login_url(&self.login_base_url, creds.api_key()) {
            Ok(url) => url,
            Err(err) => return Err(self.fail(0, err)),
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.fail(attempt, RefreshError::Cancelled));
            }
            attempt += 1;
            self.transition(LoginState::Attempting { attempt });

            let span = tracing::info_span!("login_attempt", attempt, max_attempts);
            match self.attempt(&login_url, &creds).instrument(span).await {
                Ok(token) => {
                    self.transition(LoginState::Succeeded { attempts: attempt });
                    tracing::info!(attempts = attempt, "Access token acquired");
                    return Ok(LoginReport {
                        token,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        stage = err.stage(),
                        error = %err,
                        "Login attempt failed, retrying"
                    );
                    let cancelled = tokio::select! {
                        _ = self.sleeper.sleep(self.policy.delay) => false,
                        _ = self.cancel.cancelled() => true,
                    };
                    if cancelled {
                        return Err(self.fail(attempt, RefreshError::Cancelled));
                    }
                }
                Err(err) => return Err(self.fail(attempt, err)),
            }
        }
    }

    async fn attempt(
        &self,
        login_url: &str,
        creds: &Credentials,
    ) -> Result<AccessToken, RefreshError> {
        let code = self.driver.run_login(login_url, creds).await?;
        self.exchanger
            .exchange(&code, creds.api_key(), creds.api_secret())
            .await
    }

    fn transition(&mut self, next: LoginState) {
        tracing::debug!(from = ?self.state, to = ?next, "Login state transition");
        self.state = next;
        self.transitions.push(next);
    }

    fn fail(&mut self, attempts: u32, err: RefreshError) -> RefreshError {
        tracing::error!(attempts, stage = err.stage(), error = %err, "Login failed");
        self.transition(LoginState::Failed { attempts });
        err
    }
}

/// Writes the bare token value, nothing else, to `out`.
pub fn emit_token<W: Write>(out: &mut W, token: &AccessToken) -> std::io::Result<()> {
    out.write_all(token.value.as_bytes())?;
    out.flush()
}

/// Maps a finished run to the process contract: the token on `out` whenever
/// one was obtained, and the exit status.
pub fn finish<W: Write>(
    result: Result<RunOutcome, RefreshError>,
    time_zone: &Tz,
    out: &mut W,
) -> u8 {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(stage = err.stage(), "Could not obtain an access token: {err}");
            return EXIT_FAILURE;
        }
    };

    if let Err(err) = emit_token(out, &outcome.token) {
        tracing::error!(error = %err, "Failed to write token to stdout");
        return EXIT_FAILURE;
    }
    tracing::info!(
        attempts = outcome.attempts,
        expires_at = %in_timezone(outcome.token.expires_at, time_zone),
        "Token refresh finished"
    );

    match outcome.persistence {
        Ok(_) => EXIT_SUCCESS,
        Err(err) => {
            tracing::error!(stage = err.stage(), "Token was not saved: {err}");
            EXIT_NOT_PERSISTED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoginStep;
    use crate::repositories::MockTokenStore;
    use crate::services::session_driver::{DriverTimeouts, PASSWORD_INPUT, TOTP_INPUT, USER_ID_INPUT};
    use crate::services::token_exchange::MockTokenExchanger;
    use crate::testing::{
        FakeLauncher, FakeLog, FixedClock, RecordingSleeper, ScriptedAttempt, RFC6238_SECRET,
    };
    use crate::utils::Clock;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    const REDIRECT: &str = "https://example.com/callback?request_token=ABC123&status=success";

    fn env_provider(pairs: &[(&str, &str)]) -> CredentialProvider {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CredentialProvider::with_lookup(None, move |name| vars.get(name).cloned())
    }

    fn full_env() -> CredentialProvider {
        env_provider(&[
            ("ZERODHA_USER_ID", "AB1234"),
            ("ZERODHA_PASSWORD", "pw"),
            ("ZERODHA_TOTP_SECRET", RFC6238_SECRET),
            ("ZERODHA_API_KEY", "key"),
            ("ZERODHA_API_SECRET", "secret"),
        ])
    }

    fn issuing_exchanger(value: &'static str) -> MockTokenExchanger {
        let mut exchanger = MockTokenExchanger::new();
        exchanger
            .expect_exchange()
            .returning(move |code, api_key, api_secret| {
                assert_eq!(code.as_str(), "ABC123");
                assert_eq!(api_key, "key");
                assert_eq!(api_secret, "secret");
                Ok(AccessToken::issue(value, "owner", FixedClock::at_unix(59).now()))
            });
        exchanger
    }

    struct Harness {
        orchestrator: LoginOrchestrator<FakeLauncher>,
        log: Arc<Mutex<FakeLog>>,
        sleeper: Arc<RecordingSleeper>,
    }

    fn harness(
        credentials: CredentialProvider,
        attempts: Vec<ScriptedAttempt>,
        exchanger: MockTokenExchanger,
    ) -> Harness {
        let launcher = FakeLauncher::new(attempts);
        let log = launcher.log();
        let sleeper = Arc::new(RecordingSleeper::default());
        let driver = SessionDriver::new(
            launcher,
            DriverTimeouts::default(),
            Arc::new(FixedClock::at_unix(59)),
            sleeper.clone(),
        );
        let orchestrator = LoginOrchestrator::new(
            credentials,
            driver,
            Box::new(exchanger),
            "https://kite.example/connect/login",
            RetryPolicy::default(),
            sleeper.clone(),
        );
        Harness {
            orchestrator,
            log,
            sleeper,
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_two_failures() {
        let mut h = harness(
            full_env(),
            vec![
                ScriptedAttempt::timeout_on(USER_ID_INPUT),
                ScriptedAttempt::timeout_on(TOTP_INPUT),
                ScriptedAttempt::redirect_to(REDIRECT),
            ],
            issuing_exchanger("tok_third"),
        );

        let report = h.orchestrator.acquire_token().await.expect("token");

        assert_eq!(report.attempts, 3);
        assert_eq!(report.token.value, "tok_third");
        assert_eq!(h.log.lock().unwrap().launches, 3);
        assert_eq!(h.log.lock().unwrap().closed, 3);
        assert_eq!(h.orchestrator.state(), LoginState::Succeeded { attempts: 3 });
        assert_eq!(
            h.orchestrator.transitions(),
            &[
                LoginState::Idle,
                LoginState::Attempting { attempt: 1 },
                LoginState::Attempting { attempt: 2 },
                LoginState::Attempting { attempt: 3 },
                LoginState::Succeeded { attempts: 3 },
            ]
        );
        let retry_delays = h
            .sleeper
            .recorded()
            .into_iter()
            .filter(|d| *d == Duration::from_secs(5))
            .count();
        assert_eq!(retry_delays, 2);
    }

    #[tokio::test]
    async fn exhausting_attempts_fails_with_last_error_and_skips_store() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().never();
        let mut h = harness(
            full_env(),
            vec![
                ScriptedAttempt::timeout_on(USER_ID_INPUT),
                ScriptedAttempt::timeout_on(TOTP_INPUT),
                ScriptedAttempt::timeout_on(PASSWORD_INPUT),
            ],
            exchanger,
        );
        let mut store = MockTokenStore::new();
        store.expect_upsert().never();

        let err = h
            .orchestrator
            .acquire_and_persist(&store, "owner")
            .await
            .expect_err("all attempts fail");

        assert!(matches!(
            err,
            RefreshError::LoginStepTimeout {
                step: LoginStep::EnterPassword
            }
        ));
        assert_eq!(h.log.lock().unwrap().launches, 3);
        assert_eq!(h.orchestrator.state(), LoginState::Failed { attempts: 3 });
    }

    #[tokio::test]
    async fn configuration_error_is_not_retried() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().never();
        let mut h = harness(
            env_provider(&[("ZERODHA_USER_ID", "AB1234")]),
            vec![ScriptedAttempt::redirect_to(REDIRECT)],
            exchanger,
        );

        let err = h.orchestrator.acquire_token().await.expect_err("config");

        match err {
            RefreshError::Configuration { missing } => assert_eq!(
                missing,
                vec![
                    "ZERODHA_PASSWORD",
                    "ZERODHA_TOTP_SECRET",
                    "ZERODHA_API_KEY",
                    "ZERODHA_API_SECRET"
                ]
            ),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.log.lock().unwrap().launches, 0);
        assert_eq!(h.orchestrator.state(), LoginState::Failed { attempts: 0 });
    }

    #[tokio::test]
    async fn invalid_secret_aborts_after_first_attempt() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().never();
        let mut h = harness(
            env_provider(&[
                ("ZERODHA_USER_ID", "AB1234"),
                ("ZERODHA_PASSWORD", "pw"),
                ("ZERODHA_TOTP_SECRET", "###"),
                ("ZERODHA_API_KEY", "key"),
                ("ZERODHA_API_SECRET", "secret"),
            ]),
            vec![
                ScriptedAttempt::redirect_to(REDIRECT),
                ScriptedAttempt::redirect_to(REDIRECT),
            ],
            exchanger,
        );

        let err = h.orchestrator.acquire_token().await.expect_err("bad secret");

        assert!(matches!(err, RefreshError::InvalidSecret(_)));
        assert_eq!(h.log.lock().unwrap().launches, 1);
        assert!(h.sleeper.recorded().iter().all(|d| *d != Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn exchange_failure_redoes_the_whole_login() {
        let calls = AtomicUsize::new(0);
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().times(2).returning(move |_, _, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RefreshError::TokenExchange(anyhow::anyhow!(
                    "TokenException: Token is invalid or has expired"
                )))
            } else {
                Ok(AccessToken::issue("tok_retry", "owner", FixedClock::at_unix(59).now()))
            }
        });
        let mut h = harness(
            full_env(),
            vec![
                ScriptedAttempt::redirect_to(REDIRECT),
                ScriptedAttempt::redirect_to(REDIRECT),
            ],
            exchanger,
        );

        let report = h.orchestrator.acquire_token().await.expect("token");

        assert_eq!(report.attempts, 2);
        assert_eq!(report.token.value, "tok_retry");
        assert_eq!(h.log.lock().unwrap().launches, 2);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_the_token_and_does_not_relogin() {
        let mut h = harness(
            full_env(),
            vec![ScriptedAttempt::redirect_to(REDIRECT)],
            issuing_exchanger("tok_unsaved"),
        );
        let mut store = MockTokenStore::new();
        store
            .expect_upsert()
            .times(1)
            .returning(|_, _| Err(RefreshError::Persistence(anyhow::anyhow!("connection refused"))));

        let outcome = h
            .orchestrator
            .acquire_and_persist(&store, "owner")
            .await
            .expect("token obtained");

        assert_eq!(outcome.token.value, "tok_unsaved");
        assert!(matches!(outcome.persistence, Err(RefreshError::Persistence(_))));
        assert_eq!(h.log.lock().unwrap().launches, 1);
    }

    #[tokio::test]
    async fn successful_run_writes_store_once() {
        let mut h = harness(
            full_env(),
            vec![ScriptedAttempt::redirect_to(REDIRECT)],
            issuing_exchanger("tok_saved"),
        );
        let mut store = MockTokenStore::new();
        store
            .expect_upsert()
            .times(1)
            .withf(|token, owner| token.value == "tok_saved" && owner == "owner")
            .returning(|_, _| Ok(UpsertOutcome::inserted()));

        let outcome = h
            .orchestrator
            .acquire_and_persist(&store, "owner")
            .await
            .expect("run");

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.persistence.unwrap(), UpsertOutcome::inserted());
    }

    #[tokio::test]
    async fn cancelled_before_start_never_launches() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().never();
        let h = harness(
            full_env(),
            vec![ScriptedAttempt::redirect_to(REDIRECT)],
            exchanger,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut orchestrator = h.orchestrator.with_cancellation(cancel);

        let err = orchestrator.acquire_token().await.expect_err("cancelled");

        assert!(matches!(err, RefreshError::Cancelled));
        assert_eq!(h.log.lock().unwrap().launches, 0);
    }

    /// Cancels the run as soon as a delay starts, then never finishes sleeping.
    struct CancellingSleeper(CancellationToken);

    #[async_trait]
    impl Sleeper for CancellingSleeper {
        async fn sleep(&self, duration: Duration) {
            if duration == Duration::from_secs(5) {
                self.0.cancel();
                std::future::pending::<()>().await;
            }
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_delay() {
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_exchange().never();
        let launcher = FakeLauncher::new(vec![
            ScriptedAttempt::timeout_on(USER_ID_INPUT),
            ScriptedAttempt::redirect_to(REDIRECT),
        ]);
        let log = launcher.log();
        let cancel = CancellationToken::new();
        let sleeper: Arc<dyn Sleeper> = Arc::new(CancellingSleeper(cancel.clone()));
        let driver = SessionDriver::new(
            launcher,
            DriverTimeouts::default(),
            Arc::new(FixedClock::at_unix(59)),
            sleeper.clone(),
        );
        let mut orchestrator = LoginOrchestrator::new(
            full_env(),
            driver,
            Box::new(exchanger),
            "https://kite.example/connect/login",
            RetryPolicy::default(),
            sleeper,
        )
        .with_cancellation(cancel);

        let err = orchestrator.acquire_token().await.expect_err("cancelled");

        assert!(matches!(err, RefreshError::Cancelled));
        assert_eq!(log.lock().unwrap().launches, 1);
        assert_eq!(orchestrator.state(), LoginState::Failed { attempts: 1 });
    }

    fn run_outcome(persistence: Result<UpsertOutcome, RefreshError>) -> RunOutcome {
        RunOutcome {
            token: AccessToken::issue("tok_xyz", "owner", FixedClock::at_unix(59).now()),
            attempts: 1,
            persistence,
        }
    }

    #[test]
    fn finish_prints_token_and_succeeds() {
        let mut out = Vec::new();
        let code = finish(
            Ok(run_outcome(Ok(UpsertOutcome::inserted()))),
            &chrono_tz::Asia::Kolkata,
            &mut out,
        );
        assert_eq!(code, EXIT_SUCCESS);
        assert_eq!(String::from_utf8(out).unwrap(), "tok_xyz");
    }

    #[test]
    fn finish_prints_nothing_when_acquisition_failed() {
        let mut out = Vec::new();
        let code = finish(
            Err(RefreshError::LoginStepTimeout {
                step: LoginStep::AwaitRedirect,
            }),
            &chrono_tz::Asia::Kolkata,
            &mut out,
        );
        assert_eq!(code, EXIT_FAILURE);
        assert!(out.is_empty());
    }

    #[test]
    fn finish_prints_token_but_flags_unsaved_run() {
        let mut out = Vec::new();
        let code = finish(
            Ok(run_outcome(Err(RefreshError::Persistence(anyhow::anyhow!(
                "connection refused"
            ))))),
            &chrono_tz::Asia::Kolkata,
            &mut out,
        );
        assert_eq!(code, EXIT_NOT_PERSISTED);
        assert_eq!(String::from_utf8(out).unwrap(), "tok_xyz");
    }

    #[test]
    fn emit_token_writes_only_the_value() {
        let token = AccessToken::issue("tok_xyz", "owner", FixedClock::at_unix(59).now());
        let mut out = Vec::new();
        emit_token(&mut out, &token).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "tok_xyz");
    }
}
