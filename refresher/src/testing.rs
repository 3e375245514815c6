//! Scripted fakes for exercising the login flow without a browser or broker.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::browser::{AutomationError, BrowserLauncher, BrowserSession, Locator};
use crate::error::RefreshError;
use crate::models::{AccessToken, AuthorizationCode, Credentials};
use crate::services::token_exchange::TokenExchanger;
use crate::utils::{Clock, Sleeper};

/// Base32 of the RFC 6238 SHA-1 seed `12345678901234567890`.
pub const RFC6238_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

pub fn test_credentials() -> Credentials {
    Credentials::new("AB1234", "pw", RFC6238_SECRET, "key", "secret")
        .expect("test credentials are complete")
}

/// How one fake browser session behaves.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    /// Every step succeeds; after the second submit the URL becomes this value.
    Redirect(String),
    /// Waiting for this element times out.
    TimeoutOn(Locator),
    /// Navigation to the login page fails.
    FailOpen,
    /// The browser cannot be started at all.
    FailLaunch,
}

impl ScriptedAttempt {
    pub fn redirect_to(url: &str) -> Self {
        ScriptedAttempt::Redirect(url.to_string())
    }

    pub fn timeout_on(locator: Locator) -> Self {
        ScriptedAttempt::TimeoutOn(locator)
    }

    pub fn fail_open() -> Self {
        ScriptedAttempt::FailOpen
    }

    pub fn fail_launch() -> Self {
        ScriptedAttempt::FailLaunch
    }
}

#[derive(Debug, Default)]
pub struct FakeLog {
    pub launches: usize,
    pub opened: Vec<String>,
    pub typed: Vec<(String, String)>,
    pub clicks: usize,
    pub closed: usize,
}

pub struct FakeLauncher {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeLauncher {
    pub fn new(attempts: Vec<ScriptedAttempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            log: Arc::new(Mutex::new(FakeLog::default())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<FakeLog>> {
        self.log.clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    type Session = FakeSession;

    async fn launch(&self) -> Result<Self::Session, AutomationError> {
        self.log.lock().expect("fake log").launches += 1;
        let script = self
            .attempts
            .lock()
            .expect("fake attempts")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted attempt left"))?;
        if let ScriptedAttempt::FailLaunch = script {
            return Err(anyhow!("browser binary not found").into());
        }
        Ok(FakeSession {
            script,
            log: self.log.clone(),
            url: None,
            clicks: 0,
            closed: false,
        })
    }
}

pub struct FakeSession {
    script: ScriptedAttempt,
    log: Arc<Mutex<FakeLog>>,
    url: Option<String>,
    clicks: usize,
    closed: bool,
}

#[async_trait]
impl BrowserSession for FakeSession {
    type Element = String;

    async fn open(&mut self, url: &str) -> Result<(), AutomationError> {
        if let ScriptedAttempt::FailOpen = self.script {
            return Err(anyhow!("net::ERR_CONNECTION_REFUSED").into());
        }
        self.log.lock().expect("fake log").opened.push(url.to_string());
        self.url = Some(url.to_string());
        Ok(())
    }

    async fn wait_clickable(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Self::Element, AutomationError> {
        match &self.script {
            ScriptedAttempt::TimeoutOn(blocked) if blocked == locator => {
                Err(AutomationError::Timeout {
                    what: locator.to_string(),
                    after: timeout,
                })
            }
            _ => Ok(locator.selector().to_string()),
        }
    }

    async fn type_text(
        &mut self,
        element: &Self::Element,
        text: &str,
    ) -> Result<(), AutomationError> {
        self.log
            .lock()
            .expect("fake log")
            .typed
            .push((element.clone(), text.to_string()));
        Ok(())
    }

    async fn click(&mut self, _locator: &Locator) -> Result<(), AutomationError> {
        self.clicks += 1;
        self.log.lock().expect("fake log").clicks += 1;
        if self.clicks == 2 {
            if let ScriptedAttempt::Redirect(url) = &self.script {
                self.url = Some(url.clone());
            }
        }
        Ok(())
    }

    async fn current_url(&mut self) -> Result<Option<String>, AutomationError> {
        Ok(self.url.clone())
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        if !self.closed {
            self.closed = true;
            self.log.lock().expect("fake log").closed += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(now)
    }

    pub fn at_unix(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).single().expect("valid timestamp"))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Returns immediately and remembers every requested delay.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeper log").clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleeper log").push(duration);
    }
}

/// Exchanger that always issues `value`, counting calls.
pub struct StaticExchanger {
    value: String,
    owner_key: String,
    clock: Arc<dyn Clock>,
    calls: AtomicUsize,
}

impl StaticExchanger {
    pub fn new(value: &str, owner_key: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            value: value.to_string(),
            owner_key: owner_key.to_string(),
            clock,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchanger for StaticExchanger {
    async fn exchange(
        &self,
        _code: &AuthorizationCode,
        _api_key: &str,
        _api_secret: &str,
    ) -> Result<AccessToken, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::issue(
            self.value.clone(),
            self.owner_key.clone(),
            self.clock.now(),
        ))
    }
}
