//! Narrow UI-automation interface the login driver runs against.
//!
//! The driver only ever needs to open a page, wait for an element to become
//! clickable, type into it, click, and read the current URL. Any backend that
//! can do those six things can host the login; [`chromium`] is the production
//! one.

pub mod chromium;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

/// CSS selector for an element on the login surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator(&'static str);

impl Locator {
    pub const fn css(selector: &'static str) -> Self {
        Self(selector)
    }

    pub fn selector(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// One live browsing surface. Owned by a single login attempt.
#[async_trait]
pub trait BrowserSession: Send {
    type Element: Send + Sync;

    async fn open(&mut self, url: &str) -> Result<(), AutomationError>;

    /// Waits until `locator` is present, visible and enabled.
    async fn wait_clickable(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Self::Element, AutomationError>;

    async fn type_text(&mut self, element: &Self::Element, text: &str)
        -> Result<(), AutomationError>;

    async fn click(&mut self, locator: &Locator) -> Result<(), AutomationError>;

    async fn current_url(&mut self) -> Result<Option<String>, AutomationError>;

    /// Releases the underlying browser. Safe to call more than once.
    async fn close(&mut self) -> Result<(), AutomationError>;
}

/// Creates a fresh [`BrowserSession`] for each login attempt.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    type Session: BrowserSession;

    async fn launch(&self) -> Result<Self::Session, AutomationError>;
}
