use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    element::Element,
    Page,
};
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::{AutomationError, BrowserLauncher, BrowserSession, Locator};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct ChromiumOptions {
    pub executable: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    pub headless: bool,
}

/// Launches Chrome/Chromium over the DevTools protocol, one process per session.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    options: ChromiumOptions,
    poll_interval: Duration,
}

impl ChromiumLauncher {
    pub fn new(options: ChromiumOptions) -> Self {
        Self {
            options,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    fn browser_config(&self) -> anyhow::Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if let Some(path) = &self.options.executable {
            builder = builder.chrome_executable(path);
        }
        if let Some(dir) = &self.options.user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        builder = if self.options.headless {
            builder.no_sandbox().arg("--disable-dev-shm-usage")
        } else {
            builder.with_head()
        };
        builder
            .build()
            .map_err(|e| anyhow!("Failed to configure browser: {e}"))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    type Session = ChromiumSession;

    async fn launch(&self) -> Result<Self::Session, AutomationError> {
        let config = self.browser_config()?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;
        let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                if let Err(close_err) = browser.close().await {
                    tracing::warn!(error = %close_err, "Failed to close browser after tab error");
                }
                handler_task.abort();
                return Err(anyhow::Error::new(err)
                    .context("Failed to open browser tab")
                    .into());
            }
        };

        tracing::debug!(headless = self.options.headless, "Browser launched");
        Ok(ChromiumSession {
            browser: Some(browser),
            handler_task,
            page,
            poll_interval: self.poll_interval,
        })
    }
}

pub struct ChromiumSession {
    browser: Option<Browser>,
    handler_task: JoinHandle<()>,
    page: Page,
    poll_interval: Duration,
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

fn clickable_script(locator: &Locator) -> anyhow::Result<String> {
    let selector = serde_json::to_string(locator.selector()).context("Failed to encode selector")?;
    Ok(format!(
        r#"(function() {{
      const el = document.querySelector({selector});
      if (!el) return false;
      const rect = el.getBoundingClientRect();
      const style = window.getComputedStyle(el);
      return rect.width > 0 && rect.height > 0
        && style.visibility !== 'hidden' && style.display !== 'none'
        && !el.disabled;
    }})()"#
    ))
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    type Element = Element;

    async fn open(&mut self, url: &str) -> Result<(), AutomationError> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Failed to open {url}"))?;
        Ok(())
    }

    async fn wait_clickable(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<Self::Element, AutomationError> {
        let script = clickable_script(locator)?;
        let deadline = Instant::now() + timeout;
        loop {
            // Evaluation fails while a navigation swaps the document; treat as not ready.
            let ready = match self.page.evaluate(script.as_str()).await {
                Ok(result) => result.into_value::<bool>().unwrap_or(false),
                Err(err) => {
                    tracing::debug!(%locator, error = %err, "Clickable check failed");
                    false
                }
            };
            if ready {
                let element = self
                    .page
                    .find_element(locator.selector())
                    .await
                    .with_context(|| format!("Failed to locate {locator}"))?;
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(AutomationError::Timeout {
                    what: format!("{locator} to become clickable"),
                    after: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn type_text(
        &mut self,
        element: &Self::Element,
        text: &str,
    ) -> Result<(), AutomationError> {
        element.click().await.context("Failed to focus input")?;
        element
            .type_str(text)
            .await
            .context("Failed to type into input")?;
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), AutomationError> {
        let element = self
            .page
            .find_element(locator.selector())
            .await
            .with_context(|| format!("Failed to locate {locator}"))?;
        element
            .click()
            .await
            .with_context(|| format!("Failed to click {locator}"))?;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<Option<String>, AutomationError> {
        let url = self.page.url().await.context("Failed to read page URL")?;
        Ok(url)
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        let Some(mut browser) = self.browser.take() else {
            return Ok(());
        };
        let closed = browser.close().await;
        if let Err(err) = browser.wait().await {
            tracing::debug!(error = %err, "Browser process wait failed");
        }
        self.handler_task.abort();
        closed.context("Failed to close browser")?;
        tracing::debug!("Browser closed");
        Ok(())
    }
}
