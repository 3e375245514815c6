use std::{io, process::ExitCode, sync::Arc, time::Duration};

use kite_token_refresher::{
    browser::chromium::{ChromiumLauncher, ChromiumOptions},
    config::Config,
    error::RefreshError,
    repositories::{MemoryTokenStore, PgTokenStore, TokenStore},
    services::{
        credentials::CredentialProvider,
        login::{finish, LoginOrchestrator, RetryPolicy, EXIT_FAILURE},
        session_driver::{DriverTimeouts, SessionDriver},
        token_exchange::KiteTokenExchanger,
    },
    settings::Settings,
    utils::{mask_secret, Clock, Sleeper, SystemClock, TokioSleeper},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout is reserved for the token.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kite_token_refresher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("Token refresh aborted: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let config = Config::load()?;
    let (settings, settings_source) = Settings::load(config.settings_path.as_deref())?;

    let prefix = settings.credential_prefix(&config.user_key);
    let credentials = CredentialProvider::from_env(prefix);

    let missing: Vec<&str> = config
        .missing_required()
        .into_iter()
        .chain(credentials.missing())
        .collect();
    if !missing.is_empty() {
        let err = RefreshError::missing(missing);
        tracing::error!(stage = err.stage(), "{err}");
        return Ok(ExitCode::from(EXIT_FAILURE));
    }

    let masked_database_url = config
        .database_url
        .as_deref()
        .map(mask_secret)
        .unwrap_or_else(|| "<unset>".into());
    tracing::info!(
        database_url = %masked_database_url,
        owner_key = %config.owner_key,
        user_key = %config.user_key,
        credential_prefix = prefix.unwrap_or("<none>"),
        settings = ?settings_source,
        exchanges = ?settings.exchanges,
        headless = config.headless,
        max_attempts = config.max_attempts,
        time_zone = %config.time_zone,
        dry_run = config.dry_run,
        "Loaded configuration from environment/.env"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

    let launcher = ChromiumLauncher::new(ChromiumOptions {
        executable: settings.chrome_executable(),
        user_data_dir: settings.chrome_user_data_dir(),
        headless: config.headless,
    });
    let timeouts = DriverTimeouts {
        element_wait: Duration::from_secs(config.element_timeout_seconds),
        redirect_wait: Duration::from_secs(config.redirect_timeout_seconds),
        ..DriverTimeouts::default()
    };
    let driver = SessionDriver::new(launcher, timeouts, clock.clone(), sleeper.clone());
    let exchanger = KiteTokenExchanger::new(
        &config.api_base_url,
        config.http_timeout(),
        config.owner_key.clone(),
        clock,
    )?;

    let store: Box<dyn TokenStore> = match config.database_url.as_deref() {
        Some(url) if !config.dry_run => {
            let store = PgTokenStore::new(
                url,
                config.db_connect_timeout(),
                config.updated_by.clone(),
            );
            // A failure here resurfaces on the write; the login still runs.
            if let Err(err) = store.migrate().await {
                tracing::error!(stage = err.stage(), "Could not prepare the token table: {err}");
            }
            Box::new(store)
        }
        _ => {
            tracing::warn!("DRY_RUN set; the token will not be written to the database");
            Box::new(MemoryTokenStore::new(config.updated_by.clone()))
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping before the next attempt");
            on_interrupt.cancel();
        }
    });

    let policy = RetryPolicy {
        max_attempts: config.max_attempts,
        delay: config.retry_delay(),
    };
    let mut orchestrator = LoginOrchestrator::new(
        credentials,
        driver,
        Box::new(exchanger),
        config.login_base_url.clone(),
        policy,
        sleeper,
    )
    .with_cancellation(cancel);

    let result = orchestrator
        .acquire_and_persist(store.as_ref(), &config.owner_key)
        .await;

    let code = finish(result, &config.time_zone, &mut io::stdout().lock());
    Ok(ExitCode::from(code))
}
