use std::process::ExitCode;

use anyhow::anyhow;
use chrono::Utc;
use kite_token_refresher::{
    config::Config,
    repositories::{PgTokenStore, TokenStore},
    utils::in_timezone,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kite_token_refresher=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load()?;
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
    let store = PgTokenStore::new(
        database_url,
        config.db_connect_timeout(),
        config.updated_by.clone(),
    );

    let Some(record) = store.find(&config.owner_key).await? else {
        println!("{}: missing", config.owner_key);
        return Ok(ExitCode::FAILURE);
    };

    let now = Utc::now();
    let state = if record.is_usable_at(now) {
        "active"
    } else if !record.is_active {
        "inactive"
    } else {
        "expired"
    };
    println!(
        "{}: {} (updated {} by {}, expires {})",
        record.owner_key,
        state,
        in_timezone(record.updated_at, &config.time_zone),
        record.updated_by,
        in_timezone(record.expires_at, &config.time_zone),
    );

    if record.is_usable_at(now) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
