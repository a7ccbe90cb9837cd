use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokwatch::{
    handler_fn, AccessToken, AccessTokenEvents, AccessTokenEventsConfig, DurationSecs,
    TokenContainer, TokenState,
};
use tokwatch_clock::{SkewedClock, System};

#[derive(Debug, Parser)]
struct Opts {
    /// Seconds until the demo access token expires
    #[arg(short, long, env, default_value_t = 15, allow_hyphen_values = true)]
    expires_in: i64,

    /// Seconds before expiration at which the "expiring" notification is raised
    #[arg(short, long, env, default_value_t = 5)]
    lead_time: u64,

    /// Offset in seconds applied to the local clock, standing in for server-trusted time
    #[arg(short, long, env, default_value_t = 0, allow_hyphen_values = true)]
    skew: i64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = AccessTokenEventsConfig::new(DurationSecs(opts.lead_time));
    let events = AccessTokenEvents::with_clock(config, SkewedClock::new(System, opts.skew));

    let (tx, mut rx) = mpsc::unbounded_channel();

    let expiring = tx.clone();
    events.add_access_token_expiring(Arc::new(handler_fn(move || {
        expiring.send("expiring")?;
        Ok(())
    })));

    let expired = tx;
    events.add_access_token_expired(Arc::new(handler_fn(move || {
        expired.send("expired")?;
        Ok(())
    })));

    let token = TokenState::new(AccessToken::from_static("demo-access-token"), opts.expires_in);
    tracing::info!(
        token = format_args!("{:#?}", token.access_token()),
        expires_in = opts.expires_in,
        lead_time = opts.lead_time,
        "loading access token"
    );
    events.load(&token).await?;

    while let Some(notification) = rx.recv().await {
        match notification {
            "expiring" => tracing::warn!("access token expiring soon"),
            _ => {
                tracing::error!("access token expired");
                break;
            }
        }
    }

    events.unload();
    Ok(())
}
