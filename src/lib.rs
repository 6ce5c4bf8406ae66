use config::Config;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod error;
pub mod keys;
pub mod message;
pub mod queue;
pub mod reaper;
pub mod store;

pub use error::Error;
pub use message::Message;
pub use queue::MessageQueue;

/// Returns a builder for the reaper daemon.
///
/// Connects to the configured store and reaps expired leases until Ctrl-C.
/// Configuration is read from the environment unless one is supplied.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LEASEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LEASEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    tracing::info!(
        backend = ?config.backend,
        interval = ?config.reaper_interval(),
        dead_letter_queue = %config.dead_letter_queue,
        "starting reaper"
    );

    let queue = MessageQueue::connect_with().config(config).call().await?;

    let reaper = queue.spawn_reaper();

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");

    reaper.shutdown().await;
    queue.close().await?;

    Ok(())
}
