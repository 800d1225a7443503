use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lib_feedlink::{BasicAuthenticator, FeedConfig, JsonCodec, Session, TcpTransport};
use tokio::signal;

mod consumer_logic;
use consumer_logic::{config, logger, monitor};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::load_config();
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    // 1. Policy document
    let feed = FeedConfig::load(&settings.feed_config_path)
        .with_context(|| format!("loading {}", settings.feed_config_path.display()))?;
    let session_config = feed.session_config()?;
    log::info!(
        "Feed configuration: {} channel(s), {} warm standby group(s), {} item(s)",
        session_config.catalog.channel_set().len(),
        session_config.catalog.warm_standby_groups().len(),
        feed.items.len()
    );

    // 2. Transport, with proxy credentials when tunneled channels need them
    let mut transport = TcpTransport::new();
    if let Some((user, password)) = &settings.proxy_credentials {
        transport = transport.with_authenticator(Arc::new(BasicAuthenticator::new(user, password)));
    }

    // 3. Session and subscriptions
    let (session, notifications) = Session::start(session_config, Arc::new(transport), Arc::new(JsonCodec))?;
    for key in feed.items.iter().cloned() {
        let name = key.name.clone();
        match session.open_item(key).await {
            Ok(handle) => log::info!("Subscribed {} as item {}", name, handle),
            Err(e) => log::error!("Failed to subscribe {}: {}", name, e),
        }
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let status_every = (settings.status_interval_seconds > 0).then(|| Duration::from_secs(settings.status_interval_seconds));
    let mut monitor_handle = tokio::spawn(monitor::run(session.clone(), notifications, status_every, shutdown_tx.subscribe()));

    // Wait for a shutdown signal, or for the channel to go down for good
    let monitor_done = tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
            false
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => false,
        _ = &mut monitor_handle => {
            log::warn!("Every feed server failed, shutting down.");
            true
        }
    };

    if let Err(e) = session.shutdown().await {
        log::warn!("Session already closed: {}", e);
    }
    if !monitor_done {
        let _ = shutdown_tx.send(());
        let _ = monitor_handle.await;
    }

    log::info!("Shutdown complete.");
    Ok(())
}
