use std::time::Duration;

use lib_feedlink::{ChannelEvent, ItemEvent, Notification, Session};
use tokio::sync::{broadcast, mpsc};

/// One log line for a notification, with the level it deserves.
pub fn describe(notification: &Notification) -> (log::Level, String) {
    match notification {
        Notification::Item(ItemEvent::Refresh { handle, payload, complete, status }) => (
            log::Level::Info,
            format!(
                "Refresh item {} ({:?}/{:?}{}): {}",
                handle,
                status.stream_state,
                status.data_state,
                if *complete { "" } else { ", partial" },
                payload
            ),
        ),
        Notification::Item(ItemEvent::Update { handle, payload }) => {
            (log::Level::Debug, format!("Update item {}: {}", handle, payload))
        }
        Notification::Item(ItemEvent::Status { handle, status }) => (
            log::Level::Warn,
            format!("Status item {} {:?}/{:?}: {}", handle, status.stream_state, status.data_state, status.text),
        ),
        Notification::Channel(ChannelEvent::ChannelUp { target }) => {
            (log::Level::Info, format!("Channel up on {}", target))
        }
        Notification::Channel(ChannelEvent::ChannelDownReconnecting { target, reason }) => {
            (log::Level::Warn, format!("Channel down on {} ({}), reconnecting", target, reason))
        }
        Notification::Channel(ChannelEvent::ChannelDown { error }) => {
            (log::Level::Error, format!("Channel down, every server failed: {}", error))
        }
        Notification::Channel(ChannelEvent::PreferredHostStartingFallback { from, to }) => (
            log::Level::Info,
            format!("Falling back from {} to preferred host {}", from.as_deref().unwrap_or("nothing"), to),
        ),
        Notification::Channel(ChannelEvent::PreferredHostComplete { active }) => (
            log::Level::Info,
            format!("Preferred host fallback complete, active on {}", active.as_deref().unwrap_or("nothing")),
        ),
        Notification::Channel(ChannelEvent::Failover(event)) => (
            log::Level::Info,
            format!(
                "Failover ({:?}) {} -> {}",
                event.cause,
                event.from_target.as_deref().unwrap_or("nothing"),
                event.to_target
            ),
        ),
        Notification::Channel(ChannelEvent::Warning { text }) => (log::Level::Warn, format!("Channel warning: {}", text)),
    }
}

/// Logs every notification and, every `status_every`, the channel information.
/// Returns on `ChannelDown`, when the notification stream ends, or on shutdown.
pub async fn run(
    session: Session,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    status_every: Option<Duration>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut status_interval = status_every.map(tokio::time::interval);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor received shutdown signal.");
                break;
            }
            notification = notifications.recv() => match notification {
                Some(notification) => {
                    let (level, line) = describe(&notification);
                    log::log!(level, "{}", line);
                    if matches!(notification, Notification::Channel(ChannelEvent::ChannelDown { .. })) {
                        break;
                    }
                }
                None => break,
            },
            _ = async {
                match status_interval.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                match session.channel_information().await {
                    Ok(info) => match serde_json::to_string(&info) {
                        Ok(json) => log::info!("Channel status: {}", json),
                        Err(e) => log::warn!("Failed to serialize channel status: {}", e),
                    },
                    Err(e) => {
                        log::warn!("Channel status unavailable: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
