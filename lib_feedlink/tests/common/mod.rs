//! Shared fixtures for the session tests: an in-memory transport whose
//! "servers" answer every request with a complete refresh naming themselves.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use lib_feedlink::catalog::{ServerInfo, WarmStandbyGroup, WarmStandbyMode};
use lib_feedlink::codec::WireMessage;
use lib_feedlink::transport::BoxedIo;
use lib_feedlink::{
    ChannelCatalog, ChannelConfig, ChannelEvent, ConnectError, ItemEvent, ItemHandle, Notification, ReconnectOptions,
    Transport,
};

#[derive(Default)]
pub struct MemoryTransport {
    reachable: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    muted: Arc<Mutex<HashSet<String>>>,
    live: Mutex<Vec<(String, CancellationToken)>>,
    opened: Mutex<Vec<String>>,
    received: Arc<Mutex<Vec<(String, WireMessage)>>>,
}

impl MemoryTransport {
    pub fn new(reachable: &[&str]) -> Arc<Self> {
        let transport = Self::default();
        transport.reachable.lock().unwrap().extend(reachable.iter().map(|s| s.to_string()));
        Arc::new(transport)
    }

    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut set = self.reachable.lock().unwrap();
        if reachable {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Every connect to `name` waits this long before succeeding or failing.
    pub fn set_delay(&self, name: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    /// The server records requests but stops answering them.
    pub fn set_muted(&self, name: &str, muted: bool) {
        let mut set = self.muted.lock().unwrap();
        if muted {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Drops every live connection to `name` from the server side.
    pub fn kill(&self, name: &str) {
        for (server, token) in self.live.lock().unwrap().iter() {
            if server == name {
                token.cancel();
            }
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    /// Messages the server named `name` received, in order.
    pub fn received_by(&self, name: &str) -> Vec<WireMessage> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(server, _)| server == name)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn open<'a>(&'a self, channel: &'a ChannelConfig) -> BoxFuture<'a, Result<BoxedIo, ConnectError>> {
        Box::pin(async move {
            self.opened.lock().unwrap().push(channel.name.clone());

            let delay = self.delays.lock().unwrap().get(&channel.name).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if !self.reachable.lock().unwrap().contains(&channel.name) {
                return Err(ConnectError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)));
            }

            let (client, server) = tokio::io::duplex(64 * 1024);
            let kill = CancellationToken::new();
            self.live.lock().unwrap().push((channel.name.clone(), kill.clone()));
            tokio::spawn(serve(
                channel.name.clone(),
                server,
                kill,
                Arc::clone(&self.received),
                Arc::clone(&self.muted),
            ));
            Ok(Box::new(client) as BoxedIo)
        })
    }
}

async fn serve(
    name: String,
    io: DuplexStream,
    kill: CancellationToken,
    received: Arc<Mutex<Vec<(String, WireMessage)>>>,
    muted: Arc<Mutex<HashSet<String>>>,
) {
    let mut framed = Framed::new(io, LengthDelimitedCodec::new());
    loop {
        tokio::select! {
            _ = kill.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => {
                    let Ok(msg) = WireMessage::from_slice(&bytes) else { continue };
                    received.lock().unwrap().push((name.clone(), msg.clone()));
                    if muted.lock().unwrap().contains(&name) {
                        continue;
                    }
                    if let WireMessage::Request { stream_id, key } = msg {
                        let reply = WireMessage::Refresh {
                            stream_id,
                            complete: true,
                            state: None,
                            payload: json!({ "server": name, "item": key.name }),
                        };
                        if framed.send(reply.to_bytes().unwrap()).await.is_err() {
                            break;
                        }
                    }
                }
                _ => break,
            },
        }
    }
}

// --- Builders ---

pub fn channel(name: &str) -> ChannelConfig {
    ChannelConfig::new(name, &format!("{}.feed", name.to_lowercase()), 14002)
}

pub fn plain_catalog(names: &[&str]) -> ChannelCatalog {
    ChannelCatalog::new(names.iter().map(|n| channel(n)).collect(), vec![])
}

/// ChannelSet [A, B, C] plus WSB1 = (active A, standby B).
pub fn wsb_catalog() -> ChannelCatalog {
    let group = WarmStandbyGroup {
        name: "WSB1".to_string(),
        starting_active: ServerInfo::new(channel("ChannelA")),
        standby: vec![ServerInfo::new(channel("ChannelB"))],
        mode: WarmStandbyMode::LoginBased,
    };
    ChannelCatalog::new(vec![channel("ChannelA"), channel("ChannelB"), channel("ChannelC")], vec![group])
}

/// Like `wsb_catalog`, but WSB1 is service based: A serves ELEKTRON_DD and
/// B serves DIRECT_FEED.
pub fn service_wsb_catalog() -> ChannelCatalog {
    let group = WarmStandbyGroup {
        name: "WSB1".to_string(),
        starting_active: ServerInfo::new(channel("ChannelA")).with_services(["ELEKTRON_DD"]),
        standby: vec![ServerInfo::new(channel("ChannelB")).with_services(["DIRECT_FEED"])],
        mode: WarmStandbyMode::ServiceBased,
    };
    ChannelCatalog::new(vec![channel("ChannelA"), channel("ChannelB"), channel("ChannelC")], vec![group])
}

pub fn fast_reconnect(limit: i64) -> ReconnectOptions {
    ReconnectOptions {
        initialization_timeout: Duration::from_secs(5),
        reconnect_min_delay: Duration::from_millis(100),
        reconnect_max_delay: Duration::from_millis(400),
        reconnect_attempt_limit: limit,
    }
}

// --- Notification helpers ---

/// Waits for the first notification matching `pred`, skipping the rest.
pub async fn expect<F>(rx: &mut UnboundedReceiver<Notification>, what: &str, mut pred: F) -> Notification
where
    F: FnMut(&Notification) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(300), async {
        while let Some(notification) = rx.recv().await {
            if pred(&notification) {
                return Some(notification);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(notification)) => notification,
        Ok(None) => panic!("notification stream ended while waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

pub async fn expect_channel_up(rx: &mut UnboundedReceiver<Notification>, target: &str) {
    let wanted = target.to_string();
    expect(rx, &format!("ChannelUp {}", target), |n| {
        matches!(n, Notification::Channel(ChannelEvent::ChannelUp { target }) if *target == wanted)
    })
    .await;
}

/// Waits for a complete refresh of `handle` served by `server`.
pub async fn expect_refresh_from(rx: &mut UnboundedReceiver<Notification>, handle: ItemHandle, server: &str) {
    expect(rx, &format!("refresh of {} from {}", handle, server), |n| {
        matches!(n, Notification::Item(ItemEvent::Refresh { handle: h, payload, .. })
            if *h == handle && payload["server"] == server)
    })
    .await;
}

/// Everything already queued, without waiting.
pub fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

/// Polls `cond` on the (possibly paused) tokio clock.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}
