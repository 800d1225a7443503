//! # Watchlist
//!
//! The application-visible set of open item requests, kept independently of
//! whichever physical connection is currently carrying them.
//!
//! ## Identity
//! - `ItemHandle`: handed to the application, stable for the stream's whole
//!   life, never reused.
//! - Protocol stream id: only meaningful on the connection it was issued on.
//!   Every (re)binding draws a fresh id from a session-wide counter, so an id
//!   from an old connection can never be mistaken for one on the new one.
//!
//! ## Lifecycle
//! `NotRequested -> WaitingForRefresh -> HasRefresh`, back to
//! `WaitingForRefresh` on every migration or connection loss, and `Closed`
//! (then removed) on an explicit close or a terminal status.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{DataState, Msg, MsgClass, StreamState, StreamStatus};
use crate::error::SessionError;
use crate::transport::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemHandle(pub u64);

impl fmt::Display for ItemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to re-issue a request verbatim on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestKey {
    pub domain: u8,
    pub name: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<Vec<i32>>,
    #[serde(default)]
    pub private_stream: bool,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

fn default_streaming() -> bool {
    true
}

impl RequestKey {
    pub const DOMAIN_MARKET_PRICE: u8 = 6;

    pub fn new(domain: u8, name: &str, service: &str) -> Self {
        Self {
            domain,
            name: name.to_string(),
            service: service.to_string(),
            view: None,
            private_stream: false,
            streaming: true,
        }
    }

    pub fn market_price(name: &str, service: &str) -> Self {
        Self::new(Self::DOMAIN_MARKET_PRICE, name, service)
    }

    pub fn with_view(mut self, fields: Vec<i32>) -> Self {
        self.view = Some(fields);
        self
    }

    pub fn private(mut self) -> Self {
        self.private_stream = true;
        self
    }

    pub fn snapshot(mut self) -> Self {
        self.streaming = false;
        self
    }

    /// Domain, name and service: what makes two requests "the same item".
    pub fn identity(&self) -> (u8, &str, &str) {
        (self.domain, &self.name, &self.service)
    }

    fn identity_owned(&self) -> (u8, String, String) {
        (self.domain, self.name.clone(), self.service.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemState {
    NotRequested,
    WaitingForRefresh,
    HasRefresh,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemStream {
    pub handle: ItemHandle,
    pub key: RequestKey,
    pub state: ItemState,
    stream_id: Option<i32>,
    bound_to: Option<ConnectionId>,
}

impl ItemStream {
    /// Protocol stream id on the connection the item is bound to.
    pub fn stream_id(&self) -> Option<i32> {
        self.stream_id
    }

    pub fn bound_to(&self) -> Option<ConnectionId> {
        self.bound_to
    }
}

/// Diagnostic view of one open item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInfo {
    pub handle: ItemHandle,
    pub name: String,
    pub service: String,
    pub state: ItemState,
    pub stream_id: Option<i32>,
}

/// What the application sees for an individual item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    Refresh { handle: ItemHandle, payload: Value, complete: bool, status: StreamStatus },
    Update { handle: ItemHandle, payload: Value },
    Status { handle: ItemHandle, status: StreamStatus },
}

impl ItemEvent {
    pub fn handle(&self) -> ItemHandle {
        match self {
            ItemEvent::Refresh { handle, .. } | ItemEvent::Update { handle, .. } | ItemEvent::Status { handle, .. } => {
                *handle
            }
        }
    }
}

/// Where requests and closes for the live connection go.
pub trait StreamSink {
    fn connection_id(&self) -> ConnectionId;
    fn request(&self, key: &RequestKey, stream_id: i32) -> bool;
    fn close(&self, stream_id: i32) -> bool;
}

#[derive(Debug, Default)]
pub struct Watchlist {
    // BTreeMap keeps creation order, which is also the replay order
    items: BTreeMap<ItemHandle, ItemStream>,
    by_stream_id: HashMap<i32, ItemHandle>,
    by_identity: HashMap<(u8, String, String), ItemHandle>,
    pending_closes: Vec<ItemHandle>,
    next_handle: u64,
    next_stream_id: i32,
}

impl Watchlist {
    pub fn new() -> Self {
        Self { next_handle: 1, next_stream_id: 5, ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, handle: ItemHandle) -> Option<&ItemStream> {
        self.items.get(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemStream> {
        self.items.values()
    }

    /// Services of every open item.
    pub fn services(&self) -> BTreeSet<String> {
        self.iter().map(|item| item.key.service.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<ItemInfo> {
        self.iter()
            .map(|item| ItemInfo {
                handle: item.handle,
                name: item.key.name.clone(),
                service: item.key.service.clone(),
                state: item.state,
                stream_id: item.stream_id,
            })
            .collect()
    }

    fn allocate_stream_id(&mut self) -> i32 {
        loop {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.checked_add(1).unwrap_or(5);
            // After a wrap, ids still bound to an item are skipped
            if !self.by_stream_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Binds `handle` to a fresh stream id on `sink` and sends the request.
    fn bind(&mut self, handle: ItemHandle, sink: &dyn StreamSink) {
        let stream_id = self.allocate_stream_id();
        let Some(item) = self.items.get_mut(&handle) else { return };
        if let Some(old) = item.stream_id.take() {
            self.by_stream_id.remove(&old);
        }
        item.stream_id = Some(stream_id);
        item.bound_to = Some(sink.connection_id());
        item.state = ItemState::WaitingForRefresh;
        self.by_stream_id.insert(stream_id, handle);

        if !sink.request(&item.key, stream_id) {
            log::warn!("Request for item {} ({}) could not be written to {}", handle, item.key.name, sink.connection_id());
        }
    }

    fn unbind(&mut self, handle: ItemHandle) {
        if let Some(item) = self.items.get_mut(&handle) {
            if let Some(old) = item.stream_id.take() {
                self.by_stream_id.remove(&old);
            }
            item.bound_to = None;
        }
    }

    fn remove(&mut self, handle: ItemHandle) -> Option<ItemStream> {
        let mut item = self.items.remove(&handle)?;
        if let Some(stream_id) = item.stream_id {
            self.by_stream_id.remove(&stream_id);
        }
        if !item.key.private_stream {
            let identity = item.key.identity_owned();
            if self.by_identity.get(&identity) == Some(&handle) {
                self.by_identity.remove(&identity);
            }
        }
        self.pending_closes.retain(|h| *h != handle);
        item.state = ItemState::Closed;
        Some(item)
    }

    /// Registers a new item and, with a live connection, requests it.
    pub fn open(&mut self, key: RequestKey, sink: Option<&dyn StreamSink>) -> Result<ItemHandle, SessionError> {
        if !key.private_stream {
            if let Some(existing) = self.by_identity.get(&key.identity_owned()) {
                return Err(SessionError::DuplicateKey { existing: *existing });
            }
        }

        let handle = ItemHandle(self.next_handle);
        self.next_handle += 1;

        if !key.private_stream {
            self.by_identity.insert(key.identity_owned(), handle);
        }
        log::debug!("Opening item {} {:?}", handle, key.identity());
        self.items.insert(
            handle,
            ItemStream { handle, key, state: ItemState::NotRequested, stream_id: None, bound_to: None },
        );

        if let Some(sink) = sink {
            self.bind(handle, sink);
        }
        Ok(handle)
    }

    /// Re-sends a changed request on the same handle.
    pub fn reissue(
        &mut self,
        handle: ItemHandle,
        key: RequestKey,
        sink: Option<&dyn StreamSink>,
    ) -> Result<(), SessionError> {
        let item = self.items.get_mut(&handle).ok_or(SessionError::UnknownHandle(handle))?;
        if item.key.identity() != key.identity() || item.key.private_stream != key.private_stream {
            return Err(SessionError::StreamAlreadyInUse(handle));
        }
        item.key = key;

        let Some(sink) = sink else { return Ok(()) };
        let live = item.stream_id.filter(|_| item.bound_to == Some(sink.connection_id()));
        match live {
            // Same stream id on the same connection: the provider treats it as a reissue
            Some(stream_id) => {
                item.state = ItemState::WaitingForRefresh;
                sink.request(&item.key, stream_id);
            }
            None => self.bind(handle, sink),
        }
        Ok(())
    }

    /// Removes the item, sending a close if it is bound to `sink`'s connection.
    /// Returns false when the handle was not open.
    pub fn close(&mut self, handle: ItemHandle, sink: Option<&dyn StreamSink>) -> bool {
        let Some(item) = self.remove(handle) else { return false };
        if let (Some(sink), Some(stream_id)) = (sink, item.stream_id) {
            if item.bound_to == Some(sink.connection_id()) {
                sink.close(stream_id);
            }
        }
        log::debug!("Closed item {}", handle);
        true
    }

    /// Defers a close until the in-flight migration finishes.
    pub fn queue_close(&mut self, handle: ItemHandle) -> bool {
        if !self.items.contains_key(&handle) {
            return false;
        }
        if !self.pending_closes.contains(&handle) {
            self.pending_closes.push(handle);
        }
        true
    }

    pub fn pending_closes(&self) -> &[ItemHandle] {
        &self.pending_closes
    }

    pub fn apply_pending_closes(&mut self, sink: Option<&dyn StreamSink>) -> Vec<ItemHandle> {
        let pending = std::mem::take(&mut self.pending_closes);
        pending.into_iter().filter(|h| self.close(*h, sink)).collect()
    }

    /// Re-issues every open item on the new connection, in creation order.
    /// Handles are untouched; stream ids are all fresh. Returns how many items moved.
    pub fn migrate(&mut self, sink: &dyn StreamSink) -> usize {
        let handles: Vec<ItemHandle> = self
            .items
            .values()
            .filter(|i| i.state != ItemState::Closed)
            .map(|i| i.handle)
            .collect();
        for handle in &handles {
            self.bind(*handle, sink);
        }
        log::info!("Migrated {} item stream(s) to {}", handles.len(), sink.connection_id());
        handles.len()
    }

    /// Every open item goes back to waiting and gets an `Open/Suspect` status.
    pub fn on_connection_lost(&mut self, reason: &str) -> Vec<ItemEvent> {
        let handles: Vec<ItemHandle> = self.items.keys().copied().collect();
        let mut events = Vec::with_capacity(handles.len());
        for handle in handles {
            self.unbind(handle);
            if let Some(item) = self.items.get_mut(&handle) {
                if item.state == ItemState::HasRefresh {
                    item.state = ItemState::WaitingForRefresh;
                }
                events.push(ItemEvent::Status { handle, status: StreamStatus::open_suspect(reason) });
            }
        }
        events
    }

    /// Routes an inbound message from connection `conn`.
    pub fn on_message(&mut self, conn: ConnectionId, msg: Msg, sink: Option<&dyn StreamSink>) -> Option<ItemEvent> {
        let Some(&handle) = self.by_stream_id.get(&msg.stream_id) else {
            log::trace!("Dropping message for unknown stream id {} on {}", msg.stream_id, conn);
            return None;
        };
        let item = self.items.get_mut(&handle)?;
        if item.bound_to != Some(conn) {
            log::trace!("Dropping stale message for item {} from {}", handle, conn);
            return None;
        }

        match msg.class {
            MsgClass::Refresh { complete } => {
                let status = msg.state.unwrap_or_else(StreamStatus::open_ok);
                if complete && status.data_state == DataState::Ok {
                    item.state = ItemState::HasRefresh;
                }
                let finished = complete && (!item.key.streaming || status.stream_state == StreamState::NonStreaming);
                let event = ItemEvent::Refresh { handle, payload: msg.payload, complete, status: status.clone() };
                if finished || status.is_terminal() {
                    self.remove(handle);
                }
                Some(event)
            }
            MsgClass::Update => {
                if item.state == ItemState::NotRequested {
                    return None;
                }
                Some(ItemEvent::Update { handle, payload: msg.payload })
            }
            MsgClass::Status => {
                let status = msg.state.unwrap_or_else(StreamStatus::open_ok);
                match status.stream_state {
                    StreamState::ClosedRecover => {
                        log::info!("Item {} closed-recover ({}), re-requesting", handle, status.text);
                        self.unbind(handle);
                        if let Some(sink) = sink {
                            self.bind(handle, sink);
                        } else if let Some(item) = self.items.get_mut(&handle) {
                            item.state = ItemState::WaitingForRefresh;
                        }
                        Some(ItemEvent::Status {
                            handle,
                            status: StreamStatus::new(StreamState::Open, DataState::Suspect, &status.text),
                        })
                    }
                    _ if status.is_terminal() => {
                        log::info!("Item {} closed by provider: {}", handle, status.text);
                        self.remove(handle);
                        Some(ItemEvent::Status { handle, status })
                    }
                    _ => Some(ItemEvent::Status { handle, status }),
                }
            }
        }
    }

    /// Closes everything, telling the connection (if any) and the application.
    pub fn close_all(&mut self, sink: Option<&dyn StreamSink>, text: &str) -> Vec<ItemEvent> {
        let handles: Vec<ItemHandle> = self.items.keys().copied().collect();
        handles
            .into_iter()
            .filter(|h| self.close(*h, sink))
            .map(|handle| ItemEvent::Status {
                handle,
                status: StreamStatus::new(StreamState::Closed, DataState::Suspect, text),
            })
            .collect()
    }
}
