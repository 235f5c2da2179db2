//! Client side of LOD column streaming.
//!
//! [`LodClient`] is driven by the host: it produces the handshake on join,
//! consumes every message the server sends, and once per tick returns the
//! requests that should go out. Received sections are handed to registered
//! [`SectionConsumer`]s.

pub mod cache;
pub mod consumer;
pub mod error;
pub mod request_manager;
pub mod settings;

// Reexports
pub use crate::{
    cache::ColumnCacheStore,
    consumer::{ConsumerHandle, ConsumerRegistry, ReceivedSection, SectionConsumer},
    error::CacheError,
    request_manager::{LodRequestManager, PlayerView, RequestStats},
    settings::{ClientSettings, CLIENT_SETTINGS_FILENAME},
};

use bytes::Buf;
use common::consts::PROTOCOL_VERSION;
use common_net::msg::{ChunkSection, ClientGeneral, ServerGeneral, SessionConfig};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, trace, warn};
use vek::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The server accepted the handshake and streams up to this distance.
    SessionStarted(SessionConfig),
    /// The server speaks the protocol but has streaming turned off.
    ServerDisabled,
    IncompatibleProtocol { server_version: i32 },
}

pub struct LodClient {
    settings: ClientSettings,
    /// Identity the column cache is stored under, usually the server address.
    server: String,
    consumers: Arc<ConsumerRegistry>,
    manager: Option<LodRequestManager>,
    server_enabled: bool,
    server_view_distance: i32,
    sections_received: u64,
    bytes_received: u64,
}

impl LodClient {
    pub fn new(settings: ClientSettings, server: impl Into<String>) -> Self {
        Self {
            settings,
            server: server.into(),
            consumers: Arc::new(ConsumerRegistry::new()),
            manager: None,
            server_enabled: false,
            server_view_distance: 0,
            sections_received: 0,
            bytes_received: 0,
        }
    }

    pub fn with_consumers(mut self, consumers: Arc<ConsumerRegistry>) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn settings(&self) -> &ClientSettings { &self.settings }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> { &self.consumers }

    pub fn request_manager(&self) -> Option<&LodRequestManager> { self.manager.as_ref() }

    pub fn is_server_enabled(&self) -> bool { self.server_enabled }

    pub fn server_view_distance(&self) -> i32 { self.server_view_distance }

    pub fn sections_received(&self) -> u64 { self.sections_received }

    pub fn bytes_received(&self) -> u64 { self.bytes_received }

    fn reset(&mut self) {
        self.manager = None;
        self.server_enabled = false;
        self.server_view_distance = 0;
    }

    /// Forgets any previous session. Returns the handshake to send, unless
    /// receiving is turned off.
    pub fn on_join(&mut self) -> Option<ClientGeneral> {
        self.reset();
        self.sections_received = 0;
        self.bytes_received = 0;
        self.settings
            .receive_server_lods
            .then_some(ClientGeneral::Handshake {
                protocol_version: PROTOCOL_VERSION,
            })
    }

    pub fn on_disconnect(&mut self) {
        if let Some(manager) = &self.manager {
            manager.save_cache();
        }
        self.reset();
        self.sections_received = 0;
        self.bytes_received = 0;
    }

    /// Decodes one frame and handles it. Malformed frames are logged and
    /// dropped.
    pub fn handle_frame(&mut self, frame: &mut impl Buf) -> Option<Event> {
        match ServerGeneral::decode(frame) {
            Ok(msg) => self.handle_msg(msg),
            Err(e) => {
                warn!(?e, "Dropping malformed message from server");
                None
            },
        }
    }

    pub fn handle_msg(&mut self, msg: ServerGeneral) -> Option<Event> {
        match msg {
            ServerGeneral::SessionConfig(config) => return self.on_session_config(config),
            ServerGeneral::ChunkSection(section) => self.on_section(&section),
            ServerGeneral::ColumnUpToDate { x, z } => {
                if let Some(manager) = &mut self.manager {
                    manager.on_column_up_to_date(Vec2::new(x, z));
                }
            },
            ServerGeneral::RequestComplete { batch_id, status } => {
                trace!(%batch_id, ?status, "Batch complete");
                if let Some(manager) = &mut self.manager {
                    manager.on_batch_complete(batch_id, status);
                }
            },
            ServerGeneral::DirtyColumns { positions } => {
                debug!(count = positions.len(), "Server reported changed columns");
                if let Some(manager) = &mut self.manager {
                    manager.on_dirty_columns(&positions);
                }
            },
        }
        None
    }

    fn on_session_config(&mut self, config: SessionConfig) -> Option<Event> {
        info!(?config, "Received session config");
        if config.protocol_version != PROTOCOL_VERSION {
            warn!(
                server_version = config.protocol_version,
                client_version = PROTOCOL_VERSION,
                "Server speaks an incompatible protocol, streaming disabled"
            );
            self.reset();
            return Some(Event::IncompatibleProtocol {
                server_version: config.protocol_version,
            });
        }

        self.server_enabled = config.enabled;
        self.server_view_distance = config.view_distance;
        if !config.enabled {
            self.manager = None;
            return Some(Event::ServerDisabled);
        }
        self.manager = Some(LodRequestManager::new(config, self.server.clone(), &self.settings));
        Some(Event::SessionStarted(config))
    }

    fn on_section(&mut self, section: &ChunkSection) {
        self.sections_received += 1;
        self.bytes_received += section.encoded_cost() as u64;

        // Sections still in flight from a dimension we already left are
        // neither cached nor rendered.
        let current = self.manager.as_ref().and_then(|m| m.dimension());
        if current.is_some_and(|dimension| *dimension != section.dimension) {
            trace!(dimension = %section.dimension, "Ignoring section from another dimension");
            return;
        }
        if let Some(manager) = &mut self.manager {
            manager.on_section_received(
                Vec2::new(section.x, section.z),
                section.column_timestamp,
            );
        }
        if self.server_enabled && self.settings.receive_server_lods {
            self.consumers.dispatch(section);
        }
    }

    /// Runs the request manager for this tick and returns what to send.
    pub fn tick(&mut self, view: &PlayerView, now: Instant) -> Vec<ClientGeneral> {
        if !self.server_enabled {
            return Vec::new();
        }
        self.manager
            .as_mut()
            .map_or_else(Vec::new, |manager| manager.tick(view, now))
    }

    /// Drops every cached timestamp for this server and starts over.
    pub fn flush_cache(&mut self) {
        match &mut self.manager {
            Some(manager) => manager.flush_cache(),
            None => {
                let store = ColumnCacheStore::new(&self.settings.cache_dir);
                if let Err(e) = store.clear_for_server(&self.server) {
                    warn!(%e, "Failed to clear column cache");
                }
            },
        }
    }
}
