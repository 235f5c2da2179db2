//! Server side of LOD column streaming.
//!
//! Clients request far-away terrain columns in batches. The
//! [`RequestProcessor`] resolves every position from memory, the persistent
//! store or world generation, and streams the resulting sections back
//! within a shared bandwidth budget. The host embeds the processor, feeds
//! it inbound messages and calls [`RequestProcessor::tick`] once per game
//! tick.

#![deny(clippy::clone_on_ref_ptr)]

pub mod bandwidth;
pub mod change_tracker;
pub mod chunk_generator;
pub mod disk_reader;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod region;
pub mod request_processor;
pub mod serialize;
pub mod session;
pub mod settings;

// Reexports
pub use crate::{
    change_tracker::ChangeTracker,
    chunk_generator::GenerationNotifier,
    error::{InitError, SendError, SerializeError, StoreError},
    provider::{ClientSink, Column, ColumnStore, Section, StoredColumn, WorldAccess},
    request_processor::{Diagnostics, RequestProcessor, TickStats},
    session::ClientView,
    settings::{Settings, SETTINGS_FILENAME},
};
