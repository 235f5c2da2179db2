//! Hooks through which renderers receive the sections streamed by the
//! server.

use bytes::Bytes;
use common::DimensionId;
use common_net::msg::ChunkSection;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, RwLock},
};
use tracing::{error, info};

/// A section as handed to consumers, with light expanded to full nibble
/// arrays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedSection {
    pub dimension: DimensionId,
    pub x: i32,
    pub section_y: i32,
    pub z: i32,
    pub data: Bytes,
    pub block_light: Option<Vec<u8>>,
    pub sky_light: Option<Vec<u8>>,
}

impl From<&ChunkSection> for ReceivedSection {
    fn from(section: &ChunkSection) -> Self {
        Self {
            dimension: section.dimension.clone(),
            x: section.x,
            section_y: section.section_y,
            z: section.z,
            data: section.data.clone(),
            block_light: section.block_light.expand(),
            sky_light: section.sky_light.expand(),
        }
    }
}

pub trait SectionConsumer: Send + Sync {
    fn on_section(&self, section: &ReceivedSection);
}

impl<F: Fn(&ReceivedSection) + Send + Sync> SectionConsumer for F {
    fn on_section(&self, section: &ReceivedSection) { self(section) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(u64);

#[derive(Default)]
struct Registered {
    next_id: u64,
    consumers: Vec<(ConsumerHandle, Arc<dyn SectionConsumer>)>,
}

#[derive(Default)]
pub struct ConsumerRegistry {
    inner: RwLock<Registered>,
}

impl ConsumerRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, consumer: Arc<dyn SectionConsumer>) -> ConsumerHandle {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let handle = ConsumerHandle(inner.next_id);
        inner.next_id += 1;
        inner.consumers.push((handle, consumer));
        info!(?handle, "Registered section consumer");
        handle
    }

    /// Returns whether the consumer was registered.
    pub fn unregister(&self, handle: ConsumerHandle) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let before = inner.consumers.len();
        inner.consumers.retain(|(h, _)| *h != handle);
        inner.consumers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .consumers
            .is_empty()
    }

    /// Hands `section` to every consumer. A panicking consumer is logged and
    /// does not stop the others. Returns how many consumers completed.
    pub fn dispatch(&self, section: &ChunkSection) -> usize {
        // Consumers run outside the lock so they may register others.
        let consumers: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .consumers
            .iter()
            .map(|(handle, c)| (*handle, Arc::clone(c)))
            .collect();
        if consumers.is_empty() {
            return 0;
        }

        let received = ReceivedSection::from(section);
        consumers
            .into_iter()
            .filter(|(handle, consumer)| {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| consumer.on_section(&received)));
                if result.is_err() {
                    error!(
                        ?handle,
                        x = received.x,
                        y = received.section_y,
                        z = received.z,
                        "Section consumer panicked"
                    );
                }
                result.is_ok()
            })
            .count()
    }
}
