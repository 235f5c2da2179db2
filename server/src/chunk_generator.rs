use crate::{
    metrics::ChunkGenMetrics,
    provider::WorldAccess,
    serialize::{epoch_secs, serialize_column},
};
use common::{column_distance, ClientId, DimensionId};
use common_net::msg::ChunkSection;
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, trace};
use vek::*;

type JobKey = (DimensionId, Vec2<i32>);

/// A client waiting for a generated column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Callback {
    client: ClientId,
    epoch: u32,
    batch_id: i32,
    order: u64,
}

struct PendingGeneration {
    callbacks: Vec<Callback>,
    ticks_waiting: u64,
}

/// A client asking for a column to be generated.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub client: ClientId,
    /// Session epoch of the requesting client.
    pub epoch: u32,
    pub batch_id: i32,
    pub dimension: DimensionId,
    pub key: Vec2<i32>,
    pub order: u64,
}

/// Delivered once per callback. `sections` is empty when generation failed
/// or timed out.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    pub client: ClientId,
    pub epoch: u32,
    pub batch_id: i32,
    pub key: Vec2<i32>,
    pub order: u64,
    pub sections: Vec<ChunkSection>,
}

/// Sent by the host when a requested column finished generating.
#[derive(Clone, Debug)]
pub struct GenerationNotice {
    pub dimension: DimensionId,
    pub key: Vec2<i32>,
    pub success: bool,
}

/// Cloneable handle the host may use from any thread to report finished
/// generation. Notices are applied on the next [`ChunkGenerator::tick`].
#[derive(Clone)]
pub struct GenerationNotifier(crossbeam_channel::Sender<GenerationNotice>);

impl GenerationNotifier {
    pub fn notify(&self, dimension: DimensionId, key: Vec2<i32>, success: bool) {
        let _ = self.0.send(GenerationNotice {
            dimension,
            key,
            success,
        });
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub active: usize,
    pub waiting: usize,
    pub timeouts: u64,
    pub evicted: u64,
    pub late_notices: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct GeneratorConfig {
    pub max_concurrent: usize,
    pub max_concurrent_per_client: usize,
    pub timeout_ticks: u64,
    pub send_light: bool,
}

/// Admission-controlled generation queue.
///
/// Requests for the same column coalesce into one job, so the world only
/// generates it once no matter how many clients wait for it. At most
/// `max_concurrent` jobs run at a time, and a client only starts new jobs
/// while it has fewer than `max_concurrent_per_client` running. Everything
/// else waits and is promoted closest-first.
///
/// The waiting queue itself is unbounded; callers bound it by capping how
/// many columns each client may have pending.
pub struct ChunkGenerator {
    config: GeneratorConfig,
    active: IndexMap<JobKey, PendingGeneration>,
    waiting: IndexMap<JobKey, PendingGeneration>,
    active_per_client: HashMap<ClientId, usize>,
    results: HashMap<ClientId, VecDeque<GenerationResult>>,
    notice_tx: crossbeam_channel::Sender<GenerationNotice>,
    notice_rx: crossbeam_channel::Receiver<GenerationNotice>,
    metrics: Arc<ChunkGenMetrics>,
    submitted: u64,
    completed: u64,
    timeouts: u64,
    evicted: u64,
    late_notices: u64,
}

impl ChunkGenerator {
    pub fn new(config: GeneratorConfig, metrics: ChunkGenMetrics) -> Self {
        let (notice_tx, notice_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            active: IndexMap::new(),
            waiting: IndexMap::new(),
            active_per_client: HashMap::new(),
            results: HashMap::new(),
            notice_tx,
            notice_rx,
            metrics: Arc::new(metrics),
            submitted: 0,
            completed: 0,
            timeouts: 0,
            evicted: 0,
            late_notices: 0,
        }
    }

    pub fn notifier(&self) -> GenerationNotifier { GenerationNotifier(self.notice_tx.clone()) }

    pub fn submit(&mut self, world: &dyn WorldAccess, request: GenerationRequest) {
        let GenerationRequest {
            client,
            epoch,
            batch_id,
            dimension,
            key,
            order,
        } = request;
        let callback = Callback {
            client,
            epoch,
            batch_id,
            order,
        };
        let job_key = (dimension, key);

        if let Some(job) = self.active.get_mut(&job_key) {
            job.callbacks.push(callback);
            *self.active_per_client.entry(client).or_default() += 1;
            return;
        }
        if let Some(job) = self.waiting.get_mut(&job_key) {
            job.callbacks.push(callback);
            return;
        }

        self.submitted += 1;
        let job = PendingGeneration {
            callbacks: vec![callback],
            ticks_waiting: 0,
        };
        let client_active = self.active_per_client.get(&client).copied().unwrap_or(0);
        if self.active.len() < self.config.max_concurrent
            && client_active < self.config.max_concurrent_per_client
        {
            world.request_generation(&job_key.0, key);
            self.metrics.chunks_requested.inc();
            *self.active_per_client.entry(client).or_default() += 1;
            self.active.insert(job_key, job);
        } else {
            self.waiting.insert(job_key, job);
        }
        self.update_gauges();
    }

    /// Advances running jobs, evicts orphaned waiting jobs and promotes the
    /// closest waiting jobs into free slots. `client_pos` returns the current
    /// column of a connected client and `None` for anyone else.
    pub fn tick(
        &mut self,
        world: &dyn WorldAccess,
        client_pos: impl Fn(ClientId) -> Option<Vec2<i32>>,
    ) {
        self.apply_notices(world);
        self.tick_active(world);
        self.evict_orphans(&client_pos);
        self.promote_waiting(world, &client_pos);
        self.update_gauges();
    }

    fn apply_notices(&mut self, world: &dyn WorldAccess) {
        while let Ok(notice) = self.notice_rx.try_recv() {
            let job_key = (notice.dimension, notice.key);
            let job = match self.active.shift_remove(&job_key) {
                Some(job) => job,
                None => {
                    // Job was discarded or already finished
                    self.late_notices += 1;
                    continue;
                },
            };
            let sections = if notice.success {
                world
                    .loaded_column(&job_key.0, job_key.1)
                    .map(|column| {
                        serialize_column(
                            &job_key.0,
                            job_key.1,
                            &column,
                            epoch_secs(),
                            self.config.send_light,
                        )
                    })
                    .unwrap_or_default()
            } else {
                debug!(key = ?job_key.1, "Generation reported failure");
                Vec::new()
            };
            self.finish(world, &job_key, job, sections);
        }
    }

    fn tick_active(&mut self, world: &dyn WorldAccess) {
        let mut finished = Vec::new();
        for (job_key, job) in self.active.iter_mut() {
            job.ticks_waiting += 1;
            if job.ticks_waiting > self.config.timeout_ticks {
                trace!(key = ?job_key.1, "Generation timed out");
                finished.push((job_key.clone(), None));
            } else if let Some(column) = world.loaded_column(&job_key.0, job_key.1) {
                finished.push((job_key.clone(), Some(column)));
            }
        }

        for (job_key, column) in finished {
            let Some(job) = self.active.shift_remove(&job_key) else {
                continue;
            };
            let sections = match column {
                Some(column) => serialize_column(
                    &job_key.0,
                    job_key.1,
                    &column,
                    epoch_secs(),
                    self.config.send_light,
                ),
                None => {
                    self.timeouts += 1;
                    self.metrics.chunks_timed_out.inc();
                    Vec::new()
                },
            };
            self.finish(world, &job_key, job, sections);
        }
    }

    fn finish(
        &mut self,
        world: &dyn WorldAccess,
        job_key: &JobKey,
        job: PendingGeneration,
        sections: Vec<ChunkSection>,
    ) {
        world.release_generation(&job_key.0, job_key.1);
        self.completed += 1;
        self.metrics.chunks_served.inc();
        for cb in job.callbacks {
            decrement(&mut self.active_per_client, cb.client);
            self.results
                .entry(cb.client)
                .or_default()
                .push_back(GenerationResult {
                    client: cb.client,
                    epoch: cb.epoch,
                    batch_id: cb.batch_id,
                    key: job_key.1,
                    order: cb.order,
                    sections: sections.clone(),
                });
        }
    }

    fn evict_orphans(&mut self, client_pos: &impl Fn(ClientId) -> Option<Vec2<i32>>) {
        let before = self.waiting.len();
        self.waiting
            .retain(|_, job| job.callbacks.iter().any(|cb| client_pos(cb.client).is_some()));
        let evicted = (before - self.waiting.len()) as u64;
        self.evicted += evicted;
        self.metrics.chunks_canceled.inc_by(evicted);
    }

    fn promote_waiting(
        &mut self,
        world: &dyn WorldAccess,
        client_pos: &impl Fn(ClientId) -> Option<Vec2<i32>>,
    ) {
        while self.active.len() < self.config.max_concurrent && !self.waiting.is_empty() {
            // Strict comparison keeps the earliest inserted job on ties
            let mut best: Option<(usize, i64)> = None;
            for (index, ((_, key), job)) in self.waiting.iter().enumerate() {
                let dist = job
                    .callbacks
                    .iter()
                    .filter_map(|cb| client_pos(cb.client))
                    .map(|pos| column_distance(*key, pos))
                    .min()
                    .unwrap_or(i64::MAX);
                if best.map_or(true, |(_, best_dist)| dist < best_dist) {
                    best = Some((index, dist));
                }
            }
            let Some((index, _)) = best else {
                break;
            };
            let Some((job_key, mut job)) = self.waiting.shift_remove_index(index) else {
                break;
            };
            for cb in &job.callbacks {
                *self.active_per_client.entry(cb.client).or_default() += 1;
            }
            job.ticks_waiting = 0;
            world.request_generation(&job_key.0, job_key.1);
            self.metrics.chunks_requested.inc();
            self.active.insert(job_key, job);
        }
    }

    /// Takes the buffered results of a client.
    pub fn results_mut(&mut self, client: ClientId) -> Option<&mut VecDeque<GenerationResult>> {
        self.results.get_mut(&client)
    }

    pub fn remove_client_results(&mut self, client: ClientId) { self.results.remove(&client); }

    /// Removes every callback of `client`. Jobs left without callbacks are
    /// dropped, running ones are released in the world.
    pub fn remove_client(&mut self, world: &dyn WorldAccess, client: ClientId) {
        self.remove_client_results(client);
        self.active_per_client.remove(&client);

        let mut canceled = 0;
        self.active.retain(|job_key, job| {
            job.callbacks.retain(|cb| cb.client != client);
            if job.callbacks.is_empty() {
                world.release_generation(&job_key.0, job_key.1);
                canceled += 1;
                false
            } else {
                true
            }
        });
        self.waiting.retain(|_, job| {
            job.callbacks.retain(|cb| cb.client != client);
            if job.callbacks.is_empty() {
                canceled += 1;
                false
            } else {
                true
            }
        });
        self.metrics.chunks_canceled.inc_by(canceled);
        self.update_gauges();
    }

    pub fn cancel_all(&mut self, world: &dyn WorldAccess) {
        for (job_key, _) in self.active.drain(..) {
            world.release_generation(&job_key.0, job_key.1);
            self.metrics.chunks_canceled.inc();
        }
        self.metrics
            .chunks_canceled
            .inc_by(self.waiting.len() as u64);
        self.waiting.clear();
        self.active_per_client.clear();
        self.results.clear();
        self.update_gauges();
    }

    pub fn snapshot(&self) -> GeneratorSnapshot {
        GeneratorSnapshot {
            submitted: self.submitted,
            completed: self.completed,
            active: self.active.len(),
            waiting: self.waiting.len(),
            timeouts: self.timeouts,
            evicted: self.evicted,
            late_notices: self.late_notices,
        }
    }

    fn update_gauges(&self) {
        self.metrics.active.set(self.active.len() as i64);
        self.metrics.waiting.set(self.waiting.len() as i64);
    }
}

fn decrement(counts: &mut HashMap<ClientId, usize>, client: ClientId) {
    if let Some(count) = counts.get_mut(&client) {
        if *count <= 1 {
            counts.remove(&client);
        } else {
            *count -= 1;
        }
    }
}
