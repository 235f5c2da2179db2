//! Tick-driven scheduler that turns client request batches into section
//! payloads.
//!
//! Each tick, in order:
//! 1) Reset sessions whose client changed dimension
//! 2) Drain finished disk reads, routing missing columns to generation
//! 3) Tick the generator and drain its results
//! 4) Per client: flush the send queue within the bandwidth budget, advance
//!    request batches, and report finished batches
//! 5) Periodically push saved columns to clients that can see them

use crate::{
    bandwidth::SharedBandwidthLimiter,
    change_tracker::ChangeTracker,
    chunk_generator::{
        ChunkGenerator, GenerationNotifier, GenerationRequest, GeneratorConfig, GeneratorSnapshot,
    },
    disk_reader::{ChunkDiskReader, DiskReadJob, DiskReaderSnapshot, ReadOutcome},
    error::{InitError, SendError},
    metrics::{ChunkGenMetrics, StreamMetrics},
    provider::{ClientSink, ColumnStore, WorldAccess},
    serialize::{epoch_secs, serialize_column},
    session::{BatchAdmission, ClientSession, ClientView, SessionStats},
    settings::Settings,
};
use common::{
    consts::{COLUMN_UP_TO_DATE_COST, MAX_DIRTY_COLUMN_POSITIONS, PROTOCOL_VERSION},
    pack_column, unpack_column, within_distance, ClientId,
};
use common_net::msg::{ChunkSection, ClientGeneral, RequestStatus, ServerGeneral, SessionConfig};
use hashbrown::HashMap;
use prometheus::Registry;
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, trace, warn};

/// What happened during the most recent tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub dimension_resets: usize,
    pub disk_results: usize,
    pub generation_results: usize,
    pub stale_results: usize,
    pub disk_submitted: usize,
    pub generation_submitted: usize,
    pub serializations: usize,
    pub sections_sent: usize,
    pub completions: usize,
    pub dirty_columns_sent: usize,
}

/// Read-only view of the whole pipeline for administrative tooling.
#[derive(Clone, Debug)]
pub struct Diagnostics {
    pub tick: u64,
    pub clients: usize,
    pub pending_batches: usize,
    pub queued_payloads: usize,
    pub bytes_sent_this_second: u64,
    pub disk_reader: Option<DiskReaderSnapshot>,
    pub generator: Option<GeneratorSnapshot>,
    pub sessions: Vec<(ClientId, SessionStats)>,
    pub last_tick: TickStats,
}

pub struct RequestProcessor {
    settings: Settings,
    sessions: HashMap<ClientId, ClientSession>,
    bandwidth: SharedBandwidthLimiter,
    disk_reader: Option<ChunkDiskReader>,
    generator: Option<ChunkGenerator>,
    change_tracker: Arc<ChangeTracker>,
    metrics: StreamMetrics,
    tick: u64,
    submission_order: u64,
    last_tick: TickStats,
    shut_down: bool,
}

impl RequestProcessor {
    /// Starts the disk reader and generator as enabled in `settings` and
    /// registers metrics in `registry`.
    pub fn new(
        mut settings: Settings,
        store: Arc<dyn ColumnStore>,
        registry: &Registry,
    ) -> Result<Self, InitError> {
        settings.validate();
        let metrics = StreamMetrics::new(registry)?;
        let disk_reader = if settings.enable_disk_reading {
            Some(ChunkDiskReader::new(
                settings.disk_reader_threads,
                store,
                settings.send_light_data,
            )?)
        } else {
            None
        };
        let generator = if settings.enable_generation {
            Some(ChunkGenerator::new(
                GeneratorConfig {
                    max_concurrent: settings.max_concurrent_generations,
                    max_concurrent_per_client: settings.max_concurrent_generations_per_client,
                    timeout_ticks: settings.generation_timeout_ticks(),
                    send_light: settings.send_light_data,
                },
                ChunkGenMetrics::new(registry)?,
            ))
        } else {
            None
        };
        info!(
            enabled = settings.enabled,
            disk = disk_reader.is_some(),
            generation = generator.is_some(),
            view_distance = settings.view_distance,
            "Started column request processor"
        );

        Ok(Self {
            bandwidth: SharedBandwidthLimiter::new(settings.max_bytes_per_second_global),
            settings,
            sessions: HashMap::new(),
            disk_reader,
            generator,
            change_tracker: Arc::new(ChangeTracker::new()),
            metrics,
            tick: 0,
            submission_order: 0,
            last_tick: TickStats::default(),
            shut_down: false,
        })
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    /// Handle for the host's save hook.
    pub fn change_tracker(&self) -> Arc<ChangeTracker> { Arc::clone(&self.change_tracker) }

    /// Handle the host uses to report finished generation. `None` when
    /// generation is disabled.
    pub fn generation_notifier(&self) -> Option<GenerationNotifier> {
        self.generator.as_ref().map(ChunkGenerator::notifier)
    }

    pub fn is_registered(&self, client: ClientId) -> bool { self.sessions.contains_key(&client) }

    pub fn session(&self, client: ClientId) -> Option<&ClientSession> { self.sessions.get(&client) }

    /// Handles one inbound message. `view` is where the client is right now
    /// and only matters for the handshake.
    pub fn handle_msg(
        &mut self,
        client: ClientId,
        view: &ClientView,
        msg: ClientGeneral,
        sink: &mut dyn ClientSink,
    ) {
        if self.shut_down {
            return;
        }
        match msg {
            ClientGeneral::Handshake { protocol_version } => {
                self.on_handshake(client, view, protocol_version, sink)
            },
            ClientGeneral::ChunkRequest(request) => {
                let max_pending = self.settings.max_pending_requests_per_client;
                let Some(session) = self.sessions.get_mut(&client) else {
                    debug!(%client, "Ignoring chunk request before handshake");
                    return;
                };
                let batch_id = request.batch_id;
                if session.pending_batch_count() >= max_pending {
                    session.stats_mut().batches_rejected += 1;
                    self.metrics.batches_rejected.inc();
                    trace!(%client, batch_id, "Too many pending batches, rejecting");
                    let _ = send_or_log(
                        sink,
                        &self.metrics,
                        client,
                        ServerGeneral::RequestComplete {
                            batch_id,
                            status: RequestStatus::Rejected,
                        },
                    );
                    return;
                }
                match session.add_batch(
                    request,
                    self.settings.view_distance,
                    self.settings.max_requests_per_batch,
                    Instant::now(),
                ) {
                    BatchAdmission::Accepted { rejected, .. } => {
                        self.metrics.batches_received.inc();
                        self.metrics.positions_rejected.inc_by(rejected as u64);
                    },
                    BatchAdmission::Duplicate => {
                        session.stats_mut().batches_rejected += 1;
                        self.metrics.batches_rejected.inc();
                    },
                }
            },
            ClientGeneral::CancelRequest { batch_ids } => match self.sessions.get_mut(&client) {
                Some(session) => session.cancel_batches(&batch_ids),
                None => debug!(%client, "Ignoring cancel request before handshake"),
            },
        }
    }

    fn on_handshake(
        &mut self,
        client: ClientId,
        view: &ClientView,
        protocol_version: i32,
        sink: &mut dyn ClientSink,
    ) {
        let settings = &self.settings;
        let config = SessionConfig {
            protocol_version: PROTOCOL_VERSION,
            enabled: settings.enabled,
            view_distance: settings.view_distance as i32,
            max_requests_per_batch: settings.max_requests_per_batch as i32,
            max_pending_requests: settings.max_pending_requests_per_client as i32,
            generation_budget: if self.generator.is_some() {
                settings.max_concurrent_generations_per_client as i32
            } else {
                0
            },
            generation_distance: settings.generation_distance as i32,
        };
        let _ = send_or_log(sink, &self.metrics, client, ServerGeneral::SessionConfig(config));

        if protocol_version != PROTOCOL_VERSION {
            info!(
                %client,
                protocol_version,
                expected = PROTOCOL_VERSION,
                "Client speaks a different protocol version, not streaming columns"
            );
            return;
        }
        if !settings.enabled {
            return;
        }
        if self.sessions.contains_key(&client) {
            debug!(%client, "Repeated handshake, keeping existing session");
            return;
        }
        self.sessions
            .insert(client, ClientSession::new(client, protocol_version, view.clone()));
        if let Some(disk) = self.disk_reader.as_mut() {
            disk.register_client(client);
        }
        self.metrics.clients.set(self.sessions.len() as i64);
        debug!(%client, "Registered column streaming session");
    }

    /// Records where a client is. Call before every tick.
    pub fn update_view(&mut self, client: ClientId, view: ClientView) {
        if let Some(session) = self.sessions.get_mut(&client) {
            session.set_view(view);
        }
    }

    /// Forgets a client entirely, including queued disk results and
    /// generation callbacks.
    pub fn remove_client(&mut self, world: &dyn WorldAccess, client: ClientId) {
        if self.sessions.remove(&client).is_none() {
            return;
        }
        if let Some(disk) = self.disk_reader.as_mut() {
            disk.remove_client(client);
        }
        if let Some(generator) = self.generator.as_mut() {
            generator.remove_client(world, client);
        }
        self.metrics.clients.set(self.sessions.len() as i64);
        debug!(%client, "Removed column streaming session");
    }

    pub fn tick(&mut self, world: &dyn WorldAccess, sink: &mut dyn ClientSink) {
        if self.shut_down {
            return;
        }
        let now = Instant::now();
        self.tick += 1;
        let tick = self.tick;

        let Self {
            settings,
            sessions,
            bandwidth,
            disk_reader,
            generator,
            change_tracker,
            metrics,
            submission_order,
            last_tick,
            ..
        } = self;
        let settings = &*settings;
        let mut ctx = TickContext {
            settings,
            world,
            sink,
            bandwidth,
            disk_reader: disk_reader.as_mut(),
            generator: generator.as_mut(),
            metrics: &*metrics,
            submission_order,
            serializations: 0,
            stats: TickStats::default(),
        };

        // 1) Dimension changes invalidate everything in flight
        for session in sessions.values_mut() {
            if session.check_dimension_change() {
                ctx.reset_for_dimension_change(session);
            }
        }

        // 2) Disk results
        if let Some(disk) = ctx.disk_reader.as_deref_mut() {
            disk.poll();
        }
        for session in sessions.values_mut() {
            ctx.drain_disk_results(session);
        }

        // 3) Generation
        if let Some(generator) = ctx.generator.as_deref_mut() {
            generator.tick(world, |client| sessions.get(&client).map(|s| s.view().column));
        }
        for session in sessions.values_mut() {
            ctx.drain_generation_results(session);
        }

        // 4) Send, advance, complete
        let share = ctx.bandwidth.per_client_allocation_at(now, sessions.len());
        let allocation = share.min(settings.max_bytes_per_second_per_client);
        for session in sessions.values_mut() {
            session.reset_tick_counter();
            ctx.flush_send_queue(session, now, allocation);
            ctx.advance_batches(session);
            ctx.emit_completions(session);
        }

        // 5) Dirty columns
        if tick % settings.dirty_broadcast_interval_ticks() == 0 {
            ctx.broadcast_dirty(sessions, change_tracker);
        }

        let stats = ctx.stats;
        metrics.clients.set(sessions.len() as i64);
        metrics
            .send_queue_len
            .set(sessions.values().map(|s| s.send_queue_len()).sum::<usize>() as i64);
        if stats.sections_sent > 0 || stats.completions > 0 {
            trace!(tick, ?stats, "Column streaming tick");
        }
        *last_tick = stats;
    }

    pub fn diagnostics(&mut self) -> Diagnostics {
        let mut sessions: Vec<_> = self
            .sessions
            .values()
            .map(|s| (s.client(), *s.stats()))
            .collect();
        sessions.sort_by_key(|(client, _)| *client);
        Diagnostics {
            tick: self.tick,
            clients: self.sessions.len(),
            pending_batches: self.sessions.values().map(|s| s.pending_batch_count()).sum(),
            queued_payloads: self.sessions.values().map(|s| s.send_queue_len()).sum(),
            bytes_sent_this_second: self.bandwidth.bytes_sent_this_second(),
            disk_reader: self.disk_reader.as_ref().map(ChunkDiskReader::snapshot),
            generator: self.generator.as_ref().map(ChunkGenerator::snapshot),
            sessions,
            last_tick: self.last_tick,
        }
    }

    /// Stops background work and drops every session. Later calls into the
    /// processor do nothing.
    pub fn shutdown(&mut self, world: &dyn WorldAccess) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Some(disk) = self.disk_reader.as_ref() {
            disk.shutdown();
        }
        if let Some(generator) = self.generator.as_mut() {
            generator.cancel_all(world);
        }
        self.sessions.clear();
        self.metrics.clients.set(0);
        self.metrics.send_queue_len.set(0);
        info!("Column request processor shut down");
    }
}

fn send_or_log(
    sink: &mut dyn ClientSink,
    metrics: &StreamMetrics,
    client: ClientId,
    msg: ServerGeneral,
) -> Result<(), SendError> {
    let result = sink.send(client, msg);
    if let Err(e) = &result {
        metrics.send_failures.inc();
        debug!(%client, %e, "Failed to send message");
    }
    result
}

/// Borrowed state for one tick.
struct TickContext<'a> {
    settings: &'a Settings,
    world: &'a dyn WorldAccess,
    sink: &'a mut dyn ClientSink,
    bandwidth: &'a mut SharedBandwidthLimiter,
    disk_reader: Option<&'a mut ChunkDiskReader>,
    generator: Option<&'a mut ChunkGenerator>,
    metrics: &'a StreamMetrics,
    submission_order: &'a mut u64,
    /// Sections serialized from resident columns, across all clients.
    serializations: usize,
    stats: TickStats,
}

impl TickContext<'_> {
    fn next_order(&mut self) -> u64 {
        let order = *self.submission_order;
        *self.submission_order += 1;
        order
    }

    fn send(&mut self, client: ClientId, msg: ServerGeneral) -> Result<(), SendError> {
        send_or_log(self.sink, self.metrics, client, msg)
    }

    fn complete(&mut self, session: &mut ClientSession, batch_id: i32, status: RequestStatus) {
        match status {
            RequestStatus::Done => self.metrics.batches_completed.inc(),
            RequestStatus::Cancelled => self.metrics.batches_cancelled.inc(),
            RequestStatus::Rejected => self.metrics.batches_rejected.inc(),
        }
        self.stats.completions += 1;
        let _ = self.send(session.client(), ServerGeneral::RequestComplete { batch_id, status });
    }

    fn reset_for_dimension_change(&mut self, session: &mut ClientSession) {
        let client = session.client();
        let dropped = session.reset_for_dimension_change();
        if let Some(generator) = self.generator.as_deref_mut() {
            generator.remove_client(self.world, client);
        }
        if let Some(disk) = self.disk_reader.as_deref_mut() {
            disk.clear_client_results(client);
        }
        debug!(
            %client,
            dimension = %session.view().dimension,
            dropped = dropped.len(),
            "Client changed dimension, dropping pending batches"
        );
        for batch_id in dropped {
            session.stats_mut().batches_cancelled += 1;
            self.complete(session, batch_id, RequestStatus::Cancelled);
        }
        self.stats.dimension_resets += 1;
    }

    fn enqueue_sections(
        session: &mut ClientSession,
        sections: Vec<ChunkSection>,
        batch_id: i32,
        order: u64,
    ) {
        for section in sections {
            let cost = section.encoded_cost();
            session.enqueue(ServerGeneral::ChunkSection(section), batch_id, cost, order);
        }
    }

    fn drain_disk_results(&mut self, session: &mut ClientSession) {
        let Some(queue) = self
            .disk_reader
            .as_deref_mut()
            .and_then(|disk| disk.results_mut(session.client()))
        else {
            return;
        };
        let generation_cap = self.settings.generation_pending_cap();

        while let Some(result) = queue.front() {
            if result.epoch != session.epoch() {
                queue.pop_front();
                self.stats.stale_results += 1;
                continue;
            }
            let live = session.is_batch_live(result.batch_id);
            let to_generation = live
                && matches!(result.outcome, ReadOutcome::NotFound)
                && self.generator.is_some()
                && within_distance(
                    session.view().column,
                    result.key,
                    self.settings.generation_distance,
                );
            if to_generation && session.pending_generation_count() >= generation_cap {
                // Retried next tick once generation frees up
                break;
            }
            let Some(result) = queue.pop_front() else {
                break;
            };
            self.stats.disk_results += 1;
            let packed = pack_column(result.key);
            session.clear_pending_disk(packed);

            if to_generation {
                if let Some(generator) = self.generator.as_deref_mut() {
                    generator.submit(self.world, GenerationRequest {
                        client: session.client(),
                        epoch: result.epoch,
                        batch_id: result.batch_id,
                        dimension: session.view().dimension.clone(),
                        key: result.key,
                        order: result.order,
                    });
                    session.mark_pending_generation(packed);
                    self.stats.generation_submitted += 1;
                }
                continue;
            }

            session.finish_in_flight(result.batch_id);
            if !live {
                continue;
            }
            session.mark_disk_done(packed);
            match result.outcome {
                ReadOutcome::UpToDate { .. } => session.enqueue(
                    ServerGeneral::ColumnUpToDate {
                        x: result.key.x,
                        z: result.key.y,
                    },
                    result.batch_id,
                    COLUMN_UP_TO_DATE_COST,
                    result.order,
                ),
                ReadOutcome::Found { sections, .. } => {
                    Self::enqueue_sections(session, sections, result.batch_id, result.order)
                },
                ReadOutcome::NotFound => {},
            }
        }
    }

    fn drain_generation_results(&mut self, session: &mut ClientSession) {
        let max_queue = self.settings.max_send_queue_size;
        let Some(queue) = self
            .generator
            .as_deref_mut()
            .and_then(|generator| generator.results_mut(session.client()))
        else {
            return;
        };

        while let Some(result) = queue.front() {
            if result.epoch != session.epoch() {
                queue.pop_front();
                self.stats.stale_results += 1;
                continue;
            }
            if !result.sections.is_empty() && session.send_queue_len() >= max_queue {
                break;
            }
            let Some(result) = queue.pop_front() else {
                break;
            };
            self.stats.generation_results += 1;
            let packed = pack_column(result.key);
            session.clear_pending_generation(packed);
            session.finish_in_flight(result.batch_id);
            if !session.is_batch_live(result.batch_id) {
                continue;
            }
            session.mark_disk_done(packed);
            Self::enqueue_sections(session, result.sections, result.batch_id, result.order);
        }
    }

    fn flush_send_queue(&mut self, session: &mut ClientSession, now: Instant, allocation: u64) {
        let max_sections = self.settings.max_sections_per_tick_per_client;
        let client = session.client();
        while session.peek_send().is_some() {
            if session.sections_sent_this_tick() >= max_sections || !session.can_send(now, allocation)
            {
                break;
            }
            let Some(item) = session.pop_send() else {
                break;
            };
            if session.is_batch_cancelled(item.batch_id) {
                continue;
            }
            match self.sink.send(client, item.msg) {
                Ok(()) => {
                    session.record_send(item.cost);
                    self.bandwidth.record_send(item.cost);
                    self.metrics.sections_sent.inc();
                    self.metrics.bytes_sent.inc_by(item.cost as u64);
                    self.stats.sections_sent += 1;
                },
                Err(SendError::Disconnected) => {
                    self.metrics.send_failures.inc();
                    debug!(%client, "Client disconnected, stop flushing");
                    break;
                },
                Err(e) => {
                    self.metrics.send_failures.inc();
                    warn!(%client, %e, "Failed to send queued payload");
                },
            }
        }
    }

    /// Walks request batches in arrival order, resolving each position from
    /// memory, disk or generation until a budget runs out.
    fn advance_batches(&mut self, session: &mut ClientSession) {
        let settings = self.settings;
        let generation_cap = settings.generation_pending_cap();
        let mut work = 0;

        while work < settings.max_work_per_tick_per_client {
            let Some(batch_id) = session.next_batch_to_process() else {
                break;
            };
            loop {
                if work >= settings.max_work_per_tick_per_client
                    || session.send_queue_len() >= settings.max_send_queue_size
                    || self.serializations >= settings.max_serializations_per_tick
                {
                    return;
                }
                let Some((packed, client_timestamp)) = session.take_position(batch_id) else {
                    break;
                };
                if session.is_resolved_or_in_flight(packed) {
                    continue;
                }
                let key = unpack_column(packed);
                let dimension = session.view().dimension.clone();

                if let Some(column) = self.world.loaded_column(&dimension, key) {
                    let order = self.next_order();
                    let sections = serialize_column(
                        &dimension,
                        key,
                        &column,
                        epoch_secs(),
                        settings.send_light_data,
                    );
                    self.serializations += sections.len();
                    self.stats.serializations += sections.len();
                    session.mark_disk_done(packed);
                    Self::enqueue_sections(session, sections, batch_id, order);
                    work += 1;
                } else if self.disk_reader.is_some() {
                    if session.pending_disk_count() >= settings.max_concurrent_disk_reads {
                        session.rewind(batch_id);
                        return;
                    }
                    let order = self.next_order();
                    let job = DiskReadJob {
                        client: session.client(),
                        epoch: session.epoch(),
                        batch_id,
                        dimension,
                        key,
                        client_timestamp,
                        order,
                    };
                    if let Some(disk) = self.disk_reader.as_deref() {
                        disk.submit(job);
                    }
                    session.mark_pending_disk(packed, batch_id);
                    self.metrics.disk_reads_submitted.inc();
                    self.stats.disk_submitted += 1;
                    work += 1;
                } else if self.generator.is_some()
                    && within_distance(session.view().column, key, settings.generation_distance)
                {
                    if session.pending_generation_count() >= generation_cap {
                        session.rewind(batch_id);
                        return;
                    }
                    let order = self.next_order();
                    let request = GenerationRequest {
                        client: session.client(),
                        epoch: session.epoch(),
                        batch_id,
                        dimension,
                        key,
                        order,
                    };
                    if let Some(generator) = self.generator.as_deref_mut() {
                        generator.submit(self.world, request);
                    }
                    session.submit_pending_generation(packed, batch_id);
                    self.stats.generation_submitted += 1;
                    work += 1;
                }
                // Anything else has no source and resolves with no payload
            }
        }
    }

    fn emit_completions(&mut self, session: &mut ClientSession) {
        for (batch_id, status) in session.drain_completed() {
            self.complete(session, batch_id, status);
        }
    }

    fn broadcast_dirty(
        &mut self,
        sessions: &HashMap<ClientId, ClientSession>,
        change_tracker: &ChangeTracker,
    ) {
        let dirty = change_tracker.drain();
        if dirty.is_empty() {
            return;
        }
        let view_distance = self.settings.view_distance;
        for session in sessions.values() {
            let view = session.view();
            let Some(saved) = dirty.get(&view.dimension) else {
                continue;
            };
            let positions: Vec<i64> = saved
                .iter()
                .copied()
                .filter(|packed| within_distance(view.column, unpack_column(*packed), view_distance))
                .take(MAX_DIRTY_COLUMN_POSITIONS)
                .collect();
            if positions.is_empty() {
                continue;
            }
            let count = positions.len();
            if self
                .send(session.client(), ServerGeneral::DirtyColumns { positions })
                .is_ok()
            {
                self.metrics.dirty_columns_sent.inc_by(count as u64);
                self.stats.dirty_columns_sent += count;
            }
        }
    }
}
