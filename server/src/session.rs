//! Per-client request state kept on the tick thread.

use crate::bandwidth::ClientTokenBucket;
use common::{unpack_column, within_distance, ClientId, DimensionId};
use common_net::msg::{ChunkRequest, RequestStatus, ServerGeneral};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    time::{Duration, Instant},
};
use tracing::warn;
use vek::*;

const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Where a client currently is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientView {
    pub dimension: DimensionId,
    pub column: Vec2<i32>,
}

struct RequestBatch {
    positions: Vec<i64>,
    timestamps: Vec<i64>,
    cursor: usize,
    cancelled: bool,
}

impl RequestBatch {
    fn cursor_at_end(&self) -> bool { self.cursor >= self.positions.len() }
}

/// Work still owed to a batch: jobs running on the disk reader or the
/// generator, and payloads sitting in the send queue.
#[derive(Default)]
struct BatchProgress {
    in_flight: usize,
    queued: usize,
}

/// A produced payload waiting for bandwidth.
pub struct QueuedPayload {
    pub msg: ServerGeneral,
    pub batch_id: i32,
    pub cost: usize,
    pub order: u64,
    seq: u64,
}

impl PartialEq for QueuedPayload {
    fn eq(&self, other: &Self) -> bool { self.order == other.order && self.seq == other.seq }
}

impl Eq for QueuedPayload {}

impl PartialOrd for QueuedPayload {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for QueuedPayload {
    // Reversed so the max-heap pops the smallest submission order first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.order, other.seq).cmp(&(self.order, self.seq))
    }
}

/// Result of offering a new batch to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchAdmission {
    Accepted { positions: usize, rejected: usize },
    /// A batch with this id is still in progress; the new one is ignored.
    Duplicate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub sections_sent: u64,
    pub bytes_sent: u64,
    pub batches_received: u64,
    pub batches_rejected: u64,
    pub batches_completed: u64,
    pub batches_cancelled: u64,
    pub positions_rejected: u64,
}

pub struct ClientSession {
    client: ClientId,
    protocol_version: i32,
    view: ClientView,
    last_dimension: DimensionId,
    /// Bumped on every dimension change. Results carrying an older epoch
    /// are discarded.
    epoch: u32,
    batches: IndexMap<i32, RequestBatch>,
    progress: HashMap<i32, BatchProgress>,
    cancelled: HashSet<i32>,
    send_queue: BinaryHeap<QueuedPayload>,
    enqueue_seq: u64,
    pending_disk: HashSet<i64>,
    pending_generation: HashSet<i64>,
    disk_done: HashSet<i64>,
    bucket: ClientTokenBucket,
    sections_sent_this_tick: u32,
    stats: SessionStats,
    last_warn: Option<Instant>,
}

impl ClientSession {
    pub fn new(client: ClientId, protocol_version: i32, view: ClientView) -> Self {
        Self {
            client,
            protocol_version,
            last_dimension: view.dimension.clone(),
            view,
            epoch: 0,
            batches: IndexMap::new(),
            progress: HashMap::new(),
            cancelled: HashSet::new(),
            send_queue: BinaryHeap::new(),
            enqueue_seq: 0,
            pending_disk: HashSet::new(),
            pending_generation: HashSet::new(),
            disk_done: HashSet::new(),
            bucket: ClientTokenBucket::default(),
            sections_sent_this_tick: 0,
            stats: SessionStats::default(),
            last_warn: None,
        }
    }

    pub fn client(&self) -> ClientId { self.client }

    pub fn protocol_version(&self) -> i32 { self.protocol_version }

    pub fn view(&self) -> &ClientView { &self.view }

    pub fn set_view(&mut self, view: ClientView) { self.view = view; }

    pub fn epoch(&self) -> u32 { self.epoch }

    pub fn stats(&self) -> &SessionStats { &self.stats }

    pub fn stats_mut(&mut self) -> &mut SessionStats { &mut self.stats }

    /// True once per change of the client's dimension.
    pub fn check_dimension_change(&mut self) -> bool {
        if self.view.dimension != self.last_dimension {
            self.last_dimension = self.view.dimension.clone();
            true
        } else {
            false
        }
    }

    /// Forgets all in-flight work and starts a new epoch. Returns the ids of
    /// batches that never got a completion notice, including cancelled ones
    /// not yet drained.
    pub fn reset_for_dimension_change(&mut self) -> Vec<i32> {
        let unfinished = self.batches.keys().copied().collect();
        self.batches.clear();
        self.progress.clear();
        self.cancelled.clear();
        self.send_queue.clear();
        self.pending_disk.clear();
        self.pending_generation.clear();
        self.disk_done.clear();
        self.epoch = self.epoch.wrapping_add(1);
        unfinished
    }

    fn warn_rate_limited(&mut self, now: Instant, f: impl FnOnce(ClientId)) {
        if self
            .last_warn
            .map_or(true, |last| now.saturating_duration_since(last) >= WARN_INTERVAL)
        {
            self.last_warn = Some(now);
            f(self.client);
        }
    }

    /// Stores a new batch. Positions beyond `max_per_batch` or outside the
    /// view distance are dropped and counted as rejected.
    pub fn add_batch(
        &mut self,
        request: ChunkRequest,
        view_distance: u32,
        max_per_batch: usize,
        now: Instant,
    ) -> BatchAdmission {
        let batch_id = request.batch_id;
        if self.batches.contains_key(&batch_id) || self.progress.contains_key(&batch_id) {
            self.warn_rate_limited(now, |client| {
                warn!(%client, batch_id, "Ignoring batch reusing an id still in progress")
            });
            return BatchAdmission::Duplicate;
        }

        let ChunkRequest {
            mut positions,
            mut timestamps,
            ..
        } = request;
        let mut rejected = 0;
        if positions.len() > max_per_batch {
            rejected += positions.len() - max_per_batch;
            positions.truncate(max_per_batch);
        }
        timestamps.resize(positions.len(), 0);

        let center = self.view.column;
        let mut kept_positions = Vec::with_capacity(positions.len());
        let mut kept_timestamps = Vec::with_capacity(positions.len());
        for (packed, ts) in positions.into_iter().zip(timestamps) {
            if within_distance(center, unpack_column(packed), view_distance) {
                kept_positions.push(packed);
                kept_timestamps.push(ts);
            } else {
                rejected += 1;
            }
        }

        let accepted = kept_positions.len();
        self.batches.insert(batch_id, RequestBatch {
            positions: kept_positions,
            timestamps: kept_timestamps,
            cursor: 0,
            cancelled: false,
        });
        self.progress.insert(batch_id, BatchProgress::default());
        self.stats.batches_received += 1;
        self.stats.positions_rejected += rejected as u64;
        if rejected > 0 {
            self.warn_rate_limited(now, |client| {
                warn!(%client, batch_id, rejected, "Rejected positions from request batch")
            });
        }
        BatchAdmission::Accepted {
            positions: accepted,
            rejected,
        }
    }

    pub fn pending_batch_count(&self) -> usize { self.batches.len() }

    /// Marks batches cancelled and drops their queued payloads.
    pub fn cancel_batches(&mut self, batch_ids: &[i32]) {
        let mut any = false;
        for id in batch_ids {
            if let Some(batch) = self.batches.get_mut(id) {
                if !batch.cancelled {
                    batch.cancelled = true;
                    self.cancelled.insert(*id);
                    any = true;
                }
            }
        }
        if any {
            let cancelled = &self.cancelled;
            self.send_queue.retain(|p| !cancelled.contains(&p.batch_id));
            for id in batch_ids {
                if let Some(progress) = self.progress.get_mut(id) {
                    progress.queued = 0;
                }
            }
        }
    }

    pub fn is_batch_cancelled(&self, batch_id: i32) -> bool { self.cancelled.contains(&batch_id) }

    /// A batch that still exists and was not cancelled.
    pub fn is_batch_live(&self, batch_id: i32) -> bool {
        self.batches
            .get(&batch_id)
            .map_or(false, |b| !b.cancelled)
    }

    /// The first batch that is neither cancelled nor fully walked.
    pub fn next_batch_to_process(&self) -> Option<i32> {
        self.batches
            .iter()
            .find(|(_, b)| !b.cancelled && !b.cursor_at_end())
            .map(|(id, _)| *id)
    }

    /// Takes the position under the batch cursor and advances it.
    pub fn take_position(&mut self, batch_id: i32) -> Option<(i64, i64)> {
        let batch = self.batches.get_mut(&batch_id)?;
        if batch.cancelled || batch.cursor_at_end() {
            return None;
        }
        let i = batch.cursor;
        batch.cursor += 1;
        Some((batch.positions[i], batch.timestamps[i]))
    }

    /// Steps the cursor back so the last taken position is retried.
    pub fn rewind(&mut self, batch_id: i32) {
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.cursor = batch.cursor.saturating_sub(1);
        }
    }

    pub fn is_resolved_or_in_flight(&self, packed: i64) -> bool {
        self.disk_done.contains(&packed)
            || self.pending_disk.contains(&packed)
            || self.pending_generation.contains(&packed)
    }

    pub fn pending_disk_count(&self) -> usize { self.pending_disk.len() }

    pub fn pending_generation_count(&self) -> usize { self.pending_generation.len() }

    pub fn mark_pending_disk(&mut self, packed: i64, batch_id: i32) {
        self.pending_disk.insert(packed);
        self.progress.entry(batch_id).or_default().in_flight += 1;
    }

    pub fn clear_pending_disk(&mut self, packed: i64) { self.pending_disk.remove(&packed); }

    /// Moves a column from the disk stage to generation. The batch keeps
    /// owing the result.
    pub fn mark_pending_generation(&mut self, packed: i64) { self.pending_generation.insert(packed); }

    /// Records a generation job started directly from a batch.
    pub fn submit_pending_generation(&mut self, packed: i64, batch_id: i32) {
        self.pending_generation.insert(packed);
        self.progress.entry(batch_id).or_default().in_flight += 1;
    }

    pub fn clear_pending_generation(&mut self, packed: i64) { self.pending_generation.remove(&packed); }

    pub fn mark_disk_done(&mut self, packed: i64) { self.disk_done.insert(packed); }

    /// Settles one in-flight job of a batch. Cancelled batches are forgotten
    /// once nothing is in flight anymore.
    pub fn finish_in_flight(&mut self, batch_id: i32) {
        let Some(progress) = self.progress.get_mut(&batch_id) else {
            return;
        };
        progress.in_flight = progress.in_flight.saturating_sub(1);
        if progress.in_flight == 0 && !self.batches.contains_key(&batch_id) {
            self.progress.remove(&batch_id);
            self.cancelled.remove(&batch_id);
        }
    }

    pub fn enqueue(&mut self, msg: ServerGeneral, batch_id: i32, cost: usize, order: u64) {
        self.enqueue_seq += 1;
        self.send_queue.push(QueuedPayload {
            msg,
            batch_id,
            cost,
            order,
            seq: self.enqueue_seq,
        });
        self.progress.entry(batch_id).or_default().queued += 1;
    }

    pub fn send_queue_len(&self) -> usize { self.send_queue.len() }

    pub fn peek_send(&self) -> Option<&QueuedPayload> { self.send_queue.peek() }

    pub fn pop_send(&mut self) -> Option<QueuedPayload> {
        let item = self.send_queue.pop()?;
        if let Some(progress) = self.progress.get_mut(&item.batch_id) {
            progress.queued = progress.queued.saturating_sub(1);
        }
        Some(item)
    }

    pub fn reset_tick_counter(&mut self) { self.sections_sent_this_tick = 0; }

    pub fn sections_sent_this_tick(&self) -> u32 { self.sections_sent_this_tick }

    pub fn can_send(&mut self, now: Instant, allocation: u64) -> bool {
        self.bucket.can_send_at(now, allocation)
    }

    pub fn record_send(&mut self, bytes: usize) {
        self.bucket.record_send(bytes);
        self.sections_sent_this_tick += 1;
        self.stats.sections_sent += 1;
        self.stats.bytes_sent += bytes as u64;
    }

    /// Removes batches that are finished and returns their completion
    /// status in arrival order. A batch is done once its cursor reached the
    /// end and every job and payload it produced has been handed off.
    pub fn drain_completed(&mut self) -> Vec<(i32, RequestStatus)> {
        let progress = &self.progress;
        let finished: Vec<i32> = self
            .batches
            .iter()
            .filter(|(id, b)| {
                b.cancelled
                    || (b.cursor_at_end()
                        && progress
                            .get(*id)
                            .map_or(true, |p| p.in_flight == 0 && p.queued == 0))
            })
            .map(|(id, _)| *id)
            .collect();

        let mut completed = Vec::with_capacity(finished.len());
        for id in finished {
            let Some(batch) = self.batches.shift_remove(&id) else {
                continue;
            };
            for packed in &batch.positions {
                self.disk_done.remove(packed);
            }
            let in_flight = self.progress.get(&id).map_or(0, |p| p.in_flight);
            if in_flight == 0 {
                self.progress.remove(&id);
                self.cancelled.remove(&id);
            }
            if batch.cancelled {
                self.stats.batches_cancelled += 1;
                completed.push((id, RequestStatus::Cancelled));
            } else {
                self.stats.batches_completed += 1;
                completed.push((id, RequestStatus::Done));
            }
        }
        completed
    }
}
