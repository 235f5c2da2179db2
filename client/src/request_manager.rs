//! Decides which far-away columns to ask the server for.
//!
//! Every tick the manager walks square rings outward from the player's
//! column, starting at the innermost ring that is not yet settled, and
//! collects positions into one batch. A position is classified by the
//! timestamp cache:
//!
//! * unknown: never requested, always collected
//! * dirty: the server reported a change to a column we hold, collected with
//!   the cached timestamp
//! * empty (timestamp 0): collected again while the server offers a
//!   generation budget and the ring lies within generation distance
//! * has data: only collected while a resync sweep is due, so the server can
//!   answer "up to date" cheaply
//!
//! A ring is settled once none of its cells still needs a request. Positions
//! stay pending until the server answers or the batch times out, which paces
//! retries without extra timers.

use crate::{cache::ColumnCacheStore, settings::ClientSettings};
use common::{
    consts::MAX_CANCEL_BATCH_IDS, pack_column, unpack_column, within_distance, DimensionId,
};
use common_net::msg::{ChunkRequest, ClientGeneral, RequestStatus, SessionConfig};
use hashbrown::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use vek::*;

/// Batches the server never completed are forgotten after this long.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Extra columns of cached timestamps kept beyond the view distance, so
/// walking back and forth does not discard them.
pub const TIMESTAMP_PRUNE_MARGIN: u32 = 32;
const MAX_LOD_DISTANCE: u32 = 512;

/// Where the player stands and how far the host already renders real
/// terrain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerView {
    pub dimension: DimensionId,
    pub column: Vec2<i32>,
    /// Cells within this Euclidean radius are never requested.
    pub render_distance: u32,
}

/// Returns `(main budget, resync budget)` for one scan.
pub fn compute_budgets(
    max_requests_per_batch: usize,
    resync_batch_size: usize,
    needs_resync: bool,
) -> (usize, usize) {
    let resync = if needs_resync {
        resync_batch_size.min(max_requests_per_batch / 4)
    } else {
        0
    };
    (max_requests_per_batch, resync)
}

/// Cached timestamps with running counts of columns holding data and
/// columns known to be empty.
#[derive(Default)]
struct Timestamps {
    map: HashMap<i64, i64>,
    received: usize,
    empty: usize,
}

impl Timestamps {
    fn count(&mut self, timestamp: i64, add: bool) {
        let counter = match timestamp {
            0 => &mut self.empty,
            t if t > 0 => &mut self.received,
            _ => return,
        };
        if add {
            *counter += 1;
        } else {
            *counter = counter.saturating_sub(1);
        }
    }

    fn get(&self, packed: i64) -> Option<i64> { self.map.get(&packed).copied() }

    fn put(&mut self, packed: i64, timestamp: i64) {
        if let Some(old) = self.map.insert(packed, timestamp) {
            self.count(old, false);
        }
        self.count(timestamp, true);
    }

    fn load(&mut self, loaded: HashMap<i64, i64>) {
        self.map.extend(loaded);
        self.received = self.map.values().filter(|t| **t > 0).count();
        self.empty = self.map.values().filter(|t| **t == 0).count();
    }

    fn clear(&mut self) { *self = Self::default(); }

    fn retain_within(&mut self, center: Vec2<i32>, radius: u32) {
        let before = self.map.len();
        self.map
            .retain(|packed, _| within_distance(center, unpack_column(*packed), radius));
        if self.map.len() != before {
            self.received = self.map.values().filter(|t| **t > 0).count();
            self.empty = self.map.values().filter(|t| **t == 0).count();
        }
    }
}

struct TrackedBatch {
    positions: Vec<i64>,
    created_at: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestStats {
    pub pending_columns: usize,
    pub active_batches: usize,
    pub received_columns: usize,
    pub empty_columns: usize,
    pub scan_radius: u32,
    pub effective_distance: u32,
    pub batches_sent: u64,
    pub positions_requested: u64,
}

pub struct LodRequestManager {
    config: SessionConfig,
    server: String,
    cache: ColumnCacheStore,
    client_view_distance: u32,
    resync_batch_size: usize,
    resync_interval: Duration,

    dimension: Option<DimensionId>,
    last_column: Option<Vec2<i32>>,
    cache_loaded: bool,

    timestamps: Timestamps,
    dirty: HashSet<i64>,
    pending: HashSet<i64>,
    active_batches: HashMap<i32, TrackedBatch>,
    next_batch_id: i32,

    scan_radius: u32,
    needs_resync: bool,
    last_resync: Option<Instant>,

    batches_sent: u64,
    positions_requested: u64,
}

impl LodRequestManager {
    /// Starts a fresh session. Cached timestamps are loaded on the first
    /// tick, once the dimension is known, and revalidated by a resync sweep.
    pub fn new(config: SessionConfig, server: impl Into<String>, settings: &ClientSettings) -> Self {
        Self {
            config,
            server: server.into(),
            cache: ColumnCacheStore::new(&settings.cache_dir),
            client_view_distance: settings.view_distance,
            resync_batch_size: settings.resync_batch_size as usize,
            resync_interval: settings.resync_interval(),
            dimension: None,
            last_column: None,
            cache_loaded: false,
            timestamps: Timestamps::default(),
            dirty: HashSet::new(),
            pending: HashSet::new(),
            active_batches: HashMap::new(),
            next_batch_id: 0,
            scan_radius: 0,
            needs_resync: true,
            last_resync: None,
            batches_sent: 0,
            positions_requested: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig { &self.config }

    pub fn dimension(&self) -> Option<&DimensionId> { self.dimension.as_ref() }

    /// Radius actually scanned: the client's own setting if it is set and
    /// smaller than what the server allows.
    pub fn effective_distance(&self) -> u32 {
        let server = (self.config.view_distance.max(0) as u32).min(MAX_LOD_DISTANCE);
        if self.client_view_distance > 0 {
            self.client_view_distance.min(server)
        } else {
            server
        }
    }

    fn max_pending(&self) -> usize { self.config.max_pending_requests.max(0) as usize }

    fn max_per_batch(&self) -> usize { self.config.max_requests_per_batch.max(0) as usize }

    pub fn timestamp(&self, packed: i64) -> Option<i64> { self.timestamps.get(packed) }

    pub fn is_pending(&self, packed: i64) -> bool { self.pending.contains(&packed) }

    pub fn is_dirty(&self, packed: i64) -> bool { self.dirty.contains(&packed) }

    pub fn needs_resync(&self) -> bool { self.needs_resync }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            pending_columns: self.pending.len(),
            active_batches: self.active_batches.len(),
            received_columns: self.timestamps.received,
            empty_columns: self.timestamps.empty,
            scan_radius: self.scan_radius,
            effective_distance: self.effective_distance(),
            batches_sent: self.batches_sent,
            positions_requested: self.positions_requested,
        }
    }

    /// Advances the scan and returns the messages to send this tick.
    pub fn tick(&mut self, view: &PlayerView, now: Instant) -> Vec<ClientGeneral> {
        let mut outgoing = Vec::new();
        if !self.config.enabled {
            return outgoing;
        }

        let dimension_changed = self
            .dimension
            .as_ref()
            .is_some_and(|last| *last != view.dimension);
        if dimension_changed {
            self.on_dimension_change(&view.dimension);
        } else if !self.cache_loaded {
            let loaded = self.cache.load(&self.server, &view.dimension);
            self.timestamps.load(loaded);
            self.cache_loaded = true;
        }
        self.dimension = Some(view.dimension.clone());

        if !self.needs_resync {
            match self.last_resync {
                None => self.last_resync = Some(now),
                Some(last) if now.saturating_duration_since(last) >= self.resync_interval => {
                    debug!("Resync interval elapsed, revalidating cached columns");
                    self.needs_resync = true;
                },
                Some(_) => {},
            }
        }

        if self.last_column != Some(view.column) {
            outgoing.extend(self.prune_batches(view.column));
            let keep_radius = self.effective_distance() + TIMESTAMP_PRUNE_MARGIN;
            self.timestamps.retain_within(view.column, keep_radius);
            self.last_column = Some(view.column);
            self.scan_radius = 0;
        }

        self.purge_stale_batches(now);

        if self.pending.len() >= self.max_pending() {
            return outgoing;
        }

        outgoing.extend(self.scan(view, now));
        outgoing
    }

    fn on_dimension_change(&mut self, dimension: &DimensionId) {
        info!(%dimension, "Dimension changed, switching column cache");
        self.save_cache();
        self.pending.clear();
        self.active_batches.clear();
        self.timestamps.clear();
        self.dirty.clear();
        self.scan_radius = 0;
        self.needs_resync = true;
        self.timestamps.load(self.cache.load(&self.server, dimension));
        self.cache_loaded = true;
    }

    /// Drops in-flight positions that left the view distance. Batches left
    /// with nothing are cancelled on the server.
    fn prune_batches(&mut self, center: Vec2<i32>) -> Vec<ClientGeneral> {
        let radius = self.effective_distance();
        let pending = &mut self.pending;
        let mut cancelled = Vec::new();
        for (batch_id, batch) in self.active_batches.iter_mut() {
            batch.positions.retain(|packed| {
                let keep = within_distance(center, unpack_column(*packed), radius);
                if !keep {
                    pending.remove(packed);
                }
                keep
            });
            if batch.positions.is_empty() {
                cancelled.push(*batch_id);
            }
        }
        if cancelled.is_empty() {
            return Vec::new();
        }

        for batch_id in &cancelled {
            self.active_batches.remove(batch_id);
        }
        cancelled.sort_unstable();
        debug!(?cancelled, "Cancelling batches that moved out of range");
        cancelled
            .chunks(MAX_CANCEL_BATCH_IDS)
            .map(|ids| ClientGeneral::CancelRequest {
                batch_ids: ids.to_vec(),
            })
            .collect()
    }

    fn purge_stale_batches(&mut self, now: Instant) {
        let pending = &mut self.pending;
        self.active_batches.retain(|batch_id, batch| {
            let stale = now.saturating_duration_since(batch.created_at) > BATCH_TIMEOUT;
            if stale {
                warn!(%batch_id, positions = batch.positions.len(), "Server never completed batch");
                for packed in &batch.positions {
                    pending.remove(packed);
                }
            }
            !stale
        });
    }

    fn scan(&mut self, view: &PlayerView, now: Instant) -> Option<ClientGeneral> {
        let lod_distance = self.effective_distance();
        let max_pending = self.max_pending();
        let (mut budget, mut resync_budget) = compute_budgets(
            self.max_per_batch(),
            self.resync_batch_size,
            self.needs_resync,
        );
        let generation_enabled = self.config.generation_budget > 0;
        let mut generation_budget = self.config.generation_budget.max(0) as usize;
        let generation_distance = self.config.generation_distance.max(0) as u32;
        let exclusion_sq = (view.render_distance as i64).pow(2);

        let mut positions = Vec::new();
        let mut timestamps = Vec::new();

        for radius in self.scan_radius..=lod_distance {
            if budget == 0 || self.pending.len() + positions.len() >= max_pending {
                break;
            }
            let r = radius as i32;
            let mut can_advance = true;

            for side in 0..4 {
                for i in -r..=r {
                    let (dx, dz) = match side {
                        0 => (i, -r),
                        1 => (i, r),
                        2 => (-r, i),
                        _ => (r, i),
                    };
                    // Corners were already visited by the first two sides.
                    if side >= 2 && (dz == -r || dz == r) {
                        continue;
                    }
                    if (dx as i64).pow(2) + (dz as i64).pow(2) <= exclusion_sq {
                        continue;
                    }
                    let packed = pack_column(Vec2::new(
                        view.column.x.wrapping_add(dx),
                        view.column.y.wrapping_add(dz),
                    ));
                    if self.pending.contains(&packed) {
                        continue;
                    }

                    let has_room = budget > 0 && self.pending.len() + positions.len() < max_pending;
                    match self.timestamps.get(packed) {
                        None => {
                            if has_room {
                                positions.push(packed);
                                timestamps.push(0);
                                budget -= 1;
                            }
                            can_advance = false;
                        },
                        Some(timestamp) if self.dirty.contains(&packed) => {
                            if has_room {
                                positions.push(packed);
                                timestamps.push(timestamp);
                                budget -= 1;
                                self.dirty.remove(&packed);
                            }
                            can_advance = false;
                        },
                        Some(timestamp) if timestamp <= 0 => {
                            let in_range = radius <= generation_distance;
                            if has_room && generation_budget > 0 && in_range {
                                positions.push(packed);
                                timestamps.push(0);
                                budget -= 1;
                                generation_budget -= 1;
                                can_advance = false;
                            } else if generation_enabled && in_range {
                                can_advance = false;
                            }
                        },
                        Some(timestamp) => {
                            if has_room && resync_budget > 0 {
                                positions.push(packed);
                                timestamps.push(timestamp);
                                budget -= 1;
                                resync_budget -= 1;
                            }
                        },
                    }
                }
            }

            if can_advance {
                self.scan_radius = radius + 1;
            }
        }

        if self.scan_radius > lod_distance {
            self.scan_radius = 0;
            if self.needs_resync {
                debug!("Resync sweep complete");
                self.needs_resync = false;
                self.last_resync = Some(now);
            }
        }

        if positions.is_empty() {
            return None;
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id = self.next_batch_id.wrapping_add(1);
        self.pending.extend(positions.iter().copied());
        self.active_batches.insert(batch_id, TrackedBatch {
            positions: positions.clone(),
            created_at: now,
        });
        self.batches_sent += 1;
        self.positions_requested += positions.len() as u64;
        trace!(
            %batch_id,
            count = positions.len(),
            scan_radius = self.scan_radius,
            "Requesting columns"
        );
        Some(ClientGeneral::ChunkRequest(ChunkRequest {
            batch_id,
            positions,
            timestamps,
        }))
    }

    pub fn on_section_received(&mut self, column: Vec2<i32>, column_timestamp: i64) {
        let packed = pack_column(column);
        self.pending.remove(&packed);
        self.dirty.remove(&packed);
        self.timestamps.put(packed, column_timestamp);
    }

    /// The cached copy is current, so the stored timestamp stays.
    pub fn on_column_up_to_date(&mut self, column: Vec2<i32>) {
        self.pending.remove(&pack_column(column));
    }

    pub fn on_batch_complete(&mut self, batch_id: i32, status: RequestStatus) {
        let Some(batch) = self.active_batches.remove(&batch_id) else {
            return;
        };
        for packed in batch.positions {
            self.pending.remove(&packed);
            // Nothing arrived, so the server has nothing for this column yet.
            if status != RequestStatus::Rejected && self.timestamps.get(packed).is_none() {
                self.timestamps.put(packed, 0);
            }
        }
        if status == RequestStatus::Rejected {
            debug!(%batch_id, "Server rejected batch");
        }
    }

    /// Flags changed columns we hold data for so the scan requests them
    /// again.
    pub fn on_dirty_columns(&mut self, positions: &[i64]) {
        for packed in positions {
            if self.timestamps.get(*packed).is_some_and(|t| t > 0) {
                self.dirty.insert(*packed);
            }
        }
    }

    pub fn save_cache(&self) {
        let Some(dimension) = &self.dimension else {
            return;
        };
        if let Err(e) = self.cache.save(&self.server, dimension, &self.timestamps.map) {
            warn!(%e, %dimension, "Failed to save column cache");
        }
    }

    /// Forgets everything known about this server, on disk and in memory.
    pub fn flush_cache(&mut self) {
        if let Err(e) = self.cache.clear_for_server(&self.server) {
            warn!(%e, "Failed to clear column cache");
        }
        self.timestamps.clear();
        self.pending.clear();
        self.active_batches.clear();
        self.dirty.clear();
        self.scan_radius = 0;
        self.needs_resync = false;
        self.last_resync = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            protocol_version: common::consts::PROTOCOL_VERSION,
            enabled: true,
            view_distance: 2,
            max_requests_per_batch: 256,
            max_pending_requests: 512,
            generation_budget: 0,
            generation_distance: 0,
        }
    }

    fn settings(dir: &tempfile::TempDir) -> ClientSettings {
        ClientSettings {
            cache_dir: dir.path().to_path_buf(),
            resync_interval_secs: 10,
            ..ClientSettings::default()
        }
    }

    fn view(x: i32, z: i32) -> PlayerView {
        PlayerView {
            dimension: DimensionId::new("overworld"),
            column: Vec2::new(x, z),
            render_distance: 0,
        }
    }

    fn at(start: Instant, secs: u64) -> Instant { start + Duration::from_secs(secs) }

    fn request(msgs: &[ClientGeneral]) -> &ChunkRequest {
        msgs.iter()
            .find_map(|m| match m {
                ClientGeneral::ChunkRequest(r) => Some(r),
                _ => None,
            })
            .expect("no chunk request")
    }

    /// Answers every position of `req` with data at `timestamp`, then
    /// completes the batch.
    fn answer(manager: &mut LodRequestManager, req: &ChunkRequest, timestamp: i64) {
        for packed in &req.positions {
            manager.on_section_received(unpack_column(*packed), timestamp);
        }
        manager.on_batch_complete(req.batch_id, RequestStatus::Done);
    }

    #[test]
    fn budgets() {
        assert_eq!(compute_budgets(256, 32, true), (256, 32));
        assert_eq!(compute_budgets(256, 32, false), (256, 0));
        assert_eq!(compute_budgets(256, 200, true), (256, 64));
        assert_eq!(compute_budgets(4, 32, true), (4, 1));
        assert_eq!(compute_budgets(0, 32, true), (0, 0));
    }

    #[test]
    fn effective_distance_prefers_smaller_client_setting() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(&dir);
        let manager = LodRequestManager::new(config(), "srv", &s);
        assert_eq!(manager.effective_distance(), 2);

        s.view_distance = 1;
        assert_eq!(LodRequestManager::new(config(), "srv", &s).effective_distance(), 1);
        s.view_distance = 50;
        assert_eq!(LodRequestManager::new(config(), "srv", &s).effective_distance(), 2);
    }

    #[test]
    fn disabled_session_requests_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SessionConfig {
            enabled: false,
            ..config()
        };
        let mut manager = LodRequestManager::new(cfg, "srv", &settings(&dir));
        assert!(manager.tick(&view(0, 0), Instant::now()).is_empty());
    }

    #[test]
    fn first_scan_requests_unknown_rings_and_waits() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let start = Instant::now();

        let msgs = manager.tick(&view(0, 0), start);
        let req = request(&msgs);
        // Rings 1 and 2 around the player, the player's own column excluded
        assert_eq!(req.batch_id, 0);
        assert_eq!(req.positions.len(), 8 + 16);
        assert!(req.timestamps.iter().all(|t| *t == 0));
        assert!(!req.positions.contains(&pack_column(Vec2::new(0, 0))));
        assert_eq!(manager.stats().pending_columns, 24);
        // Only the excluded centre ring is settled
        assert_eq!(manager.stats().scan_radius, 1);

        // Everything is pending, so the sweep completes without new requests
        assert!(manager.tick(&view(0, 0), at(start, 1)).is_empty());
        assert!(!manager.needs_resync());
        assert_eq!(manager.stats().scan_radius, 0);
    }

    #[test]
    fn render_distance_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let mut v = view(10, 10);
        v.render_distance = 1;
        let msgs = manager.tick(&v, Instant::now());
        let req = request(&msgs);
        // dx² + dz² <= 1 leaves out the centre and the four edge neighbours
        assert_eq!(req.positions.len(), 24 - 4);
        assert!(!req.positions.contains(&pack_column(Vec2::new(11, 10))));
        assert!(req.positions.contains(&pack_column(Vec2::new(11, 11))));
    }

    #[test]
    fn completed_batch_marks_missing_columns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let start = Instant::now();
        let req = request(&manager.tick(&view(0, 0), start)).clone();

        let (with_data, without) = req.positions.split_at(10);
        for packed in with_data {
            manager.on_section_received(unpack_column(*packed), 500);
        }
        manager.on_batch_complete(req.batch_id, RequestStatus::Done);

        let stats = manager.stats();
        assert_eq!(stats.pending_columns, 0);
        assert_eq!(stats.active_batches, 0);
        assert_eq!(stats.received_columns, 10);
        assert_eq!(stats.empty_columns, without.len());
        assert_eq!(manager.timestamp(without[0]), Some(0));
        assert_eq!(manager.timestamp(with_data[0]), Some(500));

        // Without a generation budget empty columns are settled
        assert!(manager.tick(&view(0, 0), at(start, 1)).iter().all(|m| {
            !matches!(m, ClientGeneral::ChunkRequest(r) if r.positions.iter().any(|p| without.contains(p)))
        }));
    }

    #[test]
    fn rejected_batch_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let start = Instant::now();
        let req = request(&manager.tick(&view(0, 0), start)).clone();
        manager.on_batch_complete(req.batch_id, RequestStatus::Rejected);

        assert_eq!(manager.timestamp(req.positions[0]), None);
        assert_eq!(manager.stats().pending_columns, 0);
        let retry = request(&manager.tick(&view(0, 0), at(start, 1))).clone();
        assert_eq!(retry.batch_id, 1);
        assert_eq!(retry.positions.len(), 24);
    }

    #[test]
    fn up_to_date_keeps_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let req = request(&manager.tick(&view(0, 0), Instant::now())).clone();
        let key = unpack_column(req.positions[0]);
        manager.on_section_received(key, 77);
        assert!(!manager.is_pending(req.positions[0]));
        manager.on_column_up_to_date(unpack_column(req.positions[1]));
        assert!(!manager.is_pending(req.positions[1]));
        assert_eq!(manager.timestamp(req.positions[1]), None);
        assert_eq!(manager.timestamp(req.positions[0]), Some(77));
    }

    #[test]
    fn generation_budget_retries_empty_columns_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SessionConfig {
            generation_budget: 3,
            generation_distance: 1,
            ..config()
        };
        let mut manager = LodRequestManager::new(cfg, "srv", &settings(&dir));
        let start = Instant::now();
        let req = request(&manager.tick(&view(0, 0), start)).clone();
        // Nothing exists yet: everything becomes empty
        manager.on_batch_complete(req.batch_id, RequestStatus::Done);
        assert_eq!(manager.stats().empty_columns, 24);

        let retry = request(&manager.tick(&view(0, 0), at(start, 1))).clone();
        assert_eq!(retry.positions.len(), 3);
        for packed in &retry.positions {
            assert!(within_distance(Vec2::zero(), unpack_column(*packed), 1));
        }
        // Ring 2 lies beyond generation distance, its empty columns stay settled
        let next = request(&manager.tick(&view(0, 0), at(start, 2))).clone();
        assert_eq!(next.positions.len(), 3);
        for packed in &next.positions {
            assert!(within_distance(Vec2::zero(), unpack_column(*packed), 1));
            assert!(!retry.positions.contains(packed));
        }
    }

    #[test]
    fn dirty_columns_are_requested_with_cached_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let start = Instant::now();
        let req = request(&manager.tick(&view(0, 0), start)).clone();
        answer(&mut manager, &req, 100);
        // The initial resync sweep revalidates what just arrived
        let resync = request(&manager.tick(&view(0, 0), at(start, 1))).clone();
        assert_eq!(resync.positions.len(), 24);
        assert!(!manager.needs_resync());
        for packed in &resync.positions {
            manager.on_column_up_to_date(unpack_column(*packed));
        }
        manager.on_batch_complete(resync.batch_id, RequestStatus::Done);

        let changed = req.positions[3];
        let unknown = pack_column(Vec2::new(1000, 1000));
        manager.on_dirty_columns(&[changed, unknown]);
        assert!(manager.is_dirty(changed));
        assert!(!manager.is_dirty(unknown));

        let msgs = manager.tick(&view(0, 0), at(start, 2));
        let dirty_req = request(&msgs);
        assert_eq!(dirty_req.positions, vec![changed]);
        assert_eq!(dirty_req.timestamps, vec![100]);
        assert!(!manager.is_dirty(changed));
    }

    #[test]
    fn resync_revalidates_cached_columns() {
        let dir = tempfile::tempdir().unwrap();
        let s = ClientSettings {
            resync_batch_size: 5,
            ..settings(&dir)
        };
        let start = Instant::now();

        let mut first = LodRequestManager::new(config(), "srv", &s);
        let req = request(&first.tick(&view(0, 0), start)).clone();
        answer(&mut first, &req, 100);
        first.save_cache();

        // A new session loads the cache and revalidates part of it per tick
        let mut second = LodRequestManager::new(config(), "srv", &s);
        assert!(second.needs_resync());
        let first_msgs = second.tick(&view(0, 0), start);
        let resync = request(&first_msgs);
        assert_eq!(second.stats().received_columns, 24);
        assert_eq!(resync.positions.len(), 5);
        assert!(resync.timestamps.iter().all(|t| *t == 100));
        // Cached columns never block, so the sweep completed
        assert!(!second.needs_resync());

        // Nothing to do until the interval elapses
        assert!(second.tick(&view(0, 0), at(start, 5)).is_empty());
        let later_msgs = second.tick(&view(0, 0), at(start, 11));
        let later = request(&later_msgs);
        assert_eq!(later.positions.len(), 5);
        assert!(later.positions.iter().all(|p| !resync.positions.contains(p)));
    }

    #[test]
    fn max_pending_caps_requests() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SessionConfig {
            max_pending_requests: 5,
            ..config()
        };
        let mut manager = LodRequestManager::new(cfg, "srv", &settings(&dir));
        let start = Instant::now();
        assert_eq!(request(&manager.tick(&view(0, 0), start)).positions.len(), 5);
        assert!(manager.tick(&view(0, 0), at(start, 1)).is_empty());
    }

    #[test]
    fn moving_away_cancels_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let start = Instant::now();
        let first = request(&manager.tick(&view(0, 0), start)).clone();
        manager.on_section_received(Vec2::new(1, 1), 9);

        let msgs = manager.tick(&view(100, 100), at(start, 1));
        assert!(msgs.contains(&ClientGeneral::CancelRequest {
            batch_ids: vec![first.batch_id],
        }));
        // Cached timestamps beyond view distance plus margin are dropped
        assert_eq!(manager.timestamp(pack_column(Vec2::new(1, 1))), None);
        // And scanning restarts around the new position
        let req = request(&msgs);
        assert!(req
            .positions
            .iter()
            .all(|p| within_distance(Vec2::new(100, 100), unpack_column(*p), 2)));
        assert_eq!(manager.stats().active_batches, 1);
        // The late completion of the cancelled batch is ignored
        manager.on_batch_complete(first.batch_id, RequestStatus::Cancelled);
        assert_eq!(manager.stats().active_batches, 1);
    }

    #[test]
    fn small_move_keeps_batches_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let start = Instant::now();
        request(&manager.tick(&view(0, 0), start));
        let msgs = manager.tick(&view(1, 0), at(start, 1));
        assert!(!msgs
            .iter()
            .any(|m| matches!(m, ClientGeneral::CancelRequest { .. })));
        // Ring 2 positions on the far side left the range
        assert!(!manager.is_pending(pack_column(Vec2::new(-2, 0))));
        assert!(manager.is_pending(pack_column(Vec2::new(1, 2))));
    }

    #[test]
    fn stale_batches_are_purged() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LodRequestManager::new(config(), "srv", &settings(&dir));
        let start = Instant::now();
        request(&manager.tick(&view(0, 0), start));
        assert!(manager.tick(&view(0, 0), at(start, 30)).is_empty());

        let msgs = manager.tick(&view(0, 0), at(start, 61));
        let retry = request(&msgs);
        assert_eq!(retry.batch_id, 1);
        assert_eq!(retry.positions.len(), 24);
        assert_eq!(manager.stats().active_batches, 1);
    }

    #[test]
    fn dimension_change_swaps_caches() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir);
        let store = ColumnCacheStore::new(&s.cache_dir);
        let mut manager = LodRequestManager::new(config(), "srv", &s);
        let start = Instant::now();
        let req = request(&manager.tick(&view(0, 0), start)).clone();
        answer(&mut manager, &req, 42);

        let mut nether = view(0, 0);
        nether.dimension = DimensionId::new("nether");
        let msgs = manager.tick(&nether, at(start, 1));
        assert_eq!(manager.dimension(), Some(&nether.dimension));
        assert!(manager.needs_resync());
        // Old dimension persisted, new one starts from scratch
        assert_eq!(store.load("srv", &DimensionId::new("overworld")).len(), 24);
        assert_eq!(manager.stats().received_columns, 0);
        assert_eq!(request(&msgs).positions.len(), 24);
    }

    #[test]
    fn flush_forgets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir);
        let mut manager = LodRequestManager::new(config(), "srv", &s);
        let start = Instant::now();
        let req = request(&manager.tick(&view(0, 0), start)).clone();
        answer(&mut manager, &req, 42);
        manager.save_cache();
        assert!(dir.path().join("srv").exists());

        manager.flush_cache();
        assert!(!dir.path().join("srv").exists());
        let stats = manager.stats();
        assert_eq!(stats.received_columns, 0);
        assert_eq!(stats.pending_columns, 0);
        assert_eq!(request(&manager.tick(&view(0, 0), at(start, 1))).positions.len(), 24);
    }
}
