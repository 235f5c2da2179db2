//! Resolves requested columns against the persistent store on a small,
//! fixed pool of worker threads.
//!
//! Workers never touch client state. Every finished job is sent through a
//! single channel which the tick thread drains with [`ChunkDiskReader::poll`]
//! into per-client queues.

use crate::{provider::ColumnStore, serialize::serialize_column};
use common::{ClientId, DimensionId};
use common_net::msg::ChunkSection;
use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};
use vek::*;

#[derive(Clone, Debug)]
pub struct DiskReadJob {
    pub client: ClientId,
    /// Session epoch the job was submitted under.
    pub epoch: u32,
    pub batch_id: i32,
    pub dimension: DimensionId,
    pub key: Vec2<i32>,
    /// Timestamp the client already holds, 0 if none.
    pub client_timestamp: i64,
    pub order: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReadOutcome {
    /// The client's copy is at least as new as the stored one.
    UpToDate { timestamp: i64 },
    Found {
        sections: Vec<ChunkSection>,
        timestamp: i64,
    },
    /// Absent, partially generated or unreadable. A candidate for generation.
    NotFound,
}

#[derive(Clone, Debug)]
pub struct DiskReadResult {
    pub client: ClientId,
    pub epoch: u32,
    pub batch_id: i32,
    pub key: Vec2<i32>,
    pub order: u64,
    pub outcome: ReadOutcome,
}

#[derive(Default)]
struct DiskReaderStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    up_to_date: AtomicU64,
    empty: AtomicU64,
    not_full: AtomicU64,
    no_sections: AtomicU64,
    errors: AtomicU64,
    payloads: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of the reader's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskReaderSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub up_to_date: u64,
    pub empty: u64,
    pub not_full: u64,
    pub no_sections: u64,
    pub errors: u64,
    pub payloads: u64,
    pub discarded: u64,
    /// Results waiting on the tick thread.
    pub buffered: usize,
}

struct Worker {
    store: Arc<dyn ColumnStore>,
    send_light: bool,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DiskReaderStats>,
}

impl Worker {
    fn read(&self, job: &DiskReadJob) -> Option<ReadOutcome> {
        let header_timestamp = self.store.read_timestamp(&job.dimension, job.key);
        if job.client_timestamp > 0 && header_timestamp > 0 && header_timestamp <= job.client_timestamp
        {
            self.stats.up_to_date.fetch_add(1, Ordering::Relaxed);
            return Some(ReadOutcome::UpToDate {
                timestamp: header_timestamp,
            });
        }

        let stored = match self.store.read_column(&job.dimension, job.key) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                self.stats.empty.fetch_add(1, Ordering::Relaxed);
                return Some(ReadOutcome::NotFound);
            },
            Err(e) => {
                warn!(%e, key = ?job.key, "Failed to read column from disk");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Some(ReadOutcome::NotFound);
            },
        };
        if self.shutdown.load(Ordering::Relaxed) {
            return None;
        }

        if !stored.fully_generated {
            self.stats.not_full.fetch_add(1, Ordering::Relaxed);
            return Some(ReadOutcome::NotFound);
        }
        if stored.column.sections.is_empty() {
            self.stats.no_sections.fetch_add(1, Ordering::Relaxed);
            return Some(ReadOutcome::NotFound);
        }

        let timestamp = if header_timestamp > 0 {
            header_timestamp
        } else {
            stored.last_update
        };
        let sections = serialize_column(
            &job.dimension,
            job.key,
            &stored.column,
            timestamp,
            self.send_light,
        );
        self.stats
            .payloads
            .fetch_add(sections.len() as u64, Ordering::Relaxed);
        Some(ReadOutcome::Found {
            sections,
            timestamp,
        })
    }

    fn run(&self, job: DiskReadJob, result_tx: &Sender<DiskReadResult>) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.read(&job))) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(_) => {
                error!(key = ?job.key, "Column store panicked while reading");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                ReadOutcome::NotFound
            },
        };
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        let _ = result_tx.send(DiskReadResult {
            client: job.client,
            epoch: job.epoch,
            batch_id: job.batch_id,
            key: job.key,
            order: job.order,
            outcome,
        });
    }
}

pub struct ChunkDiskReader {
    pool: rayon::ThreadPool,
    worker: Arc<Worker>,
    result_tx: Sender<DiskReadResult>,
    result_rx: Receiver<DiskReadResult>,
    results: HashMap<ClientId, VecDeque<DiskReadResult>>,
}

impl ChunkDiskReader {
    pub fn new(
        threads: usize,
        store: Arc<dyn ColumnStore>,
        send_light: bool,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("lodstream-disk-reader-{}", i))
            .build()?;
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            pool,
            worker: Arc::new(Worker {
                store,
                send_light,
                shutdown: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(DiskReaderStats::default()),
            }),
            result_tx,
            result_rx,
            results: HashMap::new(),
        })
    }

    /// Queues a read on the worker pool. Jobs submitted after
    /// [`ChunkDiskReader::shutdown`] are dropped.
    pub fn submit(&self, job: DiskReadJob) {
        if self.is_shutdown() {
            debug!(key = ?job.key, "Dropping disk read submitted after shutdown");
            return;
        }
        self.worker.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::clone(&self.worker);
        let result_tx = self.result_tx.clone();
        self.pool.spawn(move || worker.run(job, &result_tx));
    }

    /// Starts buffering results for `client`. Results for clients that are
    /// not registered are discarded.
    pub fn register_client(&mut self, client: ClientId) { self.results.entry(client).or_default(); }

    pub fn remove_client(&mut self, client: ClientId) { self.results.remove(&client); }

    /// Drops results already buffered for `client` but keeps it registered.
    pub fn clear_client_results(&mut self, client: ClientId) {
        if let Some(queue) = self.results.get_mut(&client) {
            queue.clear();
        }
    }

    /// Moves finished jobs from the worker channel into per-client queues.
    pub fn poll(&mut self) {
        for result in self.result_rx.try_iter() {
            match self.results.get_mut(&result.client) {
                Some(queue) => queue.push_back(result),
                None => {
                    self.worker.stats.discarded.fetch_add(1, Ordering::Relaxed);
                },
            }
        }
    }

    pub fn results_mut(&mut self, client: ClientId) -> Option<&mut VecDeque<DiskReadResult>> {
        self.results.get_mut(&client)
    }

    pub fn shutdown(&self) { self.worker.shutdown.store(true, Ordering::Relaxed); }

    pub fn is_shutdown(&self) -> bool { self.worker.shutdown.load(Ordering::Relaxed) }

    pub fn snapshot(&self) -> DiskReaderSnapshot {
        let stats = &self.worker.stats;
        DiskReaderSnapshot {
            submitted: stats.submitted.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            up_to_date: stats.up_to_date.load(Ordering::Relaxed),
            empty: stats.empty.load(Ordering::Relaxed),
            not_full: stats.not_full.load(Ordering::Relaxed),
            no_sections: stats.no_sections.load(Ordering::Relaxed),
            errors: stats.errors.load(Ordering::Relaxed),
            payloads: stats.payloads.load(Ordering::Relaxed),
            discarded: stats.discarded.load(Ordering::Relaxed),
            buffered: self.results.values().map(VecDeque::len).sum(),
        }
    }
}

impl Drop for ChunkDiskReader {
    fn drop(&mut self) { self.shutdown(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::StoreError,
        provider::{Column, Section, StoredColumn},
    };
    use bytes::Bytes;
    use std::{
        io,
        time::{Duration, Instant},
    };

    #[derive(Clone)]
    enum Entry {
        Stored(StoredColumn),
        Fail,
        Panic,
    }

    #[derive(Default)]
    struct FakeStore {
        timestamps: HashMap<Vec2<i32>, i64>,
        columns: HashMap<Vec2<i32>, Entry>,
    }

    impl ColumnStore for FakeStore {
        fn read_timestamp(&self, _: &DimensionId, key: Vec2<i32>) -> i64 {
            self.timestamps.get(&key).copied().unwrap_or(0)
        }

        fn read_column(
            &self,
            _: &DimensionId,
            key: Vec2<i32>,
        ) -> Result<Option<StoredColumn>, StoreError> {
            match self.columns.get(&key) {
                None => Ok(None),
                Some(Entry::Stored(c)) => Ok(Some(c.clone())),
                Some(Entry::Fail) => Err(io::Error::new(io::ErrorKind::Other, "boom").into()),
                Some(Entry::Panic) => panic!("store exploded"),
            }
        }
    }

    fn stored(fully_generated: bool, sections: usize, last_update: i64) -> Entry {
        Entry::Stored(StoredColumn {
            fully_generated,
            last_update,
            column: Column {
                sections: (0..sections)
                    .map(|y| Section {
                        y: y as i32,
                        data: Bytes::from_static(&[1, 2, 3]),
                        ..Section::default()
                    })
                    .collect(),
            },
        })
    }

    fn job(client: u64, x: i32, client_timestamp: i64) -> DiskReadJob {
        DiskReadJob {
            client: ClientId(client),
            epoch: 0,
            batch_id: 1,
            dimension: DimensionId::new("overworld"),
            key: Vec2::new(x, 0),
            client_timestamp,
            order: x as u64,
        }
    }

    fn collect(reader: &mut ChunkDiskReader, client: ClientId, n: usize) -> Vec<DiskReadResult> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            reader.poll();
            let len = reader.results_mut(client).map_or(0, |q| q.len());
            if len >= n || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let mut out: Vec<_> = reader
            .results_mut(client)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        out.sort_by_key(|r| r.order);
        out
    }

    fn reader_with(store: FakeStore) -> ChunkDiskReader {
        ChunkDiskReader::new(2, Arc::new(store), true).unwrap()
    }

    #[test]
    fn outcomes_per_record_state() {
        let mut store = FakeStore::default();
        store.timestamps.insert(Vec2::new(0, 0), 100);
        store.columns.insert(Vec2::new(0, 0), stored(true, 2, 5));
        store.timestamps.insert(Vec2::new(1, 0), 100);
        store.columns.insert(Vec2::new(1, 0), stored(true, 2, 5));
        store.columns.insert(Vec2::new(2, 0), stored(true, 1, 55));
        store.columns.insert(Vec2::new(3, 0), stored(false, 2, 5));
        store.columns.insert(Vec2::new(4, 0), stored(true, 0, 5));
        store.columns.insert(Vec2::new(5, 0), Entry::Fail);
        store.columns.insert(Vec2::new(6, 0), Entry::Panic);
        let mut reader = reader_with(store);
        let client = ClientId(1);
        reader.register_client(client);

        reader.submit(job(1, 0, 150));
        reader.submit(job(1, 1, 50));
        reader.submit(job(1, 2, 0));
        reader.submit(job(1, 3, 0));
        reader.submit(job(1, 4, 0));
        reader.submit(job(1, 5, 0));
        reader.submit(job(1, 6, 0));
        reader.submit(job(1, 7, 0));

        let results = collect(&mut reader, client, 8);
        assert_eq!(results.len(), 8);
        assert_eq!(results[0].outcome, ReadOutcome::UpToDate { timestamp: 100 });
        match &results[1].outcome {
            ReadOutcome::Found {
                sections,
                timestamp,
            } => {
                assert_eq!(*timestamp, 100);
                assert_eq!(sections.len(), 2);
                assert!(sections.iter().all(|s| s.column_timestamp == 100));
            },
            other => panic!("expected found, got {:?}", other),
        }
        assert!(matches!(
            results[2].outcome,
            ReadOutcome::Found { timestamp: 55, .. }
        ));
        for r in &results[3..] {
            assert_eq!(r.outcome, ReadOutcome::NotFound);
        }

        let snap = reader.snapshot();
        assert_eq!(snap.submitted, 8);
        assert_eq!(snap.completed, 8);
        assert_eq!(snap.up_to_date, 1);
        assert_eq!(snap.not_full, 1);
        assert_eq!(snap.no_sections, 1);
        assert_eq!(snap.errors, 2);
        assert_eq!(snap.empty, 1);
        assert_eq!(snap.payloads, 3);
    }

    #[test]
    fn unregistered_results_are_discarded() {
        let mut reader = reader_with(FakeStore::default());
        reader.register_client(ClientId(1));
        reader.submit(job(2, 0, 0));
        reader.submit(job(1, 1, 0));
        let results = collect(&mut reader, ClientId(1), 1);
        assert_eq!(results.len(), 1);

        let deadline = Instant::now() + Duration::from_secs(10);
        while reader.snapshot().discarded == 0 && Instant::now() < deadline {
            reader.poll();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reader.snapshot().discarded, 1);
        assert!(reader.results_mut(ClientId(2)).is_none());
    }

    #[test]
    fn jobs_after_shutdown_are_dropped() {
        let mut reader = reader_with(FakeStore::default());
        reader.register_client(ClientId(1));
        reader.shutdown();
        reader.submit(job(1, 0, 0));
        std::thread::sleep(Duration::from_millis(20));
        reader.poll();
        assert_eq!(reader.snapshot().submitted, 0);
        assert_eq!(reader.results_mut(ClientId(1)).map(|q| q.len()), Some(0));
    }
}
