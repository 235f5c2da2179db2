use common::{pack_column, DimensionId};
use hashbrown::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::error;
use vek::*;

/// Columns saved since the last broadcast, keyed by dimension.
///
/// The host calls [`ChangeTracker::mark_dirty`] from its save hook, which may
/// run on any thread. The request processor drains it periodically.
#[derive(Default)]
pub struct ChangeTracker {
    dirty: Mutex<HashMap<DimensionId, HashSet<i64>>>,
}

impl ChangeTracker {
    pub fn new() -> Self { Self::default() }

    pub fn mark_dirty(&self, dimension: &DimensionId, key: Vec2<i32>) {
        match self.dirty.lock() {
            Ok(mut dirty) => {
                dirty
                    .entry(dimension.clone())
                    .or_default()
                    .insert(pack_column(key));
            },
            Err(e) => error!(?e, "Change tracker lock poisoned"),
        }
    }

    pub fn drain(&self) -> HashMap<DimensionId, HashSet<i64>> {
        match self.dirty.lock() {
            Ok(mut dirty) => std::mem::take(&mut *dirty),
            Err(e) => {
                error!(?e, "Change tracker lock poisoned");
                HashMap::new()
            },
        }
    }

    pub fn is_empty(&self) -> bool { self.dirty.lock().map_or(true, |dirty| dirty.is_empty()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn collects_per_dimension_and_drains() {
        let tracker = ChangeTracker::new();
        let overworld = DimensionId::new("overworld");
        let nether = DimensionId::new("nether");
        tracker.mark_dirty(&overworld, Vec2::new(1, 2));
        tracker.mark_dirty(&overworld, Vec2::new(1, 2));
        tracker.mark_dirty(&nether, Vec2::new(-3, 4));

        let drained = tracker.drain();
        assert_eq!(drained[&overworld].len(), 1);
        assert!(drained[&nether].contains(&pack_column(Vec2::new(-3, 4))));
        assert!(tracker.is_empty());
    }

    #[test]
    fn marks_from_other_threads() {
        let tracker = Arc::new(ChangeTracker::new());
        let dim = DimensionId::new("overworld");
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                let dim = dim.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        tracker.mark_dirty(&dim, Vec2::new(t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.drain()[&dim].len(), 400);
    }
}
