use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use dashmap::DashMap;
use fxhash::FxBuildHasher;

use crate::stream::StreamHandle;

/// Process-wide stream identity allocator and id -> stream table.
///
/// Shared between the demultiplexer, which allocates and stores, and stream
/// owners that retire streams by id. Lock-free for readers.
#[derive(Debug, Default)]
pub struct StreamMap {
    last_id: AtomicI64,
    streams: DashMap<i64, Arc<StreamHandle>, FxBuildHasher>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next stream id. Ids start at 1 and are never reused.
    pub fn next_id(&self) -> i64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn store(&self, id: i64, stream: Arc<StreamHandle>) {
        self.streams.insert(id, stream);
    }

    pub fn load(&self, id: i64) -> Option<Arc<StreamHandle>> {
        self.streams.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn delete(&self, id: i64) -> Option<Arc<StreamHandle>> {
        self.streams.remove(&id).map(|(_, stream)| stream)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, thread};

    use super::*;
    use crate::address::{AddressPair, FlowKey};

    fn handle(id: i64) -> Arc<StreamHandle> {
        let address = AddressPair::new(Ipv4Addr::new(10, 0, 0, 1), 5000, Ipv4Addr::new(10, 0, 0, 2), 443);
        Arc::new(StreamHandle::new(id, FlowKey::new(&address, true)))
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let map = StreamMap::new();
        assert_eq!(map.next_id(), 1);
        assert_eq!(map.next_id(), 2);
        assert_eq!(map.next_id(), 3);
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let map = Arc::new(StreamMap::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || (0..250).map(|_| map.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<i64> = workers
            .into_iter()
            .flat_map(|w| w.join().expect("worker panicked"))
            .collect();
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(ids.len(), 1000);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&1000));
    }

    #[test]
    fn store_load_delete() {
        let map = StreamMap::new();
        let id = map.next_id();
        map.store(id, handle(id));

        assert_eq!(map.len(), 1);
        assert_eq!(map.load(id).map(|s| s.id()), Some(id));

        assert!(map.delete(id).is_some());
        assert!(map.load(id).is_none());
        assert!(map.is_empty());
        assert!(map.delete(id).is_none(), "second delete is a no-op");
    }
}
