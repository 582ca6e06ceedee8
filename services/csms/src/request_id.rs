use ocpp_protocol::RequestId;
use std::sync::atomic::{AtomicU64, Ordering};

/// First value handed out is `REQUEST_ID_SEED + 1`; ids observed from other
/// parties are usually far below it.
pub const REQUEST_ID_SEED: u64 = 900_000;

/// Source of message ids for CSMS-initiated calls.
#[derive(Debug)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(REQUEST_ID_SEED)
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            counter: AtomicU64::new(seed),
        }
    }

    pub fn next_value(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId::from(self.next_value())
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn first_id_is_above_seed() {
        let ids = RequestIdGenerator::new();
        assert_eq!(ids.next_request_id().as_str(), "900001");
        assert_eq!(ids.next_request_id().as_str(), "900002");
    }

    #[test]
    fn concurrent_ids_are_unique_and_increasing_per_thread() {
        let ids = Arc::new(RequestIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..500).map(|_| ids.next_value()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let values = handle.join().unwrap();
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            assert!(values.iter().all(|v| *v > REQUEST_ID_SEED));
            all.extend(values);
        }
        assert_eq!(all.len(), 8 * 500);
        assert_eq!(all.iter().max(), Some(&(REQUEST_ID_SEED + 8 * 500)));
    }
}
