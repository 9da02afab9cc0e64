//! Process-wide URL de-duplication.

use dashmap::DashSet;

/// Set of every URL string the engine has ever considered. A successful
/// insert grants the caller exclusive responsibility to enqueue that URL;
/// there is no eviction, the set grows until termination.
#[derive(Debug, Default)]
pub struct FingerprintSet {
    seen: DashSet<String>,
}

impl FingerprintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic insert-if-absent. Returns true iff the caller is the first to
    /// register `url`.
    pub fn insert_if_absent(&self, url: &str) -> bool {
        self.seen.insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_wins() {
        let set = FingerprintSet::new();
        assert!(set.insert_if_absent("http://test.local/"));
        assert!(!set.insert_if_absent("http://test.local/"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_admit_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let set = Arc::new(FingerprintSet::new());
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        if set.insert_if_absent(&format!("http://test.local/{}", i)) {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::Relaxed), 100);
        assert_eq!(set.len(), 100);
    }
}
