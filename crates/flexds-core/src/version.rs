//! Process-global snapshot version counter.
//!
//! Snapshot versions are a monotonically increasing integer rendered as a
//! decimal string. Delivery is per-process, so an atomic counter is all the
//! coordination required.

use std::sync::atomic::{AtomicU64, Ordering};

static VERSION: AtomicU64 = AtomicU64::new(0);

/// Allocate the next snapshot version.
///
/// Every call returns a strictly greater integer than any previous call in
/// this process.
pub fn next_version() -> String {
    (VERSION.fetch_add(1, Ordering::SeqCst) + 1).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_strictly_increase() {
        let a: u64 = next_version().parse().unwrap();
        let b: u64 = next_version().parse().unwrap();
        let c: u64 = next_version().parse().unwrap();
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn versions_unique_across_threads() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};
        use std::thread;

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = vec![];
        for _ in 0..8 {
            let seen = Arc::clone(&seen);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let v: u64 = next_version().parse().unwrap();
                    seen.lock().unwrap().insert(v);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 800);
    }
}
