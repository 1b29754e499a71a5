use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, recovering the guard if a previous holder panicked.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned sync lock"
            );
            lock.clear_poison();
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_after_holder_panics() {
        let lock = std::sync::Arc::new(Mutex::new(1_u32));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        *mutex_lock(&lock, "cache::lock::tests", "recover") += 1;
        assert_eq!(*mutex_lock(&lock, "cache::lock::tests", "read"), 2);
        assert!(!lock.is_poisoned());
    }
}
