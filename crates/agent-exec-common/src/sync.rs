use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

static POISON_RECOVERY_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of poisoned locks recovered since process start.
pub fn poison_recovery_count() -> u64 {
    POISON_RECOVERY_COUNT.load(Ordering::Relaxed)
}

fn record_poison_recovery(kind: &'static str) {
    POISON_RECOVERY_COUNT.fetch_add(1, Ordering::Relaxed);
    error!(
        lock = kind,
        "Lock poisoned: a task panicked while holding it; recovering inner state"
    );
}

pub fn rwlock_read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        record_poison_recovery("rwlock-read");
        poisoned.into_inner()
    })
}

pub fn rwlock_write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        record_poison_recovery("rwlock-write");
        poisoned.into_inner()
    })
}

pub fn mutex_lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        record_poison_recovery("mutex");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutex_recovers_after_panic() {
        let lock = Arc::new(Mutex::new(7u32));
        let poisoner = Arc::clone(&lock);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        let before = poison_recovery_count();
        let guard = mutex_lock_or_recover(&lock);
        assert_eq!(*guard, 7);
        assert!(poison_recovery_count() > before);
    }

    #[test]
    fn test_rwlock_helpers_on_healthy_lock() {
        let lock = RwLock::new(vec![1, 2]);
        rwlock_write_or_recover(&lock).push(3);
        assert_eq!(rwlock_read_or_recover(&lock).len(), 3);
    }
}
