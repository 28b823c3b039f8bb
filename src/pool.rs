//! Token pool bounding concurrent hash computations, plus the cooperative
//! shutdown flag shared by long-running operations.
//!
//! The pool is an explicit semaphore whose permit count can be adjusted at
//! runtime: the tuner grows it by injecting a token (one waiting worker wakes
//! up) and shrinks it by draining a free token non-blockingly. A worker holds
//! a [`Token`] for the full duration of one hash computation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

struct PoolState {
    // free tokens; invariant: free <= size
    free: usize,
    size: usize,
}

/// Adjustable counting semaphore.
pub struct TokenPool {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl TokenPool {
    /// Create a pool with `size` tokens (at least one).
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            state: Mutex::new(PoolState { free: size, size }),
            available: Condvar::new(),
        })
    }

    /// Block until a token is available and take it.
    pub fn acquire(self: &Arc<Self>) -> Token {
        let mut state = self.state.lock().unwrap();
        while state.free == 0 {
            state = self.available.wait(state).unwrap();
        }
        state.free -= 1;
        Token { pool: Arc::clone(self) }
    }

    /// Current pool size (total tokens, held or free).
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().size
    }

    /// Inject one extra token; a waiting worker wakes up immediately.
    pub fn grow(&self) {
        let mut state = self.state.lock().unwrap();
        state.size += 1;
        state.free += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Drain one free token, shrinking the pool. Returns false without
    /// blocking when every token is currently held.
    pub fn try_shrink(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.free == 0 || state.size <= 1 {
            return false;
        }
        state.free -= 1;
        state.size -= 1;
        true
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.free += 1;
        drop(state);
        self.available.notify_one();
    }
}

/// A held token; returned to the pool on drop.
pub struct Token {
    pool: Arc<TokenPool>,
}

impl Drop for Token {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// Cooperative cancellation signal.
///
/// On cancel, in-flight work runs to completion but no new tasks start; the
/// observing operation returns normally with a partial-progress indication.
#[derive(Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag").field("cancelled", &self.is_cancelled()).finish()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_release() {
        let pool = TokenPool::new(2);
        let a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(pool.size(), 2);
        drop(a);
        let _c = pool.acquire();
    }

    #[test]
    fn test_bounded_concurrency() {
        let pool = TokenPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                let _token = pool.acquire();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_grow_wakes_waiter() {
        let pool = TokenPool::new(1);
        let _held = pool.acquire();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let _token = pool.acquire();
            })
        };

        thread::sleep(Duration::from_millis(10));
        pool.grow();
        waiter.join().unwrap();
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_shrink_skipped_when_all_held() {
        let pool = TokenPool::new(1);
        let _held = pool.acquire();
        assert!(!pool.try_shrink());
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_shrink_never_below_one() {
        let pool = TokenPool::new(1);
        assert!(!pool.try_shrink());
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_shrink_drains_free_token() {
        let pool = TokenPool::new(3);
        assert!(pool.try_shrink());
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
