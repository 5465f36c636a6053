//! Process-wide init/cleanup, refcounted.
//!
//! Process-global state that must be set up once and torn down once,
//! however many chirp instances exist in the same process, would live
//! here (TLS library init, signal handling, that sort of thing).
//! `rustls` needs no such global init, so this currently degrades to
//! pure refcount bookkeeping — kept as a real public pair rather than
//! deleted, since a future TLS backend swap (or an embedder linking
//! against this crate from FFI) may reintroduce a real global to
//! initialize here.

use parking_lot::Mutex;

use crate::error::*;

struct Counter {
    count: u64,
}

static COUNTER: Mutex<Counter> = Mutex::new(Counter { count: 0 });

/// Guard returned by `init`. Dropping it calls `cleanup` for you; most
/// callers should just hold onto it for the process's lifetime.
#[must_use = "dropping this immediately undoes chirp::init()"]
pub struct InitGuard {
    _private: (),
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        let _ = cleanup();
    }
}

/// Initializes process-wide chirp state. Safe to call more than once
/// (from multiple independent `Chirp` instances in the same process);
/// only the first call does anything, and every call increments the
/// refcount.
pub fn init() -> Result<InitGuard> {
    let mut c = COUNTER.lock();
    c.count += 1;
    Ok(InitGuard { _private: () })
}

/// Decrements the refcount, freeing process-wide state once it reaches
/// zero. Called automatically by dropping the `InitGuard` from `init`;
/// exposed directly for embedders that manage the guard's lifetime
/// outside of Rust's `Drop` (e.g. across an FFI boundary).
pub fn cleanup() -> Result<()> {
    let mut c = COUNTER.lock();
    if c.count == 0 {
        return Err("chirp::cleanup() called without a matching chirp::init()")
            .simple_msg(ErrorKind::Fatal, "unbalanced cleanup");
    }
    c.count -= 1;
    Ok(())
}

/// Returns the current process-wide init refcount. Exposed for tests.
pub fn refcount() -> u64 {
    COUNTER.lock().count
}

/// Overrides the global allocator used for chirp's internal
/// allocations. Rust has no supported mechanism to swap the global
/// allocator at runtime (unlike `malloc`/`realloc`/`free` function
/// pointers in C), so this always fails with `ErrorKind::ValueError`;
/// kept as a real function rather than deleted, since a silent
/// `Ok(())` no-op would misrepresent what actually happened to a
/// caller checking the result.
pub fn set_alloc() -> Result<()> {
    Err(Error::wrapped(
        ErrorKind::ValueError,
        "chirp::set_alloc is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_cleanup_refcounts_balance() {
        let before = refcount();
        let g1 = init().unwrap();
        let g2 = init().unwrap();
        assert_eq!(refcount(), before + 2);
        drop(g1);
        assert_eq!(refcount(), before + 1);
        drop(g2);
        assert_eq!(refcount(), before);
    }

    #[test]
    fn unbalanced_cleanup_is_an_error() {
        let before = refcount();
        if before == 0 {
            assert!(cleanup().is_err());
        }
    }

    #[test]
    fn set_alloc_is_unsupported() {
        assert_eq!(set_alloc().unwrap_err().kind(), ErrorKind::ValueError);
    }
}
