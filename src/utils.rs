use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Base-page size of the running host, per the C runtime. The engine's
/// translation geometry assumes this matches [`crate::tlb::BASE_PAGE_SIZE`].
#[must_use]
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf(_SC_PAGESIZE) reads a constant, no preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        crate::tlb::BASE_PAGE_SIZE
    } else {
        sz as u64
    }
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// One-shot completion rendezvous between an interrupt-context signaller and a
/// single blocking waiter. `wait` consumes the signal so the flag can be
/// reused for the next round trip.
#[derive(Debug, Default)]
pub struct Completion {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Marks the completion as signalled and wakes the waiter.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn signal(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.cond.notify_all();
    }

    /// Blocks until the completion fires, then clears it. Uninterruptible:
    /// a device that never acknowledges keeps the caller parked.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.cond.wait(flag).unwrap();
        }
        *flag = false;
    }

    /// Bounded variant used by shutdown paths and tests.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            let (guard, res) = self.cond.wait_timeout(flag, timeout).unwrap();
            flag = guard;
            if res.timed_out() && !*flag {
                return false;
            }
        }
        *flag = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn host_page_size_is_sane() {
        assert!(host_page_size().is_power_of_two());
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x20_1000, 0x20_0000));
    }

    #[test]
    fn completion_round_trip() {
        let c = Arc::new(Completion::new());
        let c2 = c.clone();
        let t = std::thread::spawn(move || c2.wait());
        c.signal();
        t.join().unwrap();

        // consumed: a second wait must time out
        assert!(!c.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn completion_signal_before_wait() {
        let c = Completion::new();
        c.signal();
        assert!(c.wait_timeout(Duration::from_millis(10)));
    }
}
