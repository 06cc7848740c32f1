use core::hint;

use crate::sdmmc::SdmmcError;

/// Time services the driver needs from whatever it runs on.
///
/// Every blocking wait in the driver is expressed in terms of this trait, so a
/// bare-metal target can back it with a cycle counter and a busy loop while an
/// RTOS target yields to its scheduler inside `usleep`.
pub trait Sleep {
    fn usleep(&self, time_us: u32);

    /// Monotonic microsecond counter, used to measure timeouts
    fn now_us(&self) -> u64;

    /// Length of one scheduler tick. Event waits and the busy-line poll sleep
    /// in multiples of it.
    fn tick_us(&self) -> u32 {
        1000
    }
}

/// How `poll_until` spends time between two unsuccessful polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Spin, and yield for one tick each time the elapsed time exceeds
    /// `yield_after_us`. The threshold doubles after every yield.
    Doubling { yield_after_us: u64 },
    /// Sleep one tick between polls
    Tick,
}

impl Backoff {
    /// Backoff used for register handshakes: start yielding after 100 ms
    pub const REGISTER: Backoff = Backoff::Doubling {
        yield_after_us: 100_000,
    };
}

/// Poll `poll` until it yields a value or `timeout_us` elapses.
///
/// `None` as timeout waits forever. A zero timeout checks exactly once.
pub fn poll_until<S, T, F>(
    sleep: &S,
    timeout_us: Option<u64>,
    backoff: Backoff,
    mut poll: F,
) -> Result<T, SdmmcError>
where
    S: Sleep + ?Sized,
    F: FnMut() -> Option<T>,
{
    let start = sleep.now_us();
    let mut yield_after = match backoff {
        Backoff::Doubling { yield_after_us } => yield_after_us,
        Backoff::Tick => 0,
    };

    loop {
        if let Some(value) = poll() {
            return Ok(value);
        }

        let elapsed = sleep.now_us().saturating_sub(start);
        if timeout_us.is_some_and(|timeout| elapsed >= timeout) {
            return Err(SdmmcError::ETIMEDOUT);
        }

        match backoff {
            Backoff::Doubling { .. } => {
                if elapsed > yield_after {
                    yield_after = yield_after.saturating_mul(2);
                    sleep.usleep(sleep.tick_us());
                } else {
                    hint::spin_loop();
                }
            }
            Backoff::Tick => sleep.usleep(sleep.tick_us()),
        }
    }
}

// `sel4-microkit` specific implementation
#[cfg(feature = "sel4-microkit")]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        $crate::sel4_microkit::debug_println!($($arg)*);
    };
}

#[cfg(feature = "sel4-microkit")]
#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        $crate::sel4_microkit::debug_println!("[sdmmc error] {}", format_args!($($arg)*));
    };
}

/// Bare metal and hosted targets go through the `log` facade
#[cfg(not(feature = "sel4-microkit"))]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        $crate::log::debug!($($arg)*);
    };
}

#[cfg(not(feature = "sel4-microkit"))]
#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        $crate::log::error!($($arg)*);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    /// Virtual clock: sleeping advances time, spinning advances it by 1us
    struct FakeClock {
        now: Cell<u64>,
        sleeps: Cell<u32>,
    }

    impl FakeClock {
        fn new() -> Self {
            FakeClock {
                now: Cell::new(0),
                sleeps: Cell::new(0),
            }
        }
    }

    impl Sleep for FakeClock {
        fn usleep(&self, time_us: u32) {
            self.sleeps.set(self.sleeps.get() + 1);
            self.now.set(self.now.get() + time_us as u64);
        }

        fn now_us(&self) -> u64 {
            let now = self.now.get();
            self.now.set(now + 1);
            now
        }
    }

    #[test]
    fn zero_timeout_checks_once() {
        let clock = FakeClock::new();
        let mut polls = 0;
        let res: Result<(), _> = poll_until(&clock, Some(0), Backoff::Tick, || {
            polls += 1;
            None
        });
        assert_eq!(res, Err(SdmmcError::ETIMEDOUT));
        assert_eq!(polls, 1);
        assert_eq!(clock.sleeps.get(), 0);
    }

    #[test]
    fn returns_value_once_ready() {
        let clock = FakeClock::new();
        let mut polls = 0;
        let res = poll_until(&clock, Some(10_000), Backoff::Tick, || {
            polls += 1;
            (polls == 3).then_some(42u32)
        });
        assert_eq!(res, Ok(42));
        assert_eq!(clock.sleeps.get(), 2);
    }

    #[test]
    fn tick_backoff_times_out() {
        let clock = FakeClock::new();
        let res: Result<(), _> = poll_until(&clock, Some(5_000), Backoff::Tick, || None);
        assert_eq!(res, Err(SdmmcError::ETIMEDOUT));
        // One tick per failed poll, and the deadline is 5 ticks away
        assert!(clock.sleeps.get() >= 4 && clock.sleeps.get() <= 6);
    }

    #[test]
    fn doubling_backoff_spins_before_yielding() {
        let clock = FakeClock::new();
        let res: Result<(), _> = poll_until(
            &clock,
            Some(1_000_000),
            Backoff::Doubling { yield_after_us: 100_000 },
            || None,
        );
        assert_eq!(res, Err(SdmmcError::ETIMEDOUT));
        // Yields happen at 100ms, 200ms, 400ms and 800ms worth of elapsed time,
        // everything else is spinning.
        let sleeps = clock.sleeps.get();
        assert!(sleeps >= 3 && sleeps <= 5, "unexpected yield count {}", sleeps);
    }
}
