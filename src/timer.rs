//! The periodic interrupt injector's timer.
//!
//! A 1 ms CLOCK_MONOTONIC timer delivers SIGALRM to an empty handler. Its
//! only job is to make an in-flight `KVM_RUN` return EINTR so the run
//! loop's tick arm executes; the guest's own clock comes from the
//! in-kernel PIT.

use libc::c_int;

use crate::error::{Error, Result};
use crate::runner::install_signal_handler;

/// Tick period.
const TIMER_INTERVAL_NS: i64 = 1_000_000;

extern "C" fn alarm_handler(_: c_int) {}

/// An armed periodic timer; disarmed again on drop.
pub struct TickTimer {
    id: libc::timer_t,
}

impl TickTimer {
    /// Install the SIGALRM handler and arm the timer.
    pub fn start() -> Result<Self> {
        install_signal_handler(libc::SIGALRM, alarm_handler)?;

        // Safety: zeroed sigevent/itimerspec with only the documented
        // fields filled in; the timer id out-param is written on success.
        unsafe {
            let mut sev: libc::sigevent = std::mem::zeroed();
            sev.sigev_notify = libc::SIGEV_SIGNAL;
            sev.sigev_signo = libc::SIGALRM;

            let mut id: libc::timer_t = std::ptr::null_mut();
            if libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut id) < 0 {
                return Err(Error::Timer(std::io::Error::last_os_error()));
            }

            let mut its: libc::itimerspec = std::mem::zeroed();
            its.it_value.tv_sec = TIMER_INTERVAL_NS / 1_000_000_000;
            its.it_value.tv_nsec = TIMER_INTERVAL_NS % 1_000_000_000;
            its.it_interval.tv_sec = its.it_value.tv_sec;
            its.it_interval.tv_nsec = its.it_value.tv_nsec;
            if libc::timer_settime(id, 0, &its, std::ptr::null_mut()) < 0 {
                let err = std::io::Error::last_os_error();
                libc::timer_delete(id);
                return Err(Error::Timer(err));
            }

            Ok(Self { id })
        }
    }
}

impl Drop for TickTimer {
    fn drop(&mut self) {
        unsafe {
            libc::timer_delete(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timer_arms_and_disarms() {
        let timer = TickTimer::start().unwrap();
        // A couple of periods pass without the empty handler doing harm.
        std::thread::sleep(Duration::from_millis(5));
        drop(timer);
    }
}
