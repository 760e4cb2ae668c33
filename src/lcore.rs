//! Lcore status management and the per-lcore component lists.
//!
//! Each slave lcore runs one run-to-completion loop over the components in
//! its `CoreInfo`, which sits behind a ref/upd double buffer so the master
//! can re-wire it mid-run. Statuses are single-word atomics driving the
//! lifecycle FSM:
//!
//! ```text
//! Unuse -> Stop -> Idle -> Forward
//!            ^      ^        |
//!            |      +--- IdleRequest
//!            +---------- StopRequest
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use num_traits::FromPrimitive;

use crate::dblbuf::DoubleBuffered;
use crate::errors::{Error, Result};
use crate::MAX_LCORE;

/// Seconds of one-per-second polls before a status wait gives up.
pub const CORE_STATUS_CHECK_MAX: u32 = 5;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum LcoreStatus {
    Unuse = 0,
    Stop,
    Idle,
    Forward,
    StopRequest,
    IdleRequest,
}

/// Component ids bound to one lcore.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreInfo {
    pub ids: Vec<usize>,
}

/// Per-lcore management block: the status word and the double-buffered
/// component list its loop iterates.
pub struct CoreMng {
    status: AtomicU32,
    pub core: DoubleBuffered<CoreInfo>,
}

impl Default for CoreMng {
    fn default() -> Self {
        CoreMng {
            status: AtomicU32::new(LcoreStatus::Unuse as u32),
            core: DoubleBuffered::default(),
        }
    }
}

impl CoreMng {
    pub fn status(&self) -> LcoreStatus {
        LcoreStatus::from_u32(self.status.load(Ordering::Acquire)).unwrap_or(LcoreStatus::Unuse)
    }

    pub fn set_status(&self, status: LcoreStatus) {
        self.status.store(status as u32, Ordering::Release);
    }
}

/// Status and plan management of every lcore in the process.
pub struct LcoreMng {
    cores: Vec<CoreMng>,
    main_lcore: u32,
    slave_ids: Vec<u32>,
}

impl LcoreMng {
    /// Build the table for a pool of `nof_slaves` worker lcores. The main
    /// lcore is 0, slaves are 1..=nof_slaves, all initially `Stop`.
    pub fn new(nof_slaves: u32) -> Self {
        let cores: Vec<CoreMng> = (0..MAX_LCORE).map(|_| CoreMng::default()).collect();
        let slave_ids: Vec<u32> = (1..=nof_slaves).collect();

        cores[0].set_status(LcoreStatus::Stop);
        for id in &slave_ids {
            cores[*id as usize].set_status(LcoreStatus::Stop);
        }

        LcoreMng {
            cores,
            main_lcore: 0,
            slave_ids,
        }
    }

    pub fn main_lcore(&self) -> u32 {
        self.main_lcore
    }

    pub fn slave_ids(&self) -> &[u32] {
        &self.slave_ids
    }

    pub fn is_slave(&self, lcore_id: u32) -> bool {
        self.slave_ids.contains(&lcore_id)
    }

    pub fn core(&self, lcore_id: u32) -> &CoreMng {
        &self.cores[lcore_id as usize]
    }

    pub fn get_status(&self, lcore_id: u32) -> LcoreStatus {
        self.cores[lcore_id as usize].status()
    }

    pub fn set_status(&self, lcore_id: u32, status: LcoreStatus) {
        self.cores[lcore_id as usize].set_status(status);
    }

    /// Set every slave lcore to the given status.
    pub fn set_all_status(&self, status: LcoreStatus) {
        for id in &self.slave_ids {
            self.cores[*id as usize].set_status(status);
        }
    }

    fn check_status(&self, status: LcoreStatus) -> bool {
        self.slave_ids
            .iter()
            .all(|id| self.cores[*id as usize].status() == status)
    }

    /// Poll all slave lcores once per second for up to
    /// `CORE_STATUS_CHECK_MAX` seconds until they reach `status`.
    pub fn check_core_status_wait(&self, status: LcoreStatus) -> Result<()> {
        for _ in 0..CORE_STATUS_CHECK_MAX {
            thread::sleep(Duration::from_secs(1));
            if self.check_status(status) {
                return Ok(());
            }
        }

        error!("Status check time out. (status = {:?})", status);
        Err(Error::StatusWaitTimeout("core status"))
    }

    /// As `check_core_status_wait` but with a caller-chosen poll interval,
    /// used by tests to avoid multi-second sleeps.
    pub fn check_core_status_wait_with(
        &self,
        status: LcoreStatus,
        interval: Duration,
        tries: u32,
    ) -> Result<()> {
        for _ in 0..tries {
            thread::sleep(interval);
            if self.check_status(status) {
                return Ok(());
            }
        }
        Err(Error::StatusWaitTimeout("core status"))
    }
}

/// Process-wide stop flag; the signal handler only stores into it.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_process(sig: libc::c_int) {
    if sig == libc::SIGTERM || sig == libc::SIGINT {
        STOP_REQUESTED.store(true, Ordering::Release);
    }
}

/// Register SIGTERM/SIGINT to request a graceful stop.
pub fn register_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, stop_process as libc::sighandler_t);
        libc::signal(libc::SIGINT, stop_process as libc::sighandler_t);
    }
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::Acquire)
}

#[cfg(test)]
pub fn reset_stop_flag() {
    STOP_REQUESTED.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_fsm_words() {
        let mng = LcoreMng::new(2);
        assert_eq!(mng.main_lcore(), 0);
        assert_eq!(mng.slave_ids(), &[1, 2]);
        assert!(mng.is_slave(2));
        assert!(!mng.is_slave(0));
        assert!(!mng.is_slave(3));

        assert_eq!(mng.get_status(1), LcoreStatus::Stop);
        assert_eq!(mng.get_status(3), LcoreStatus::Unuse);

        mng.set_all_status(LcoreStatus::Idle);
        assert_eq!(mng.get_status(1), LcoreStatus::Idle);
        assert_eq!(mng.get_status(2), LcoreStatus::Idle);
        // main lcore stays untouched by the broadcast
        assert_eq!(mng.get_status(0), LcoreStatus::Stop);
    }

    #[test]
    fn test_status_wait_times_out() {
        let mng = LcoreMng::new(1);
        let err = mng.check_core_status_wait_with(
            LcoreStatus::Forward,
            Duration::from_millis(1),
            3,
        );
        assert!(err.is_err());

        mng.set_all_status(LcoreStatus::Forward);
        mng.check_core_status_wait_with(LcoreStatus::Forward, Duration::from_millis(1), 3)
            .unwrap();
    }
}
