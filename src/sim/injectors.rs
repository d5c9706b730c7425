//! Test-control tokens the simulator's tick loop consumes.
//!
//! Grounded on `nvsim/reg_handlers/nvme.py`'s `check_injectors` (`ignore_changes`,
//! `fail_next_command_sc`, `set_cfs`, each registered once and consumed on
//! the next tick). A plain `Mutex<Vec<_>>` instead of a channel, since the
//! tick thread drains the whole queue once per iteration rather than
//! blocking on it.

use crate::command::status::StatusCode;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub enum Injector {
    /// Suspend register-change handling for `timeout_s` seconds.
    IgnoreNVMeRegChanges { timeout_s: f64 },
    /// Force the next command processed (on any queue) to fail with `sc`.
    FailCommand { sc: StatusCode },
    /// Set `CSTS.CFS` on the next tick.
    SetCFS,
}

#[derive(Default)]
pub struct InjectorQueue {
    pending: Mutex<Vec<Injector>>,
}

impl InjectorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, injector: Injector) {
        self.pending.lock().unwrap().push(injector);
    }

    pub fn drain(&self) -> Vec<Injector> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::status::{self, Scope};

    #[test]
    fn drain_empties_the_queue() {
        let q = InjectorQueue::new();
        q.push(Injector::SetCFS);
        q.push(Injector::FailCommand {
            sc: status::lookup(0x02, Scope::Generic).unwrap(),
        });
        assert_eq!(q.drain().len(), 2);
        assert!(q.drain().is_empty());
    }
}
