use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub leases_granted: u64,
    pub leases_released: u64,
    pub leases_leaked: u64,
    pub poisoned: u64,
    pub respawns: u64,
    pub respawn_failures: u64,
    pub probe_failures: u64,
    pub acquire_timeouts: u64,
}

impl PoolMetrics {
    pub fn record_grant(&mut self) {
        self.leases_granted = self.leases_granted.saturating_add(1);
    }

    pub fn record_release(&mut self, poisoned: bool) {
        self.leases_released = self.leases_released.saturating_add(1);
        if poisoned {
            self.poisoned = self.poisoned.saturating_add(1);
        }
    }

    pub fn record_leak(&mut self) {
        self.leases_leaked = self.leases_leaked.saturating_add(1);
    }

    pub fn record_respawn(&mut self, success: bool) {
        if success {
            self.respawns = self.respawns.saturating_add(1);
        } else {
            self.respawn_failures = self.respawn_failures.saturating_add(1);
        }
    }

    pub fn record_probe_failure(&mut self) {
        self.probe_failures = self.probe_failures.saturating_add(1);
        self.poisoned = self.poisoned.saturating_add(1);
    }

    pub fn record_acquire_timeout(&mut self) {
        self.acquire_timeouts = self.acquire_timeouts.saturating_add(1);
    }

    pub fn outstanding(&self) -> u64 {
        self.leases_granted
            .saturating_sub(self.leases_released)
            .saturating_sub(self.leases_leaked)
    }
}
