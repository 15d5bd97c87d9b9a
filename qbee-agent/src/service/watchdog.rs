/// Counts consecutive control-plane connection failures. When a configured
/// threshold is reached the service arms a reboot, on the assumption that a
/// restart may recover a wedged network stack.
#[derive(Debug, Default)]
pub struct ConnectivityWatchdog {
    threshold: u32,
    failed: u32,
}

impl ConnectivityWatchdog {
    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    /// Threshold zero turns the watchdog off.
    pub fn disable(&mut self) {
        self.threshold = 0;
        self.failed = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Record one API call outcome. Returns true when the failure budget is
    /// exhausted and a reboot should be armed. Any successful call, and any
    /// failure that is not a connection error, resets the counter.
    pub fn note(&mut self, connection_error: bool) -> bool {
        if connection_error {
            self.failed = self.failed.saturating_add(1);
        } else {
            self.failed = 0;
        }
        self.threshold > 0 && self.failed >= self.threshold
    }
}
