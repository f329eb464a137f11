use crate::config::TimelyConfig;

/// Timely rate-control state for one session.
///
/// RTT samples come from acknowledged packets (credit returns and response
/// arrivals). Low RTTs grow the rate additively, high RTTs shrink it in
/// proportion to the overshoot, and in between the smoothed RTT gradient
/// steers the rate.
pub(crate) struct TimelyState {
    /// Current sending rate in bytes per second.
    rate_bps: f64,
    /// Previous RTT sample in microseconds.
    prev_rtt_us: f64,
    /// Smoothed RTT gradient.
    grad: f64,
    /// Smallest RTT observed; the gradient normalization baseline.
    min_rtt_us: f64,
}

impl TimelyState {
    pub fn new(cfg: &TimelyConfig) -> Self {
        Self {
            rate_bps: cfg.max_rate_bps,
            prev_rtt_us: 0.0,
            grad: 0.0,
            min_rtt_us: f64::MAX,
        }
    }

    /// Current sending rate in bytes per second.
    #[inline(always)]
    pub fn rate_bps(&self) -> f64 {
        self.rate_bps
    }

    /// Feed one RTT sample and update the rate.
    pub fn update(&mut self, rtt_us: u64, cfg: &TimelyConfig) {
        let rtt = rtt_us as f64;
        if rtt < self.min_rtt_us {
            self.min_rtt_us = rtt;
        }

        let prev = self.prev_rtt_us;
        self.prev_rtt_us = rtt;
        if prev == 0.0 {
            // First sample only seeds the gradient.
            return;
        }

        self.grad = cfg.ewma_alpha * self.grad + (1.0 - cfg.ewma_alpha) * (rtt - prev);

        let new_rate = if rtt_us < cfg.t_low_us {
            self.rate_bps + cfg.add_step_bps
        } else if rtt_us > cfg.t_high_us {
            let overshoot = (rtt - cfg.t_high_us as f64) / rtt;
            self.rate_bps * (1.0 - cfg.beta * overshoot)
        } else {
            let normalized = self.grad / self.min_rtt_us.max(1.0);
            if normalized <= 0.0 {
                self.rate_bps + cfg.add_step_bps
            } else {
                self.rate_bps * (1.0 - cfg.beta * normalized.min(1.0))
            }
        };

        self.rate_bps = new_rate.clamp(cfg.min_rate_bps, cfg.max_rate_bps);
    }
}

/// Per-session byte budget derived from the Timely rate.
///
/// The event loop refills the budget from elapsed wall time and releases
/// data packets only while it stays positive; a small overdraft is allowed
/// and repaid by the next refill.
pub(crate) struct PaceState {
    budget_bytes: f64,
    last_tick_us: u64,
}

/// Budget cap: one full burst worth of standard packets.
const BUDGET_CAP_BYTES: f64 = (32 * 1500) as f64;

impl PaceState {
    pub fn new() -> Self {
        Self {
            budget_bytes: BUDGET_CAP_BYTES,
            last_tick_us: 0,
        }
    }

    /// Accrue budget for the time since the last refill.
    pub fn refill(&mut self, now_us: u64, rate_bps: f64) {
        let elapsed = now_us.saturating_sub(self.last_tick_us);
        self.last_tick_us = now_us;
        self.budget_bytes =
            (self.budget_bytes + rate_bps * elapsed as f64 / 1e6).min(BUDGET_CAP_BYTES);
    }

    /// Whether another packet may be released.
    #[inline(always)]
    pub fn open(&self) -> bool {
        self.budget_bytes > 0.0
    }

    /// Charge one released packet against the budget.
    #[inline(always)]
    pub fn spend(&mut self, bytes: usize) {
        self.budget_bytes -= bytes as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_increase_below_t_low() {
        let cfg = TimelyConfig {
            max_rate_bps: 1e9,
            ..Default::default()
        };
        let mut cc = TimelyState::new(&cfg);
        // Drag the rate down first so there is room to grow.
        for _ in 0..50 {
            cc.update(5_000, &cfg);
        }
        let depressed = cc.rate_bps();
        assert!(depressed < 1e9);

        for _ in 0..4 {
            cc.update(10, &cfg);
        }
        assert!(cc.rate_bps() > depressed);
    }

    #[test]
    fn multiplicative_decrease_above_t_high() {
        let cfg = TimelyConfig::default();
        let mut cc = TimelyState::new(&cfg);
        let initial = cc.rate_bps();

        cc.update(2_000, &cfg); // seeds prev_rtt
        cc.update(2_000, &cfg);
        assert!(cc.rate_bps() < initial);
    }

    #[test]
    fn rate_stays_clamped() {
        let cfg = TimelyConfig::default();
        let mut cc = TimelyState::new(&cfg);
        for _ in 0..1000 {
            cc.update(50_000, &cfg);
        }
        assert!(cc.rate_bps() >= cfg.min_rate_bps);

        for _ in 0..1000 {
            cc.update(1, &cfg);
        }
        assert!(cc.rate_bps() <= cfg.max_rate_bps);
    }

    #[test]
    fn budget_gates_release() {
        let mut pace = PaceState::new();
        pace.refill(0, 0.0);
        while pace.open() {
            pace.spend(1500);
        }
        assert!(!pace.open());

        // 1ms at 8MB/s buys back a few packets.
        pace.refill(1_000, 8e6);
        assert!(pace.open());
    }
}
