//! Engine configuration.

/// Rate-control (Timely) parameters.
///
/// RTT thresholds are in microseconds, rates in bytes per second.
#[derive(Debug, Clone, Copy)]
pub struct TimelyConfig {
    /// RTT below which the rate increases additively.
    pub t_low_us: u64,
    /// RTT above which the rate decreases multiplicatively.
    pub t_high_us: u64,
    /// EWMA factor for the RTT gradient.
    pub ewma_alpha: f64,
    /// Multiplicative decrease factor.
    pub beta: f64,
    /// Additive increase step.
    pub add_step_bps: f64,
    /// Lower rate clamp.
    pub min_rate_bps: f64,
    /// Upper rate clamp (also the initial rate).
    pub max_rate_bps: f64,
}

impl Default for TimelyConfig {
    fn default() -> Self {
        Self {
            t_low_us: 50,
            t_high_us: 1000,
            ewma_alpha: 0.875,
            beta: 0.8,
            add_step_bps: 5.0 * (1 << 20) as f64,
            min_rate_bps: (1 << 20) as f64,
            max_rate_bps: 10.0 * (1 << 30) as f64,
        }
    }
}

/// Per-instance configuration, passed at [`Rpc`](crate::Rpc) construction.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Request window size: concurrent outstanding requests per session.
    pub req_window: usize,
    /// Initial session credits. Defaults to the window size.
    pub session_credits: usize,
    /// Retransmission timeout floor in microseconds.
    pub rto_floor_us: u64,
    /// Retransmissions of one request before the session is reset.
    pub max_retransmits: u32,
    /// Session table capacity.
    pub max_sessions: usize,
    /// Enable rate-based pacing of data packets.
    pub pacing: bool,
    /// Timely parameters.
    pub timely: TimelyConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            session_credits: 8,
            rto_floor_us: 5_000,
            max_retransmits: 7,
            max_sessions: 256,
            pacing: true,
            timely: TimelyConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request window size. Credits follow unless set separately.
    pub fn with_req_window(mut self, req_window: usize) -> Self {
        assert!(req_window > 0, "request window must be non-empty");
        self.req_window = req_window;
        self.session_credits = self.session_credits.max(req_window);
        self
    }

    /// Set the initial session credits.
    pub fn with_session_credits(mut self, credits: usize) -> Self {
        self.session_credits = credits;
        self
    }

    /// Set the retransmission timeout floor.
    pub fn with_rto_floor_us(mut self, rto_floor_us: u64) -> Self {
        self.rto_floor_us = rto_floor_us;
        self
    }

    /// Set the retransmission cap.
    pub fn with_max_retransmits(mut self, max_retransmits: u32) -> Self {
        self.max_retransmits = max_retransmits;
        self
    }

    /// Set the session table capacity.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Enable or disable pacing.
    pub fn with_pacing(mut self, pacing: bool) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set the Timely parameters.
    pub fn with_timely(mut self, timely: TimelyConfig) -> Self {
        self.timely = timely;
        self
    }
}
