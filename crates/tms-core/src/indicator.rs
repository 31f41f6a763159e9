pub const CONNECTED_AUTO_HIDE_MS: i64 = 3_000;
pub const FAILED_AFTER_CONSECUTIVE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Hidden,
    Connected { hide_at: i64 },
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorTone {
    Ok,
    Warn,
    Critical,
}

/// Transient feedback about poll health. Holds no business data.
#[derive(Debug, Clone)]
pub struct ConnectionIndicator {
    state: ConnectionState,
    consecutive_failures: u32,
    ever_connected: bool,
}

impl Default for ConnectionIndicator {
    fn default() -> Self {
        Self {
            state: ConnectionState::Hidden,
            consecutive_failures: 0,
            ever_connected: false,
        }
    }
}

impl ConnectionIndicator {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Shows `Connected` on first contact and on recovery from failures.
    /// Returns true when the visible state changed.
    pub fn on_success(&mut self, now_ms: i64) -> bool {
        let recovering = self.consecutive_failures > 0;
        let first_contact = !self.ever_connected;
        self.consecutive_failures = 0;
        self.ever_connected = true;
        if !recovering && !first_contact {
            return false;
        }
        self.state = ConnectionState::Connected {
            hide_at: now_ms + CONNECTED_AUTO_HIDE_MS,
        };
        true
    }

    pub fn on_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let next = if self.consecutive_failures >= FAILED_AFTER_CONSECUTIVE {
            ConnectionState::Failed
        } else {
            ConnectionState::Reconnecting
        };
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Drives the auto-hide timer.
    pub fn tick(&mut self, now_ms: i64) -> bool {
        if let ConnectionState::Connected { hide_at } = self.state {
            if now_ms >= hide_at {
                self.state = ConnectionState::Hidden;
                return true;
            }
        }
        false
    }

    pub fn is_visible(&self) -> bool {
        self.state != ConnectionState::Hidden
    }

    pub fn label(&self) -> Option<&'static str> {
        match self.state {
            ConnectionState::Hidden => None,
            ConnectionState::Connected { .. } => Some("Connected"),
            ConnectionState::Reconnecting => Some("Reconnecting..."),
            ConnectionState::Failed => Some("Connection failed"),
        }
    }

    pub fn tone(&self) -> Option<IndicatorTone> {
        match self.state {
            ConnectionState::Hidden => None,
            ConnectionState::Connected { .. } => Some(IndicatorTone::Ok),
            ConnectionState::Reconnecting => Some(IndicatorTone::Warn),
            ConnectionState::Failed => Some(IndicatorTone::Critical),
        }
    }
}
