//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineErrorKind};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Interval between periodic keyframe requests (seconds)
    pub keyframe_interval_secs: u64,
    /// Attempts a synchronization pass makes while holding the lock
    pub max_sync_attempts: usize,
    /// Delay before a deferred synchronization retry (seconds)
    pub sync_retry_delay_secs: u64,
    /// Forwarding errors that do not end a stream's forward loop
    pub benign_forward_errors: Vec<EngineErrorKind>,
    /// Media engine settings
    pub rtc: RtcConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            keyframe_interval_secs: 3,
            max_sync_attempts: 25,
            sync_retry_delay_secs: 3,
            benign_forward_errors: vec![EngineErrorKind::ClosedPipe],
            rtc: RtcConfig::default(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        Duration::from_secs(self.keyframe_interval_secs)
    }

    #[must_use]
    pub const fn sync_retry_delay(&self) -> Duration {
        Duration::from_secs(self.sync_retry_delay_secs)
    }

    /// Whether a forwarding error should be tolerated
    #[must_use]
    pub fn is_benign_forward_error(&self, err: &EngineError) -> bool {
        self.benign_forward_errors.contains(&err.kind())
    }

    /// Validate settings, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.keyframe_interval_secs == 0 {
            errors.push("sfu.keyframe_interval_secs must be greater than 0".to_string());
        }
        if self.max_sync_attempts == 0 {
            errors.push("sfu.max_sync_attempts must be greater than 0".to_string());
        }
        if (self.rtc.udp_port_min == 0) != (self.rtc.udp_port_max == 0) {
            errors.push(format!(
                "sfu.rtc.udp_port_min ({}) and sfu.rtc.udp_port_max ({}) must both be set or both be 0",
                self.rtc.udp_port_min, self.rtc.udp_port_max
            ));
        } else if self.rtc.udp_port_min > self.rtc.udp_port_max {
            errors.push(format!(
                "sfu.rtc.udp_port_min ({}) is above sfu.rtc.udp_port_max ({})",
                self.rtc.udp_port_min, self.rtc.udp_port_max
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// WebRTC engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// STUN/TURN server URLs offered to the ICE agent
    pub ice_servers: Vec<String>,
    /// Lower bound of the ephemeral UDP port range (0 = let the OS pick)
    pub udp_port_min: u16,
    /// Upper bound of the ephemeral UDP port range (0 = let the OS pick)
    pub udp_port_max: u16,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            udp_port_min: 50000,
            udp_port_max: 60000,
        }
    }
}
