use std::time::Duration;

/// Per-context options.
///
/// The numeric values accepted by [`Settings::set`] use the unit documented
/// on each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOption {
    /// Retransmit timer per segment, in milliseconds. 10 - 30000, default
    /// 500.
    UdpTimeout,
    /// Retransmissions before a session fails. 0 - 20, default 3.
    UdpRetries,
    /// Send and receive window capacity in segments. 1 - 64, default 16.
    SlideWindow,
    /// Idle session expiry, in seconds. 10 - 86400, default 900.
    SessionTimeout,
    /// Debug: artificial delay applied to outbound udp, in milliseconds.
    /// Default 0.
    DebugDelay,
    /// Debug: per-10000 probability of dropping an outbound packet.
    /// 0 - 10000, default 0.
    DebugPacketLoss,
    /// Debug: shaping cap on outbound udp in bits per second, 0 means
    /// unlimited. Default 0.
    DebugBandwidth,
}

/// A value was rejected because it falls outside the documented range of the
/// option.
#[derive(Debug, Clone, Copy)]
pub struct OptionError {
    pub option: ContextOption,
    pub value: u64,
}

impl std::error::Error for OptionError {}

impl std::fmt::Display for OptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "option {:?} rejects value {}", self.option, self.value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub udp_timeout: Duration,
    pub udp_retries: u32,
    pub slide_window: usize,
    pub session_timeout: Duration,
    pub debug_delay: Duration,
    pub debug_packet_loss: u32,
    pub debug_bandwidth: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            udp_timeout: Duration::from_millis(500),
            udp_retries: 3,
            slide_window: 16,
            session_timeout: Duration::from_secs(900),
            debug_delay: Duration::ZERO,
            debug_packet_loss: 0,
            debug_bandwidth: 0,
        }
    }
}

impl Settings {
    /// Apply one option value, rejecting values outside the documented
    /// range.
    ///
    /// # Test
    ///
    /// ```
    /// use service::{ContextOption, Settings};
    /// use std::time::Duration;
    ///
    /// let mut settings = Settings::default();
    ///
    /// settings.set(ContextOption::UdpTimeout, 200).unwrap();
    /// assert_eq!(settings.udp_timeout, Duration::from_millis(200));
    ///
    /// assert!(settings.set(ContextOption::UdpTimeout, 5).is_err());
    /// assert!(settings.set(ContextOption::SlideWindow, 0).is_err());
    /// assert!(settings.set(ContextOption::SlideWindow, 65).is_err());
    /// assert!(settings.set(ContextOption::DebugPacketLoss, 10001).is_err());
    /// ```
    pub fn set(&mut self, option: ContextOption, value: u64) -> Result<(), OptionError> {
        match option {
            ContextOption::UdpTimeout if (10..=30_000).contains(&value) => {
                self.udp_timeout = Duration::from_millis(value);
            }
            ContextOption::UdpRetries if value <= 20 => {
                self.udp_retries = value as u32;
            }
            ContextOption::SlideWindow if (1..=64).contains(&value) => {
                self.slide_window = value as usize;
            }
            ContextOption::SessionTimeout if (10..=86_400).contains(&value) => {
                self.session_timeout = Duration::from_secs(value);
            }
            ContextOption::DebugDelay => {
                self.debug_delay = Duration::from_millis(value);
            }
            ContextOption::DebugPacketLoss if value <= 10_000 => {
                self.debug_packet_loss = value as u32;
            }
            ContextOption::DebugBandwidth => {
                self.debug_bandwidth = value;
            }
            _ => return Err(OptionError { option, value }),
        }

        Ok(())
    }
}
