//! Link configuration and its builder

use std::time::Duration;

use crate::error::{LinkError, Result};
use crate::queue::QueueOrder;

/// Timing and buffering parameters shared by drivers and backends
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LinkConfig {
    /// Bit rate in Hz
    pub frequency_hz: u32,
    /// Maximum number of words waiting in the transmit queue
    pub queue_capacity: usize,
    /// How long an idle background loop waits before rechecking
    pub poll_interval: Duration,
    /// Removal order of the transmit queue
    pub order: QueueOrder,
    /// Sampler cycles without a clock edge before a partial word is dropped
    pub idle_timeout_cycles: u32,
    /// Depth of the sequencing peripheral's FIFOs
    pub fifo_depth: usize,
    /// Receive sampler ticks per bit for the emulated peripheral
    pub oversample: u32,
    /// Name given to background threads
    pub thread_name: String,
}

impl LinkConfig {
    /// Highest accepted bit rate
    pub const MAX_FREQUENCY_HZ: u32 = 1_000_000;

    /// Preset for the 12.8 kHz timing
    pub fn low_speed() -> Self {
        Self::default()
    }

    /// Preset for the 100 kHz timing
    pub fn high_speed() -> Self {
        LinkConfig {
            frequency_hz: crate::arinc::HIGH_SPEED_HZ,
            ..Self::default()
        }
    }

    /// Half of one bit period: how long the clock stays high, then low
    pub fn half_period(&self) -> Duration {
        Duration::from_nanos(500_000_000 / u64::from(self.frequency_hz.max(1)))
    }

    /// Sequencer clock rate: one tick to present the bit, one to pulse the clock
    pub fn sequencer_hz(&self) -> u32 {
        self.frequency_hz
            .saturating_mul(crate::arinc::SEQUENCER_TICKS_PER_BIT)
    }

    /// Nominal time on the wire for one word
    pub fn word_duration(&self) -> Duration {
        Duration::from_nanos(
            crate::arinc::WORD_BITS as u64 * 1_000_000_000 / u64::from(self.frequency_hz.max(1)),
        )
    }

    /// Receive idle timeout as wall time
    ///
    /// `idle_timeout_cycles` sampler ticks at `oversample × F`, so a source
    /// polled at an arbitrary rate times out after the same interval as the
    /// fixed-rate sampler.
    pub fn receive_idle_timeout(&self) -> Duration {
        let sample_hz = u64::from(self.frequency_hz) * u64::from(self.oversample);
        Duration::from_nanos(
            u64::from(self.idle_timeout_cycles).saturating_mul(1_000_000_000) / sample_hz.max(1),
        )
    }

    /// Check every field for a usable value
    pub fn validate(&self) -> Result<()> {
        if self.frequency_hz == 0 || self.frequency_hz > Self::MAX_FREQUENCY_HZ {
            return Err(LinkError::config(format!(
                "Frequency {} Hz out of range [1, {}]",
                self.frequency_hz,
                Self::MAX_FREQUENCY_HZ
            )));
        }
        if self.queue_capacity == 0 {
            return Err(LinkError::config("Queue capacity must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(LinkError::config("Poll interval must be non-zero"));
        }
        if self.idle_timeout_cycles == 0 {
            return Err(LinkError::config("Idle timeout must be at least 1 cycle"));
        }
        if self.fifo_depth == 0 {
            return Err(LinkError::config("FIFO depth must be at least 1"));
        }
        if self.oversample < 2 {
            return Err(LinkError::config(
                "Oversample must be at least 2 ticks per bit to see both clock phases",
            ));
        }
        Ok(())
    }

    /// Load a configuration from JSON, filling missing fields with defaults
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(json)
            .map_err(|e| LinkError::config(format!("Invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            frequency_hz: crate::arinc::LOW_SPEED_HZ,
            queue_capacity: 64,
            poll_interval: Duration::from_millis(1),
            order: QueueOrder::Fifo,
            idle_timeout_cycles: 256,
            fifo_depth: 4,
            oversample: 4,
            thread_name: "arinc429".to_string(),
        }
    }
}

/// Builder for [`LinkConfig`]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        LinkConfigBuilder {
            config: LinkConfig::default(),
        }
    }

    /// Set the bit rate
    pub fn with_frequency(mut self, frequency_hz: u32) -> Self {
        self.config.frequency_hz = frequency_hz;
        self
    }

    /// Set the transmit queue bound
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the idle poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the queue removal order
    pub fn with_order(mut self, order: QueueOrder) -> Self {
        self.config.order = order;
        self
    }

    /// Set the receive idle timeout in sampler cycles
    pub fn with_idle_timeout(mut self, cycles: u32) -> Self {
        self.config.idle_timeout_cycles = cycles;
        self
    }

    /// Set the peripheral FIFO depth
    pub fn with_fifo_depth(mut self, depth: usize) -> Self {
        self.config.fifo_depth = depth;
        self
    }

    /// Set the receive oversampling factor
    pub fn with_oversample(mut self, ticks_per_bit: u32) -> Self {
        self.config.oversample = ticks_per_bit;
        self
    }

    /// Set the background thread name
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<LinkConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for LinkConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.frequency_hz, 12_800);
        assert_eq!(config.order, QueueOrder::Fifo);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_timing() {
        let config = LinkConfig::high_speed();
        assert_eq!(config.frequency_hz, 100_000);
        assert_eq!(config.half_period(), Duration::from_micros(5));
        assert_eq!(config.sequencer_hz(), 200_000);
        assert_eq!(config.word_duration(), Duration::from_micros(320));

        let config = LinkConfig::low_speed();
        assert_eq!(config.half_period(), Duration::from_nanos(39_062));
        assert_eq!(config.word_duration(), Duration::from_micros(2_500));
    }

    #[test]
    fn test_receive_idle_timeout() {
        // 256 ticks at 4 x 12.8 kHz: 64 bit periods
        let config = LinkConfig::default();
        assert_eq!(config.receive_idle_timeout(), Duration::from_micros(5_000));
        assert!(config.receive_idle_timeout() > config.half_period() * 2 * 32);

        let config = LinkConfig {
            frequency_hz: 1_000,
            oversample: 8,
            idle_timeout_cycles: 64,
            ..LinkConfig::default()
        };
        assert_eq!(config.receive_idle_timeout(), Duration::from_millis(8));
    }

    #[test]
    fn test_builder() -> Result<()> {
        let config = LinkConfigBuilder::new()
            .with_frequency(50_000)
            .with_queue_capacity(8)
            .with_order(QueueOrder::Lifo)
            .with_thread_name("tx-a")
            .build()?;
        assert_eq!(config.frequency_hz, 50_000);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.order, QueueOrder::Lifo);
        assert_eq!(config.thread_name, "tx-a");
        Ok(())
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(matches!(
            LinkConfigBuilder::new().with_frequency(0).build(),
            Err(LinkError::Config(_))
        ));
        assert!(LinkConfigBuilder::new().with_queue_capacity(0).build().is_err());
        assert!(LinkConfigBuilder::new()
            .with_poll_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(LinkConfigBuilder::new().with_oversample(1).build().is_err());
        assert!(LinkConfigBuilder::new().with_fifo_depth(0).build().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_from_json() -> Result<()> {
        let config = LinkConfig::from_json(r#"{ "frequency_hz": 100000, "queue_capacity": 16 }"#)?;
        assert_eq!(config.frequency_hz, 100_000);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.fifo_depth, 4);

        assert!(LinkConfig::from_json(r#"{ "frequency_hz": 0 }"#).is_err());
        assert!(LinkConfig::from_json("not json").is_err());
        Ok(())
    }
}
