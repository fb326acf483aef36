//! # ARINC 429 Link Layer
//!
//! Bit-level transmit and receive of 32-bit ARINC 429 words over a data line
//! and a synchronous side-band clock line.
//!
//! Words are bit-reversed on the way out (the label byte travels in the
//! opposite bit order to the rest of the word) and shifted most significant
//! bit first, one clock pulse per bit. This library provides:
//!
//! - A software-timed backend that bit-bangs any `embedded-hal` output pins
//! - A sequenced backend that offloads per-bit timing to a sequencing
//!   peripheral, plus a timer-thread emulation of one for hosted builds
//! - Matching receivers built on the same microprogram
//! - Background drivers with a bounded, ordered transmit queue
//! - A simulated pin bank for tests and host runs
//!
//! Message content (label, SDI, SSM, parity) is not interpreted.
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support and JSON config loading
//!
//! ## Example
//!
//! ```
//! use arinc429_link::sim::SimBus;
//! use arinc429_link::transmitter::{LinkPins, SoftwareTransmitter};
//! use arinc429_link::{LinkConfig, TxDriver};
//! use std::time::Duration;
//!
//! let bus = SimBus::new();
//! let config = LinkConfig::high_speed();
//! let pins = LinkPins::new(bus.claim(0)?, bus.claim(1)?, Some(bus.claim(2)?))?;
//! let backend = SoftwareTransmitter::discrete(pins, bus.delay(), &config);
//!
//! let driver = TxDriver::spawn(backend, config)?;
//! driver.send(0x0000_00A5u32)?;
//! assert!(driver.wait_idle(Duration::from_secs(1)));
//! let (_backend, discarded) = driver.shutdown()?;
//! assert_eq!(discarded, 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod core;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod microprogram;
pub mod peripheral;
pub mod queue;
pub mod receiver;
pub mod sim;
pub mod transmitter;

pub use config::{LinkConfig, LinkConfigBuilder};
pub use crate::core::{ArincWord, IntoArincWord};
pub use driver::{RxDriver, TxDriver};
pub use encoding::WordCodec;
pub use error::{LinkError, Result};
pub use queue::QueueOrder;
pub use receiver::{ReceiveSource, SequencedReceiver, SoftwareReceiver};
pub use transmitter::{SequencedTransmitter, SoftwareTransmitter, Transmit};

/// ARINC 429 link constants
pub mod arinc {
    use std::time::Duration;

    /// Word length in bits
    pub const WORD_BITS: usize = 32;

    /// Word length in bytes
    pub const WORD_BYTES: usize = 4;

    /// Low-speed bit rate in Hz
    pub const LOW_SPEED_HZ: u32 = 12_800;

    /// High-speed bit rate in Hz
    pub const HIGH_SPEED_HZ: u32 = 100_000;

    /// Sequencer ticks per bit: one presents the data, one pulses the clock
    pub const SEQUENCER_TICKS_PER_BIT: u32 = 2;

    /// Shortest idle poll used with a sequenced backend
    pub const SEQUENCED_MIN_POLL: Duration = Duration::from_millis(5);
}
