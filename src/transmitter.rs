//! Transmitter backends
//!
//! Two interchangeable backends share the [`Transmit`] contract:
//!
//! - [`SoftwareTransmitter`] bit-bangs the word with explicit per-bit delays.
//!   Its timing is subject to host scheduler jitter.
//! - [`SequencedTransmitter`] hands the word to a sequencing peripheral that
//!   runs [`TX_PROGRAM`](crate::microprogram::TX_PROGRAM) on its own clock.

use std::convert::Infallible;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::pwm::SetDutyCycle;

use crate::config::LinkConfig;
use crate::encoding::WordCodec;
use crate::error::{pin_err, Result};

/// A backend that puts wire-order words on the bus
pub trait Transmit {
    /// Send one wire-order word
    ///
    /// Returns once the word has left the host: on the wire for software
    /// backends, accepted by the peripheral FIFO for sequenced ones.
    fn transmit(&mut self, wire: u32) -> Result<()>;

    /// Wait until every accepted word has fully left the line
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Idle wait the background loop should use, given the configured one
    fn idle_poll(&self, configured: Duration) -> Duration {
        configured
    }

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Placeholder for an absent direction-enable line
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPin;

impl digital::ErrorType for NoPin {
    type Error = Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

/// Lines owned by one driver for its whole lifetime
#[derive(Debug)]
pub struct LinkPins<D, C, E = NoPin> {
    /// Data line
    pub data: D,
    /// Clock line (a discrete pin or a PWM channel)
    pub clock: C,
    /// Optional bus-direction-enable line
    pub direction: Option<E>,
}

impl<D, C, E> LinkPins<D, C, E>
where
    D: OutputPin,
    E: OutputPin,
{
    /// Take ownership of the lines, park data low and enable the bus driver
    pub fn new(mut data: D, clock: C, mut direction: Option<E>) -> Result<Self> {
        data.set_low().map_err(pin_err)?;
        if let Some(pin) = direction.as_mut() {
            pin.set_high().map_err(pin_err)?;
        }
        Ok(LinkPins {
            data,
            clock,
            direction,
        })
    }
}

/// Clock generation strategy for the software backend
pub trait BitClock {
    /// Underlying line type
    type Line;

    /// Prepare the clock before the first bit
    fn begin_word(&mut self) -> Result<()>;

    /// Clock out one bit whose data level is already on the line
    fn clock_bit<Dl: DelayNs>(&mut self, delay: &mut Dl, half_period_ns: u32) -> Result<()>;

    /// Quiesce the clock after the last bit
    fn end_word(&mut self) -> Result<()>;

    /// Give back the line
    fn into_line(self) -> Self::Line;
}

/// Clock driven by toggling a pin once per bit
#[derive(Debug)]
pub struct DiscreteClock<P>(P);

impl<P: OutputPin> BitClock for DiscreteClock<P> {
    type Line = P;

    fn begin_word(&mut self) -> Result<()> {
        self.0.set_low().map_err(pin_err)
    }

    fn clock_bit<Dl: DelayNs>(&mut self, delay: &mut Dl, half_period_ns: u32) -> Result<()> {
        self.0.set_high().map_err(pin_err)?;
        delay.delay_ns(half_period_ns);
        self.0.set_low().map_err(pin_err)?;
        delay.delay_ns(half_period_ns);
        Ok(())
    }

    fn end_word(&mut self) -> Result<()> {
        self.0.set_low().map_err(pin_err)
    }

    fn into_line(self) -> P {
        self.0
    }
}

/// Free-running pulse generator gated on for the duration of a word
#[derive(Debug)]
pub struct GatedClock<P>(P);

impl<P: SetDutyCycle> BitClock for GatedClock<P> {
    type Line = P;

    fn begin_word(&mut self) -> Result<()> {
        self.0.set_duty_cycle_percent(50).map_err(pin_err)
    }

    fn clock_bit<Dl: DelayNs>(&mut self, delay: &mut Dl, half_period_ns: u32) -> Result<()> {
        delay.delay_ns(half_period_ns.saturating_mul(2));
        Ok(())
    }

    fn end_word(&mut self) -> Result<()> {
        self.0.set_duty_cycle_fully_off().map_err(pin_err)
    }

    fn into_line(self) -> P {
        self.0
    }
}

/// Sleeps the calling thread; resolution is whatever the host scheduler gives
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDelay;

impl DelayNs for HostDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}

/// Cooperative bit-banging backend
///
/// For each of the four bytes, most significant bit first: drive the data
/// line, then clock the bit out; afterwards the data line is dropped.
#[derive(Debug)]
pub struct SoftwareTransmitter<D, C, Dl, E = NoPin> {
    data: D,
    clock: C,
    direction: Option<E>,
    delay: Dl,
    half_period_ns: u32,
}

impl<D, P, Dl, E> SoftwareTransmitter<D, DiscreteClock<P>, Dl, E>
where
    D: OutputPin,
    P: OutputPin,
    Dl: DelayNs,
{
    /// Backend toggling a discrete clock pin per bit
    pub fn discrete(pins: LinkPins<D, P, E>, delay: Dl, config: &LinkConfig) -> Self {
        Self::with_clock(pins.data, DiscreteClock(pins.clock), pins.direction, delay, config)
    }
}

impl<D, P, Dl, E> SoftwareTransmitter<D, GatedClock<P>, Dl, E>
where
    D: OutputPin,
    P: SetDutyCycle,
    Dl: DelayNs,
{
    /// Backend gating a PWM clock while data bits are shifted
    pub fn gated(pins: LinkPins<D, P, E>, delay: Dl, config: &LinkConfig) -> Self {
        Self::with_clock(pins.data, GatedClock(pins.clock), pins.direction, delay, config)
    }
}

impl<D, C, Dl, E> SoftwareTransmitter<D, C, Dl, E>
where
    D: OutputPin,
    C: BitClock,
    Dl: DelayNs,
{
    fn with_clock(data: D, clock: C, direction: Option<E>, delay: Dl, config: &LinkConfig) -> Self {
        let half_period_ns = u32::try_from(config.half_period().as_nanos()).unwrap_or(u32::MAX);
        SoftwareTransmitter {
            data,
            clock,
            direction,
            delay,
            half_period_ns,
        }
    }

    /// Half of one bit period in nanoseconds
    pub fn half_period_ns(&self) -> u32 {
        self.half_period_ns
    }

    /// Release the lines and the delay provider
    pub fn into_parts(self) -> (LinkPins<D, C::Line, E>, Dl) {
        let pins = LinkPins {
            data: self.data,
            clock: self.clock.into_line(),
            direction: self.direction,
        };
        (pins, self.delay)
    }

    fn shift_word(&mut self, wire: u32) -> Result<()> {
        self.clock.begin_word()?;
        for bit in WordCodec::bits(wire) {
            if bit {
                self.data.set_high().map_err(pin_err)?;
            } else {
                self.data.set_low().map_err(pin_err)?;
            }
            self.clock.clock_bit(&mut self.delay, self.half_period_ns)?;
        }
        self.data.set_low().map_err(pin_err)?;
        self.clock.end_word()
    }
}

impl<D, C, Dl, E> Transmit for SoftwareTransmitter<D, C, Dl, E>
where
    D: OutputPin,
    C: BitClock,
    Dl: DelayNs,
{
    fn transmit(&mut self, wire: u32) -> Result<()> {
        let result = self.shift_word(wire);
        if result.is_err() {
            // Best effort: leave the bus quiet after a failed word
            let _ = self.data.set_low();
            let _ = self.clock.end_word();
        }
        result
    }

    fn name(&self) -> &'static str {
        "software"
    }
}

/// Write side of a sequencing peripheral running the transmit microprogram
pub trait TxPeripheral {
    /// Push one wire-order word into the write FIFO, waiting while it is full
    fn write(&mut self, wire: u32) -> Result<()>;

    /// Wait until the FIFO is empty and the last word has left the line
    fn flush(&mut self, timeout: Duration) -> Result<()>;

    /// Whether nothing is queued or being shifted
    fn is_idle(&self) -> bool;
}

/// Backend offloading all per-bit timing to a sequencing peripheral
#[derive(Debug)]
pub struct SequencedTransmitter<P> {
    peripheral: P,
    flush_timeout: Duration,
}

impl<P: TxPeripheral> SequencedTransmitter<P> {
    /// Wrap an armed peripheral
    pub fn new(peripheral: P, config: &LinkConfig) -> Self {
        // Whole FIFO plus the word being shifted, with generous slack
        let words = u32::try_from(config.fifo_depth)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let flush_timeout = config
            .word_duration()
            .saturating_mul(words)
            .saturating_mul(4)
            .saturating_add(Duration::from_millis(100));
        SequencedTransmitter {
            peripheral,
            flush_timeout,
        }
    }

    /// Longest wait for the FIFO to drain on flush
    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    /// Borrow the peripheral
    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    /// Give back the peripheral
    pub fn into_inner(self) -> P {
        self.peripheral
    }
}

impl<P: TxPeripheral> Transmit for SequencedTransmitter<P> {
    fn transmit(&mut self, wire: u32) -> Result<()> {
        self.peripheral.write(wire)
    }

    fn flush(&mut self) -> Result<()> {
        self.peripheral.flush(self.flush_timeout)
    }

    fn idle_poll(&self, configured: Duration) -> Duration {
        configured.max(crate::arinc::SEQUENCED_MIN_POLL)
    }

    fn name(&self) -> &'static str {
        "sequenced"
    }
}
