//! Receive sources
//!
//! A receive source is polled by the background drain loop in
//! [`RxDriver`](crate::driver::RxDriver). Both sources run the same
//! [`RX_PROGRAM`](crate::microprogram::RX_PROGRAM): bits are sampled on the
//! rising edge of the side-band clock, gathered in a four-byte buffer and
//! emitted once all 32 have arrived. A clock that stops mid-word yields a
//! timeout instead of a partial word.

use std::time::{Duration, Instant};

use embedded_hal::digital::InputPin;

use crate::config::LinkConfig;
use crate::error::{pin_err, Result};
use crate::microprogram::{Levels, RxMachine, RxTick};

/// Completed receive event, still in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    /// A full 32-bit wire-order word
    Word(u32),
    /// The clock stopped after `bits` bits; the buffer was discarded
    Timeout {
        /// Bits collected before the line went idle
        bits: u8,
    },
}

/// Outcome of polling a receive source once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPoll {
    /// Nothing buffered and nothing in progress
    Idle,
    /// A word is partially assembled; poll again promptly
    Busy,
    /// An event is ready
    Event(RxEvent),
}

/// Something the receive drain loop can poll
pub trait ReceiveSource {
    /// Poll once without blocking
    fn poll(&mut self) -> Result<RxPoll>;

    /// Idle wait the background loop should use, given the configured one
    ///
    /// Zero means yield instead of sleeping.
    fn idle_poll(&self, configured: Duration) -> Duration {
        configured
    }

    /// Short source name for logs
    fn name(&self) -> &'static str;
}

/// Read side of a sequencing peripheral running the receive microprogram
pub trait RxPeripheral {
    /// Number of events waiting in the receive FIFO
    fn in_waiting(&self) -> usize;

    /// Take the oldest event from the receive FIFO
    fn read(&mut self) -> Option<RxEvent>;

    /// Whether a word is currently being shifted in
    fn is_receiving(&self) -> bool;
}

/// Bit-sampling receiver driven by the host loop
///
/// Samples the clock, then the data line, on every poll. The loop must poll
/// faster than the clock toggles; any slower and edges are lost, which shows
/// up as receive timeouts.
///
/// Polls arrive at whatever rate the host manages, so the idle timeout is
/// measured in wall time since the last rising clock edge:
/// [`LinkConfig::receive_idle_timeout`].
#[derive(Debug)]
pub struct SoftwareReceiver<D, C> {
    data: D,
    clock: C,
    machine: RxMachine,
    idle_timeout: Duration,
    last_clock: bool,
    last_edge: Instant,
}

impl<D: InputPin, C: InputPin> SoftwareReceiver<D, C> {
    /// Take ownership of the input lines
    pub fn new(data: D, clock: C, config: &LinkConfig) -> Self {
        SoftwareReceiver {
            data,
            clock,
            // Timeout is applied here, in wall time
            machine: RxMachine::new(u32::MAX),
            idle_timeout: config.receive_idle_timeout(),
            last_clock: false,
            last_edge: Instant::now(),
        }
    }

    /// Wall time without a clock edge after which a partial word is dropped
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether a word is partially assembled
    pub fn in_word(&self) -> bool {
        self.machine.in_word()
    }

    /// Release the input lines
    pub fn into_pins(self) -> (D, C) {
        (self.data, self.clock)
    }
}

impl<D: InputPin, C: InputPin> ReceiveSource for SoftwareReceiver<D, C> {
    fn poll(&mut self) -> Result<RxPoll> {
        // Clock first: data is held for the whole high phase
        let clock = self.clock.is_high().map_err(pin_err)?;
        let data = self.data.is_high().map_err(pin_err)?;

        let now = Instant::now();
        if clock && !self.last_clock {
            self.last_edge = now;
        }
        self.last_clock = clock;

        Ok(match self.machine.tick(Levels { data, clock }) {
            RxTick::Idle => RxPoll::Idle,
            RxTick::Busy => {
                if now.duration_since(self.last_edge) < self.idle_timeout {
                    RxPoll::Busy
                } else {
                    match self.machine.abandon() {
                        Some(bits) => RxPoll::Event(RxEvent::Timeout { bits }),
                        None => RxPoll::Idle,
                    }
                }
            }
            RxTick::Word(wire) => RxPoll::Event(RxEvent::Word(wire)),
            RxTick::Timeout { bits } => RxPoll::Event(RxEvent::Timeout { bits }),
        })
    }

    fn idle_poll(&self, _configured: Duration) -> Duration {
        // Sleeping would miss the first clock edge of the next word
        Duration::ZERO
    }

    fn name(&self) -> &'static str {
        "software"
    }
}

/// Receiver draining a sequencing peripheral's receive FIFO
#[derive(Debug)]
pub struct SequencedReceiver<P> {
    peripheral: P,
}

impl<P: RxPeripheral> SequencedReceiver<P> {
    /// Wrap an armed peripheral
    pub fn new(peripheral: P) -> Self {
        SequencedReceiver { peripheral }
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

impl<P: RxPeripheral> ReceiveSource for SequencedReceiver<P> {
    fn poll(&mut self) -> Result<RxPoll> {
        if let Some(event) = self.peripheral.read() {
            return Ok(RxPoll::Event(event));
        }
        Ok(if self.peripheral.is_receiving() {
            RxPoll::Busy
        } else {
            RxPoll::Idle
        })
    }

    fn name(&self) -> &'static str {
        "sequenced"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::WordCodec;
    use crate::microprogram::TxMachine;
    use crate::sim::SimBus;
    use std::collections::VecDeque;

    struct FakePeripheral {
        fifo: VecDeque<RxEvent>,
        receiving: bool,
    }

    impl RxPeripheral for FakePeripheral {
        fn in_waiting(&self) -> usize {
            self.fifo.len()
        }

        fn read(&mut self) -> Option<RxEvent> {
            self.fifo.pop_front()
        }

        fn is_receiving(&self) -> bool {
            self.receiving
        }
    }

    fn slow_config(idle_timeout_cycles: u32) -> LinkConfig {
        // 1 kHz with 4 ticks per bit: each cycle is 250 us of wall time
        LinkConfig {
            frequency_hz: 1_000,
            oversample: 4,
            idle_timeout_cycles,
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_software_receiver_samples_pins() -> Result<()> {
        let bus = SimBus::new();
        let mut rx = SoftwareReceiver::new(bus.claim(10)?, bus.claim(11)?, &slow_config(400));

        let wire = WordCodec::to_wire(0xAAAA_AAAAu32.into());
        let mut events = Vec::new();
        assert_eq!(rx.poll()?, RxPoll::Idle);

        for levels in TxMachine::waveform(wire) {
            bus.drive(10, levels.data);
            bus.drive(11, levels.clock);
            if let RxPoll::Event(event) = rx.poll()? {
                events.push(event);
            }
        }

        assert_eq!(events, vec![RxEvent::Word(wire)]);
        assert!(!rx.in_word());
        assert_eq!(rx.poll()?, RxPoll::Idle);
        Ok(())
    }

    #[test]
    fn test_software_timeout_counts_time_not_polls() -> Result<()> {
        let bus = SimBus::new();
        let config = slow_config(400);
        let mut rx = SoftwareReceiver::new(bus.claim(10)?, bus.claim(11)?, &config);
        assert_eq!(rx.idle_timeout(), Duration::from_millis(100));

        bus.drive(11, true);
        assert_eq!(rx.poll()?, RxPoll::Busy);
        bus.drive(11, false);

        // Far more polls than idle_timeout_cycles, all well inside the timeout
        for _ in 0..10 * config.idle_timeout_cycles {
            assert_eq!(rx.poll()?, RxPoll::Busy);
        }
        assert!(rx.in_word());
        Ok(())
    }

    #[test]
    fn test_software_receiver_times_out() -> Result<()> {
        let bus = SimBus::new();
        let mut rx = SoftwareReceiver::new(bus.claim(10)?, bus.claim(11)?, &slow_config(400));

        // Three clock pulses, then nothing
        for _ in 0..3 {
            bus.drive(11, true);
            assert_eq!(rx.poll()?, RxPoll::Busy);
            bus.drive(11, false);
            rx.poll()?;
        }
        assert!(rx.in_word());

        std::thread::sleep(rx.idle_timeout() + Duration::from_millis(5));
        assert_eq!(rx.poll()?, RxPoll::Event(RxEvent::Timeout { bits: 3 }));
        assert_eq!(rx.poll()?, RxPoll::Idle);
        assert!(!rx.in_word());
        assert_eq!(rx.idle_poll(Duration::from_millis(1)), Duration::ZERO);
        Ok(())
    }

    #[test]
    fn test_sequenced_receiver_drains_fifo_in_order() -> Result<()> {
        let peripheral = FakePeripheral {
            fifo: VecDeque::from(vec![RxEvent::Word(1), RxEvent::Word(2)]),
            receiving: false,
        };
        let mut rx = SequencedReceiver::new(peripheral);
        assert_eq!(rx.peripheral().in_waiting(), 2);
        assert_eq!(rx.poll()?, RxPoll::Event(RxEvent::Word(1)));
        assert_eq!(rx.poll()?, RxPoll::Event(RxEvent::Word(2)));
        assert_eq!(rx.poll()?, RxPoll::Idle);

        let mut peripheral = rx.into_inner();
        peripheral.receiving = true;
        let mut rx = SequencedReceiver::new(peripheral);
        assert_eq!(rx.poll()?, RxPoll::Busy);
        Ok(())
    }
}
