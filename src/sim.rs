//! Simulated lines for host runs and tests
//!
//! [`SimBus`] stands in for a GPIO bank. Pins are claimed by number and
//! released on drop, so a second claim fails the same way a busy peripheral
//! would. Every level change is recorded with a virtual timestamp that only
//! [`SimDelay`] advances, which keeps traces independent of host scheduling.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::pwm::{self, SetDutyCycle};
use parking_lot::Mutex;

use crate::error::{LinkError, Result};
use crate::microprogram::Levels;

/// Pin number on the simulated bank
pub type PinId = u8;

/// One recorded level change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Virtual time of the change in nanoseconds
    pub at_ns: u64,
    /// Pin that changed
    pub pin: PinId,
    /// New level
    pub high: bool,
}

#[derive(Debug, Default)]
struct BusState {
    levels: HashMap<PinId, bool>,
    claimed: HashSet<PinId>,
    links: HashMap<PinId, Vec<PinId>>,
    trace: Vec<Edge>,
    now_ns: u64,
}

impl BusState {
    fn set(&mut self, pin: PinId, high: bool) {
        let previous = self.levels.insert(pin, high).unwrap_or(false);
        if previous != high {
            self.trace.push(Edge {
                at_ns: self.now_ns,
                pin,
                high,
            });
        }
    }
}

/// Shared simulated pin bank
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    /// Create an empty bank with every line low
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pin for exclusive use
    pub fn claim(&self, pin: PinId) -> Result<SimPin> {
        self.reserve(pin)?;
        Ok(SimPin {
            bus: self.clone(),
            id: pin,
        })
    }

    /// Claim a pin as a PWM output
    pub fn claim_pwm(&self, pin: PinId) -> Result<SimPwm> {
        self.reserve(pin)?;
        Ok(SimPwm {
            bus: self.clone(),
            id: pin,
            duty: 0,
        })
    }

    fn reserve(&self, pin: PinId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.claimed.insert(pin) {
            return Err(LinkError::resource(format!("Pin {} already claimed", pin)));
        }
        Ok(())
    }

    fn release(&self, pin: PinId) {
        self.state.lock().claimed.remove(&pin);
    }

    /// Whether a pin is currently claimed
    pub fn is_claimed(&self, pin: PinId) -> bool {
        self.state.lock().claimed.contains(&pin)
    }

    /// Wire `from` to `to` so that driving one also drives the other
    pub fn link(&self, from: PinId, to: PinId) {
        self.state.lock().links.entry(from).or_default().push(to);
    }

    /// Drive a line, following links
    pub fn drive(&self, pin: PinId, high: bool) {
        let mut state = self.state.lock();
        state.set(pin, high);
        let targets = state.links.get(&pin).cloned().unwrap_or_default();
        for target in targets {
            state.set(target, high);
        }
    }

    /// Current level of a line
    pub fn level(&self, pin: PinId) -> bool {
        self.state.lock().levels.get(&pin).copied().unwrap_or(false)
    }

    /// Current virtual time in nanoseconds
    pub fn now_ns(&self) -> u64 {
        self.state.lock().now_ns
    }

    /// Advance virtual time
    pub fn advance(&self, ns: u64) {
        self.state.lock().now_ns += ns;
    }

    /// A delay provider that advances this bank's virtual time
    pub fn delay(&self) -> SimDelay {
        SimDelay { bus: self.clone() }
    }

    /// All recorded level changes
    pub fn trace(&self) -> Vec<Edge> {
        self.state.lock().trace.clone()
    }

    /// Recorded changes of one pin
    pub fn edges(&self, pin: PinId) -> Vec<Edge> {
        self.state
            .lock()
            .trace
            .iter()
            .filter(|e| e.pin == pin)
            .copied()
            .collect()
    }

    /// Forget the recorded trace
    pub fn clear_trace(&self) {
        self.state.lock().trace.clear();
    }

    /// Replay the trace as a data/clock sample after every change of either
    pub fn samples(&self, data: PinId, clock: PinId) -> Vec<Levels> {
        let mut levels = Levels::default();
        self.state
            .lock()
            .trace
            .iter()
            .filter_map(|edge| {
                if edge.pin == data {
                    levels.data = edge.high;
                } else if edge.pin == clock {
                    levels.clock = edge.high;
                } else {
                    return None;
                }
                Some(levels)
            })
            .collect()
    }
}

/// A claimed line on a [`SimBus`]
#[derive(Debug)]
pub struct SimPin {
    bus: SimBus,
    id: PinId,
}

impl SimPin {
    /// Pin number
    pub fn id(&self) -> PinId {
        self.id
    }
}

impl Drop for SimPin {
    fn drop(&mut self) {
        self.bus.release(self.id);
    }
}

impl digital::ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> std::result::Result<(), Self::Error> {
        self.bus.drive(self.id, false);
        Ok(())
    }

    fn set_high(&mut self) -> std::result::Result<(), Self::Error> {
        self.bus.drive(self.id, true);
        Ok(())
    }
}

impl InputPin for SimPin {
    fn is_high(&mut self) -> std::result::Result<bool, Self::Error> {
        Ok(self.bus.level(self.id))
    }

    fn is_low(&mut self) -> std::result::Result<bool, Self::Error> {
        Ok(!self.bus.level(self.id))
    }
}

/// A claimed PWM output; the line reads high while the duty cycle is non-zero
#[derive(Debug)]
pub struct SimPwm {
    bus: SimBus,
    id: PinId,
    duty: u16,
}

impl SimPwm {
    /// Last duty cycle set
    pub fn duty(&self) -> u16 {
        self.duty
    }
}

impl Drop for SimPwm {
    fn drop(&mut self) {
        self.bus.release(self.id);
    }
}

impl pwm::ErrorType for SimPwm {
    type Error = Infallible;
}

impl SetDutyCycle for SimPwm {
    fn max_duty_cycle(&self) -> u16 {
        u16::MAX
    }

    fn set_duty_cycle(&mut self, duty: u16) -> std::result::Result<(), Self::Error> {
        self.duty = duty;
        self.bus.drive(self.id, duty > 0);
        Ok(())
    }
}

/// Delay provider that moves virtual time forward instead of sleeping
#[derive(Debug, Clone)]
pub struct SimDelay {
    bus: SimBus,
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.bus.advance(u64::from(ns));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() -> Result<()> {
        let bus = SimBus::new();
        let pin = bus.claim(3)?;
        assert!(matches!(bus.claim(3), Err(LinkError::Resource(_))));
        assert!(bus.claim_pwm(3).is_err());
        drop(pin);
        assert!(!bus.is_claimed(3));
        assert!(bus.claim(3).is_ok());
        Ok(())
    }

    #[test]
    fn test_trace_records_changes_only() -> Result<()> {
        let bus = SimBus::new();
        let mut pin = bus.claim(0)?;
        pin.set_low().unwrap();
        pin.set_high().unwrap();
        pin.set_high().unwrap();
        bus.delay().delay_ns(500);
        pin.set_low().unwrap();

        assert_eq!(
            bus.trace(),
            vec![
                Edge { at_ns: 0, pin: 0, high: true },
                Edge { at_ns: 500, pin: 0, high: false },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_link_drives_both_ends() -> Result<()> {
        let bus = SimBus::new();
        bus.link(0, 10);
        let mut out = bus.claim(0)?;
        let mut input = bus.claim(10)?;
        out.set_high().unwrap();
        assert!(input.is_high().unwrap());
        out.set_low().unwrap();
        assert!(input.is_low().unwrap());
        Ok(())
    }

    #[test]
    fn test_samples_replay() -> Result<()> {
        let bus = SimBus::new();
        let mut data = bus.claim(0)?;
        let mut clock = bus.claim(1)?;
        data.set_high().unwrap();
        clock.set_high().unwrap();
        clock.set_low().unwrap();
        assert_eq!(
            bus.samples(0, 1),
            vec![
                Levels::new(true, false),
                Levels::new(true, true),
                Levels::new(true, false),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_pwm_level_follows_duty() -> Result<()> {
        let bus = SimBus::new();
        let mut pwm = bus.claim_pwm(5)?;
        pwm.set_duty_cycle_percent(50).unwrap();
        assert!(bus.level(5));
        assert_eq!(pwm.duty(), u16::MAX / 2);
        pwm.set_duty_cycle_fully_off().unwrap();
        assert!(!bus.level(5));
        Ok(())
    }
}
