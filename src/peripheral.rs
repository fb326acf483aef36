//! Timer-thread emulation of a sequencing peripheral
//!
//! When the target has no sequencing coprocessor, the microprograms run on a
//! dedicated thread that acts as a high-priority timer interrupt: every tick
//! has an absolute deadline and the thread spins until it. Deadlines advance
//! by a fixed tick. A tick missed by more than a whole period re-anchors the
//! schedule instead of being caught up, so the lines never see a pulse
//! shorter than one tick. The thread parks only while the transmit program
//! is stalled on an empty FIFO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use embedded_hal::digital::{InputPin, OutputPin};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{pin_err, LinkError, Result};
use crate::microprogram::{Levels, RxMachine, RxTick, TxMachine, TxTick};
use crate::receiver::{RxEvent, RxPeripheral};
use crate::transmitter::TxPeripheral;

/// Longest a stalled or blocked party waits before rechecking shutdown
const STALL_POLL: Duration = Duration::from_millis(2);

fn tick_period(hz: u64) -> Duration {
    Duration::from_nanos(1_000_000_000 / hz.max(1))
}

/// Advance `deadline` by one tick and spin until it; returns `true` when late
fn next_tick(deadline: &mut Instant, tick: Duration) -> bool {
    *deadline += tick;
    let now = Instant::now();
    if now > *deadline {
        if now - *deadline > tick {
            *deadline = now;
        }
        return true;
    }
    while Instant::now() < *deadline {
        std::hint::spin_loop();
    }
    false
}

#[derive(Debug, Default)]
struct TxFifo {
    words: VecDeque<u32>,
    busy: bool,
    shutdown: bool,
    failed: Option<LinkError>,
}

#[derive(Debug, Default)]
struct TxShared {
    fifo: Mutex<TxFifo>,
    ready: Condvar,
    space: Condvar,
    drained: Condvar,
    late_ticks: AtomicU64,
}

/// Emulated transmit sequencer clocked at twice the bit rate
#[derive(Debug)]
pub struct EmulatedTxPeripheral<D, C> {
    shared: Arc<TxShared>,
    worker: Option<JoinHandle<(D, C)>>,
    depth: usize,
}

impl<D, C> EmulatedTxPeripheral<D, C>
where
    D: OutputPin + Send + 'static,
    C: OutputPin + Send + 'static,
{
    /// Arm the sequencer on the given lines
    pub fn start(mut data: D, mut clock: C, config: &LinkConfig) -> Result<Self> {
        config.validate()?;
        data.set_low().map_err(pin_err)?;
        clock.set_low().map_err(pin_err)?;

        let shared = Arc::new(TxShared::default());
        let tick = tick_period(u64::from(config.sequencer_hz()));
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-seq-tx", config.thread_name))
                .spawn(move || run_tx(data, clock, shared, tick))
                .map_err(|e| LinkError::worker(format!("Failed to start sequencer: {}", e)))?
        };

        info!(
            sequencer_hz = config.sequencer_hz(),
            fifo_depth = config.fifo_depth,
            "transmit sequencer armed"
        );
        Ok(EmulatedTxPeripheral {
            shared,
            worker: Some(worker),
            depth: config.fifo_depth,
        })
    }

    /// Ticks that started after their deadline
    pub fn late_ticks(&self) -> u64 {
        self.shared.late_ticks.load(Ordering::Relaxed)
    }

    /// Finish every queued word, stop the sequencer and give back the lines
    pub fn shutdown(mut self) -> Result<(D, C)> {
        self.signal_shutdown();
        let worker = self
            .worker
            .take()
            .ok_or_else(|| LinkError::worker("Sequencer already stopped"))?;
        worker
            .join()
            .map_err(|_| LinkError::worker("Transmit sequencer panicked"))
    }

    fn signal_shutdown(&self) {
        let mut fifo = self.shared.fifo.lock();
        fifo.shutdown = true;
        self.shared.ready.notify_all();
        self.shared.space.notify_all();
    }
}

impl<D, C> TxPeripheral for EmulatedTxPeripheral<D, C> {
    fn write(&mut self, wire: u32) -> Result<()> {
        let mut fifo = self.shared.fifo.lock();
        loop {
            if let Some(err) = fifo.failed.take() {
                return Err(err);
            }
            if fifo.shutdown {
                return Err(LinkError::Stopped);
            }
            if fifo.words.len() < self.depth {
                fifo.words.push_back(wire);
                fifo.busy = true;
                self.shared.ready.notify_one();
                return Ok(());
            }
            self.shared.space.wait_for(&mut fifo, STALL_POLL);
        }
    }

    fn flush(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut fifo = self.shared.fifo.lock();
        while !fifo.words.is_empty() || fifo.busy {
            if self.shared.drained.wait_until(&mut fifo, deadline).timed_out() {
                return Err(LinkError::worker(format!(
                    "Sequencer did not drain within {:?}",
                    timeout
                )));
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        let fifo = self.shared.fifo.lock();
        fifo.words.is_empty() && !fifo.busy
    }
}

impl<D, C> Drop for EmulatedTxPeripheral<D, C> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            {
                let mut fifo = self.shared.fifo.lock();
                fifo.shutdown = true;
                self.shared.ready.notify_all();
            }
            let _ = worker.join();
        }
    }
}

fn drive<D: OutputPin, C: OutputPin>(
    data: &mut D,
    clock: &mut C,
    from: Levels,
    to: Levels,
) -> Result<()> {
    // Falling clock before the data change, rising clock after it
    if from.clock && !to.clock {
        clock.set_low().map_err(pin_err)?;
    }
    if from.data != to.data {
        if to.data {
            data.set_high().map_err(pin_err)?;
        } else {
            data.set_low().map_err(pin_err)?;
        }
    }
    if !from.clock && to.clock {
        clock.set_high().map_err(pin_err)?;
    }
    Ok(())
}

fn run_tx<D: OutputPin, C: OutputPin>(
    mut data: D,
    mut clock: C,
    shared: Arc<TxShared>,
    tick: Duration,
) -> (D, C) {
    let mut machine = TxMachine::new();
    let mut levels = Levels::default();
    let mut deadline = Instant::now();
    let mut words = 0u64;

    loop {
        if machine.is_idle() {
            let mut fifo = shared.fifo.lock();
            while fifo.words.is_empty() {
                fifo.busy = false;
                shared.drained.notify_all();
                if fifo.shutdown {
                    drop(fifo);
                    let _ = data.set_low();
                    let _ = clock.set_low();
                    debug!(words, "transmit sequencer stopped");
                    return (data, clock);
                }
                shared.ready.wait_for(&mut fifo, STALL_POLL);
            }
            fifo.busy = true;
            drop(fifo);
            // Re-arm after a stall
            deadline = Instant::now();
        }

        let outcome = machine.tick(|| {
            let mut fifo = shared.fifo.lock();
            let word = fifo.words.pop_front();
            shared.space.notify_one();
            word
        });

        let next = match outcome {
            TxTick::Stalled => continue,
            TxTick::Drive(next) => next,
            TxTick::Done(next) => {
                words += 1;
                next
            }
        };

        if let Err(err) = drive(&mut data, &mut clock, levels, next) {
            warn!(error = %err, "transmit sequencer failed to drive lines");
            shared.fifo.lock().failed = Some(err);
        }
        levels = next;

        if next_tick(&mut deadline, tick) {
            shared.late_ticks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Default)]
struct RxFifo {
    events: VecDeque<RxEvent>,
    overruns: u64,
}

#[derive(Debug, Default)]
struct RxShared {
    fifo: Mutex<RxFifo>,
    receiving: AtomicBool,
    shutdown: AtomicBool,
    late_ticks: AtomicU64,
}

/// Emulated receive sequencer sampling the lines at `oversample` ticks per bit
#[derive(Debug)]
pub struct EmulatedRxPeripheral<D, C> {
    shared: Arc<RxShared>,
    worker: Option<JoinHandle<(D, C)>>,
}

impl<D, C> EmulatedRxPeripheral<D, C>
where
    D: InputPin + Send + 'static,
    C: InputPin + Send + 'static,
{
    /// Arm the sequencer on the given lines
    pub fn start(data: D, clock: C, config: &LinkConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(RxShared::default());
        let hz = u64::from(config.frequency_hz) * u64::from(config.oversample);
        let tick = tick_period(hz);
        let machine = RxMachine::new(config.idle_timeout_cycles);
        let depth = config.fifo_depth;
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-seq-rx", config.thread_name))
                .spawn(move || run_rx(data, clock, machine, shared, tick, depth))
                .map_err(|e| LinkError::worker(format!("Failed to start sequencer: {}", e)))?
        };

        info!(sample_hz = hz, fifo_depth = depth, "receive sequencer armed");
        Ok(EmulatedRxPeripheral {
            shared,
            worker: Some(worker),
        })
    }

    /// Events dropped because the receive FIFO was full
    pub fn overruns(&self) -> u64 {
        self.shared.fifo.lock().overruns
    }

    /// Ticks that started after their deadline
    pub fn late_ticks(&self) -> u64 {
        self.shared.late_ticks.load(Ordering::Relaxed)
    }

    /// Stop sampling and give back the lines
    pub fn shutdown(mut self) -> Result<(D, C)> {
        self.shared.shutdown.store(true, Ordering::Release);
        let worker = self
            .worker
            .take()
            .ok_or_else(|| LinkError::worker("Sequencer already stopped"))?;
        worker
            .join()
            .map_err(|_| LinkError::worker("Receive sequencer panicked"))
    }
}

impl<D, C> RxPeripheral for EmulatedRxPeripheral<D, C> {
    fn in_waiting(&self) -> usize {
        self.shared.fifo.lock().events.len()
    }

    fn read(&mut self) -> Option<RxEvent> {
        self.shared.fifo.lock().events.pop_front()
    }

    fn is_receiving(&self) -> bool {
        self.shared.receiving.load(Ordering::Acquire)
    }
}

impl<D, C> Drop for EmulatedRxPeripheral<D, C> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.shutdown.store(true, Ordering::Release);
            let _ = worker.join();
        }
    }
}

fn sample<D: InputPin, C: InputPin>(data: &mut D, clock: &mut C) -> Result<Levels> {
    let clock = clock.is_high().map_err(pin_err)?;
    let data = data.is_high().map_err(pin_err)?;
    Ok(Levels { data, clock })
}

fn run_rx<D: InputPin, C: InputPin>(
    mut data: D,
    mut clock: C,
    mut machine: RxMachine,
    shared: Arc<RxShared>,
    tick: Duration,
    depth: usize,
) -> (D, C) {
    let mut deadline = Instant::now();

    // A word in progress is finished (or timed out) before stopping
    while !(shared.shutdown.load(Ordering::Acquire) && !machine.in_word()) {
        let levels = match sample(&mut data, &mut clock) {
            Ok(levels) => levels,
            Err(err) => {
                warn!(error = %err, "receive sequencer failed to sample lines");
                thread::sleep(STALL_POLL);
                deadline = Instant::now();
                continue;
            }
        };

        let event = match machine.tick(levels) {
            RxTick::Word(wire) => Some(RxEvent::Word(wire)),
            RxTick::Timeout { bits } => Some(RxEvent::Timeout { bits }),
            RxTick::Idle | RxTick::Busy => None,
        };
        shared.receiving.store(machine.in_word(), Ordering::Release);

        if let Some(event) = event {
            let mut fifo = shared.fifo.lock();
            if fifo.events.len() < depth {
                fifo.events.push_back(event);
            } else {
                fifo.overruns += 1;
                warn!(?event, "receive FIFO full, event dropped");
            }
        }

        if next_tick(&mut deadline, tick) {
            shared.late_ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    shared.receiving.store(false, Ordering::Release);
    debug!("receive sequencer stopped");
    (data, clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfigBuilder;
    use crate::encoding::WordCodec;
    use crate::sim::SimBus;

    fn slow_config() -> LinkConfig {
        LinkConfigBuilder::new()
            .with_frequency(1_000)
            .with_oversample(8)
            .with_idle_timeout(64)
            .build()
            .unwrap()
    }

    fn decode(bus: &SimBus) -> Vec<u32> {
        let mut rx = RxMachine::new(4);
        bus.samples(0, 1)
            .into_iter()
            .filter_map(|s| match rx.tick(s) {
                RxTick::Word(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tx_sequencer_shifts_words_in_order() -> Result<()> {
        let bus = SimBus::new();
        let config = slow_config();
        let mut tx = EmulatedTxPeripheral::start(bus.claim(0)?, bus.claim(1)?, &config)?;
        assert!(tx.is_idle());

        let words: Vec<u32> = [0x0000_0000u32, 0xFFFF_FFFF, 0xAAAA_AAAA, 0x5555_5555]
            .iter()
            .map(|w| WordCodec::to_wire((*w).into()))
            .collect();
        for wire in &words {
            tx.write(*wire)?;
        }
        tx.flush(Duration::from_secs(5))?;
        assert!(tx.is_idle());

        assert_eq!(decode(&bus), words);
        assert_eq!(bus.edges(1).len(), 4 * 64);

        let (data, clock) = tx.shutdown()?;
        assert_eq!((data.id(), clock.id()), (0, 1));
        Ok(())
    }

    #[test]
    fn test_tx_sequencer_shutdown_finishes_queued_words() -> Result<()> {
        let bus = SimBus::new();
        let config = slow_config();
        let mut tx = EmulatedTxPeripheral::start(bus.claim(0)?, bus.claim(1)?, &config)?;
        tx.write(0x8000_0001)?;
        tx.write(0x7FFF_FFFE)?;
        let _ = tx.shutdown()?;

        // Both words on the line in full, never a partial one
        assert_eq!(decode(&bus), vec![0x8000_0001, 0x7FFF_FFFE]);
        assert_eq!(bus.edges(1).len(), 2 * 64);
        assert!(!bus.is_claimed(0));
        Ok(())
    }

    #[test]
    fn test_tx_sequencer_write_after_shutdown_signal() -> Result<()> {
        let bus = SimBus::new();
        let mut tx = EmulatedTxPeripheral::start(bus.claim(0)?, bus.claim(1)?, &slow_config())?;
        tx.signal_shutdown();
        assert_eq!(tx.write(1), Err(LinkError::Stopped));
        Ok(())
    }

    #[test]
    fn test_rx_sequencer_receives_driven_word() -> Result<()> {
        let bus = SimBus::new();
        bus.link(0, 10);
        bus.link(1, 11);
        let config = slow_config();

        let mut rx = EmulatedRxPeripheral::start(bus.claim(10)?, bus.claim(11)?, &config)?;
        let mut tx = EmulatedTxPeripheral::start(bus.claim(0)?, bus.claim(1)?, &config)?;

        let wire = WordCodec::to_wire(0x1234_5678u32.into());
        tx.write(wire)?;
        tx.flush(Duration::from_secs(5))?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while rx.in_waiting() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(rx.read(), Some(RxEvent::Word(wire)));
        assert_eq!(rx.overruns(), 0);

        drop(tx);
        let _ = rx.shutdown()?;
        Ok(())
    }
}
