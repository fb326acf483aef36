//! Sequencer microprograms for the transmit and receive paths
//!
//! Both programs are declared as state tables, independent of any particular
//! peripheral. [`TxMachine`] and [`RxMachine`] interpret them one sequencer
//! tick at a time, so the same tables can be loaded into a real sequencing
//! peripheral, run from a timer interrupt, or stepped in a test.
//!
//! Transmit program, clocked at twice the bit rate:
//!
//! ```text
//! SET_COUNT    x = 31, pull word          clock 0
//! SHIFT_BIT    data = osr[31], osr <<= 1   clock 0
//! PULSE_CLOCK  jmp x-- SHIFT_BIT           clock 1
//! RESET        data = 0                    clock 0
//! ```
//!
//! Receive program, sampling at any rate that sees both clock phases:
//!
//! ```text
//! SET_COUNT    x = 31, clear buffer
//! WAIT_EDGE    wait for rising clock edge (idle timeout while partial)
//! SAMPLE_BIT   shift data into buffer, jmp x-- WAIT_EDGE
//! PUSH         push buffer to receive FIFO
//! ```

use crate::arinc::WORD_BITS;

/// How a step picks the next state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Go to a fixed state
    Next(S),
    /// `jmp x--`: go to `again` while the counter is non-zero, else `done`
    CountDown {
        /// Target while bits remain
        again: S,
        /// Target once the counter is exhausted
        done: S,
    },
}

impl<S: Copy> Transition<S> {
    fn resolve(&self, count: &mut u8) -> S {
        match *self {
            Transition::Next(state) => state,
            Transition::CountDown { again, done } => {
                if *count > 0 {
                    *count -= 1;
                    again
                } else {
                    done
                }
            }
        }
    }
}

/// One row of a microprogram table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step<S, A> {
    /// State this row belongs to
    pub state: S,
    /// Work done during the tick
    pub action: A,
    /// Side-set value for the clock line, if the step drives it
    pub side_clock: Option<bool>,
    /// Where to go afterwards
    pub next: Transition<S>,
}

/// Line levels presented or sampled during one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Levels {
    /// Data line
    pub data: bool,
    /// Side-band clock line
    pub clock: bool,
}

impl Levels {
    /// Construct from explicit levels
    pub fn new(data: bool, clock: bool) -> Self {
        Levels { data, clock }
    }
}

/// Transmit program states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    /// Load the bit counter and pull the next word
    SetCount = 0,
    /// Present the next data bit with the clock low
    ShiftBit = 1,
    /// Raise the clock while the data bit is held
    PulseClock = 2,
    /// Drop the data line after the last bit
    Reset = 3,
}

/// Transmit step actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    /// Pull a word into the shift register and load the counter
    LoadCount,
    /// Shift the top bit of the shift register onto the data line
    ShiftOut,
    /// Keep the data line as is
    Hold,
    /// Drive the data line low
    ClearData,
}

/// The fixed transmit microprogram
pub const TX_PROGRAM: [Step<TxState, TxAction>; 4] = [
    Step {
        state: TxState::SetCount,
        action: TxAction::LoadCount,
        side_clock: Some(false),
        next: Transition::Next(TxState::ShiftBit),
    },
    Step {
        state: TxState::ShiftBit,
        action: TxAction::ShiftOut,
        side_clock: Some(false),
        next: Transition::Next(TxState::PulseClock),
    },
    Step {
        state: TxState::PulseClock,
        action: TxAction::Hold,
        side_clock: Some(true),
        next: Transition::CountDown {
            again: TxState::ShiftBit,
            done: TxState::Reset,
        },
    },
    Step {
        state: TxState::Reset,
        action: TxAction::ClearData,
        side_clock: Some(false),
        next: Transition::Next(TxState::SetCount),
    },
];

/// Result of one transmit tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTick {
    /// Waiting for a word; lines unchanged
    Stalled,
    /// Lines driven to the given levels
    Drive(Levels),
    /// Final tick of a word; lines driven to the given levels
    Done(Levels),
}

/// Tick-level interpreter of [`TX_PROGRAM`]
#[derive(Debug, Clone)]
pub struct TxMachine {
    state: TxState,
    count: u8,
    osr: u32,
    levels: Levels,
    ticks: u64,
}

impl TxMachine {
    /// Ticks spent in the bit loop for one word
    pub const BIT_LOOP_TICKS: u64 = 2 * WORD_BITS as u64;
    /// Ticks for one word including `SET_COUNT` and `RESET`
    pub const WORD_TICKS: u64 = Self::BIT_LOOP_TICKS + 2;

    /// Create a machine parked at `SET_COUNT`
    pub fn new() -> Self {
        TxMachine {
            state: TxState::SetCount,
            count: 0,
            osr: 0,
            levels: Levels::default(),
            ticks: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Whether the machine sits between words
    pub fn is_idle(&self) -> bool {
        self.state == TxState::SetCount
    }

    /// Line levels after the last tick
    pub fn levels(&self) -> Levels {
        self.levels
    }

    /// Ticks executed so far, stalls excluded
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Execute one sequencer tick
    ///
    /// `pull` is only called at `SET_COUNT`; returning `None` stalls the
    /// machine there, like a sequencer waiting on an empty FIFO.
    pub fn tick(&mut self, pull: impl FnOnce() -> Option<u32>) -> TxTick {
        let step = TX_PROGRAM[self.state as usize];

        match step.action {
            TxAction::LoadCount => match pull() {
                Some(word) => {
                    self.osr = word;
                    self.count = (WORD_BITS - 1) as u8;
                }
                None => return TxTick::Stalled,
            },
            TxAction::ShiftOut => {
                self.levels.data = self.osr & 0x8000_0000 != 0;
                self.osr <<= 1;
            }
            TxAction::Hold => {}
            TxAction::ClearData => self.levels.data = false,
        }
        if let Some(clock) = step.side_clock {
            self.levels.clock = clock;
        }

        self.state = step.next.resolve(&mut self.count);
        self.ticks += 1;

        if step.state == TxState::Reset {
            TxTick::Done(self.levels)
        } else {
            TxTick::Drive(self.levels)
        }
    }

    /// Levels of every tick needed to send one wire-order word
    pub fn waveform(wire: u32) -> Vec<Levels> {
        let mut machine = TxMachine::new();
        let mut word = Some(wire);
        let mut out = Vec::with_capacity(Self::WORD_TICKS as usize);

        loop {
            match machine.tick(|| word.take()) {
                TxTick::Drive(levels) => out.push(levels),
                TxTick::Done(levels) => {
                    out.push(levels);
                    return out;
                }
                TxTick::Stalled => return out,
            }
        }
    }
}

impl Default for TxMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive program states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxState {
    /// Clear the buffer and load the bit counter
    SetCount = 0,
    /// Wait for a rising edge of the side-band clock
    WaitEdge = 1,
    /// Shift the sampled data bit into the buffer
    SampleBit = 2,
    /// Hand the completed word to the receive FIFO
    Push = 3,
}

/// Receive step actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxAction {
    /// Clear the receive buffer and load the counter
    ResetCount,
    /// Block until a rising clock edge is sampled
    AwaitEdge,
    /// Shift the data level into the buffer
    ShiftIn,
    /// Emit the buffer as a word
    PushWord,
}

/// The fixed receive microprogram
pub const RX_PROGRAM: [Step<RxState, RxAction>; 4] = [
    Step {
        state: RxState::SetCount,
        action: RxAction::ResetCount,
        side_clock: None,
        next: Transition::Next(RxState::WaitEdge),
    },
    Step {
        state: RxState::WaitEdge,
        action: RxAction::AwaitEdge,
        side_clock: None,
        next: Transition::Next(RxState::SampleBit),
    },
    Step {
        state: RxState::SampleBit,
        action: RxAction::ShiftIn,
        side_clock: None,
        next: Transition::CountDown {
            again: RxState::WaitEdge,
            done: RxState::Push,
        },
    },
    Step {
        state: RxState::Push,
        action: RxAction::PushWord,
        side_clock: None,
        next: Transition::Next(RxState::SetCount),
    },
];

/// Four-byte accumulator for a word being received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveBuffer {
    bytes: [u8; 4],
    bits: u8,
}

impl ReceiveBuffer {
    /// Append one bit, most significant bit of each byte first
    pub fn push_bit(&mut self, bit: bool) {
        if self.is_complete() {
            return;
        }
        if bit {
            let index = usize::from(self.bits / 8);
            self.bytes[index] |= 0x80 >> (self.bits % 8);
        }
        self.bits += 1;
    }

    /// Bits collected so far
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// No bit collected yet
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// All 32 bits collected
    pub fn is_complete(&self) -> bool {
        usize::from(self.bits) == WORD_BITS
    }

    /// Wire-order value of the collected bits
    pub fn word(&self) -> u32 {
        u32::from_be_bytes(self.bytes)
    }

    /// Clear for the next word
    pub fn reset(&mut self) {
        *self = ReceiveBuffer::default();
    }
}

/// Result of one receive tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxTick {
    /// Line idle, nothing buffered
    Idle,
    /// Mid-word
    Busy,
    /// A full wire-order word was assembled
    Word(u32),
    /// Clock stopped mid-word; the buffer was discarded
    Timeout {
        /// Bits that had been collected
        bits: u8,
    },
}

/// Tick-level interpreter of [`RX_PROGRAM`]
#[derive(Debug, Clone)]
pub struct RxMachine {
    state: RxState,
    count: u8,
    buffer: ReceiveBuffer,
    last_clock: bool,
    idle: u32,
    idle_limit: u32,
}

impl RxMachine {
    /// Create a machine that abandons a partial word after `idle_limit`
    /// ticks without a clock edge
    pub fn new(idle_limit: u32) -> Self {
        RxMachine {
            state: RxState::SetCount,
            count: 0,
            buffer: ReceiveBuffer::default(),
            last_clock: false,
            idle: 0,
            idle_limit: idle_limit.max(1),
        }
    }

    /// Current state
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Partial word collected so far
    pub fn buffer(&self) -> &ReceiveBuffer {
        &self.buffer
    }

    /// Whether a word is partially assembled
    pub fn in_word(&self) -> bool {
        self.state != RxState::SetCount && !self.buffer.is_empty()
    }

    /// Feed one sample of the lines
    pub fn tick(&mut self, sample: Levels) -> RxTick {
        let mut edge = sample.clock && !self.last_clock;
        self.last_clock = sample.clock;

        loop {
            let step = RX_PROGRAM[self.state as usize];

            let emitted = match step.action {
                RxAction::ResetCount => {
                    self.buffer.reset();
                    self.count = (WORD_BITS - 1) as u8;
                    self.idle = 0;
                    None
                }
                RxAction::AwaitEdge => {
                    if !edge {
                        return self.idle_tick();
                    }
                    edge = false;
                    self.idle = 0;
                    None
                }
                RxAction::ShiftIn => {
                    self.buffer.push_bit(sample.data);
                    None
                }
                RxAction::PushWord => Some(RxTick::Word(self.buffer.word())),
            };

            self.state = step.next.resolve(&mut self.count);

            if let Some(tick) = emitted {
                return tick;
            }
            if step.action == RxAction::ShiftIn && self.state == RxState::WaitEdge {
                return RxTick::Busy;
            }
        }
    }

    fn idle_tick(&mut self) -> RxTick {
        if self.buffer.is_empty() {
            return RxTick::Idle;
        }

        self.idle += 1;
        if self.idle < self.idle_limit {
            return RxTick::Busy;
        }

        match self.abandon() {
            Some(bits) => RxTick::Timeout { bits },
            None => RxTick::Idle,
        }
    }

    /// Drop a partial word and return to `SET_COUNT`
    ///
    /// Returns the number of bits discarded, or `None` if no word was in
    /// progress. Lets a sampler with its own notion of time apply the idle
    /// timeout.
    pub fn abandon(&mut self) -> Option<u8> {
        if !self.in_word() {
            return None;
        }
        let bits = self.buffer.bits();
        self.buffer.reset();
        self.idle = 0;
        self.state = RxState::SetCount;
        Some(bits)
    }
}
