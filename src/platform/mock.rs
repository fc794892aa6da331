use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::Platform;
use crate::error::{PiIoError, Result};
use crate::gpio::{
    Board, DigitalLine, Direction, Edge, InterruptEvent, LineEvent, LineHandler, Pull,
};

struct MockLineState {
    pin: u16,
    direction: Direction,
    edge: Edge,
    pull: Pull,
    value: bool,
    handler: Option<LineHandler>,
}

/// In-memory GPIO line. Clones share state, so a test can keep one to
/// drive edges into the driver that owns the other.
#[derive(Clone)]
pub struct MockLine {
    state: Arc<Mutex<MockLineState>>,
}

impl MockLine {
    pub fn new(pin: u16, direction: Direction, edge: Edge) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockLineState {
                pin,
                direction,
                edge,
                pull: Pull::Off,
                value: false,
                handler: None,
            })),
        }
    }

    pub fn level(&self) -> bool {
        self.state.lock().value
    }

    pub fn pull(&self) -> Pull {
        self.state.lock().pull
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().handler.is_some()
    }

    /// Changes the level without raising an edge.
    pub fn set_level(&self, value: bool) {
        self.state.lock().value = value;
    }

    /// Changes the level and raises an edge if the line listens for it.
    pub fn trigger(&self, value: bool) {
        let (event, handler) = {
            let mut state = self.state.lock();
            let old = state.value;
            state.value = value;
            let event = InterruptEvent::from_level(state.pin, value);
            if old == value || !edge_matches(state.edge, event.edge) {
                return;
            }
            (event, state.handler.clone())
        };
        if let Some(handler) = handler {
            handler(LineEvent::Interrupt(event));
        }
    }

    /// Simulates the interrupt worker dying on an I/O error.
    pub fn fail(&self, message: &str) {
        let handler = self.state.lock().handler.take();
        if let Some(handler) = handler {
            handler(LineEvent::Failed(message.to_string()));
        }
    }
}

fn edge_matches(configured: Edge, observed: Edge) -> bool {
    match configured {
        Edge::None => false,
        Edge::Rising => observed == Edge::Rising,
        Edge::Falling => observed == Edge::Falling,
        Edge::Both => matches!(observed, Edge::Rising | Edge::Falling),
    }
}

impl DigitalLine for MockLine {
    fn pin(&self) -> u16 {
        self.state.lock().pin
    }

    fn direction(&self) -> Result<Direction> {
        Ok(self.state.lock().direction)
    }

    fn set_direction(&self, direction: Direction) -> Result<()> {
        self.state.lock().direction = direction;
        Ok(())
    }

    fn edge(&self) -> Result<Edge> {
        Ok(self.state.lock().edge)
    }

    fn set_edge(&self, edge: Edge) -> Result<()> {
        self.state.lock().edge = edge;
        Ok(())
    }

    fn set_pull(&self, pull: Pull) -> Result<()> {
        self.state.lock().pull = pull;
        Ok(())
    }

    fn value(&self) -> Result<bool> {
        Ok(self.state.lock().value)
    }

    fn set_value(&self, value: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.direction != Direction::Out {
            return Err(PiIoError::OperationFailed(format!(
                "gpio{} is not an output",
                state.pin
            )));
        }
        state.value = value;
        Ok(())
    }

    fn start_interrupts(&self, handler: LineHandler) -> Result<()> {
        self.state.lock().handler = Some(handler);
        Ok(())
    }

    fn stop_interrupts(&self) {
        self.state.lock().handler = None;
    }
}

struct MockRegisters {
    regs: [u8; 256],
    pointer: u8,
    paired: bool,
    failing: bool,
}

impl MockRegisters {
    fn advance(&mut self) {
        self.pointer = if self.paired {
            self.pointer ^ 1
        } else {
            self.pointer.wrapping_add(1)
        };
    }
}

/// In-memory I2C device register file answering at one address.
#[derive(Clone)]
pub struct MockI2c {
    address: u8,
    state: Arc<Mutex<MockRegisters>>,
}

impl MockI2c {
    /// Register pointer auto-increments through the whole map.
    pub fn new(address: u8) -> Self {
        Self::build(address, false)
    }

    /// Register pointer toggles within an A/B register pair.
    pub fn paired(address: u8) -> Self {
        Self::build(address, true)
    }

    fn build(address: u8, paired: bool) -> Self {
        Self {
            address,
            state: Arc::new(Mutex::new(MockRegisters {
                regs: [0; 256],
                pointer: 0,
                paired,
                failing: false,
            })),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.state.lock().regs[usize::from(reg)]
    }

    pub fn register16(&self, reg: u8) -> u16 {
        let state = self.state.lock();
        let hi = if state.paired { reg ^ 1 } else { reg.wrapping_add(1) };
        u16::from_le_bytes([state.regs[usize::from(reg)], state.regs[usize::from(hi)]])
    }

    pub fn set_register(&self, reg: u8, value: u8) {
        self.state.lock().regs[usize::from(reg)] = value;
    }

    pub fn set_register16(&self, reg: u8, value: u16) {
        let mut state = self.state.lock();
        let hi = if state.paired { reg ^ 1 } else { reg.wrapping_add(1) };
        let [lo_byte, hi_byte] = value.to_le_bytes();
        state.regs[usize::from(reg)] = lo_byte;
        state.regs[usize::from(hi)] = hi_byte;
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}

impl ErrorType for MockI2c {
    type Error = ErrorKind;
}

impl I2c for MockI2c {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> core::result::Result<(), Self::Error> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(ErrorKind::Bus);
        }
        if address != self.address {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    let Some((&reg, data)) = bytes.split_first() else {
                        continue;
                    };
                    state.pointer = reg;
                    for &byte in data {
                        let pointer = usize::from(state.pointer);
                        state.regs[pointer] = byte;
                        state.advance();
                    }
                }
                Operation::Read(buf) => {
                    for byte in buf.iter_mut() {
                        *byte = state.regs[usize::from(state.pointer)];
                        state.advance();
                    }
                }
            }
        }
        Ok(())
    }
}

/// Test platform: mock lines on a configurable board and mock I2C devices.
pub struct MockPlatform {
    board: Board,
    lines: Mutex<FxHashMap<u16, MockLine>>,
    buses: Mutex<FxHashMap<u8, MockI2c>>,
    bus_failure: AtomicBool,
}

impl MockPlatform {
    pub fn new(board: Board) -> Self {
        Self {
            board,
            lines: Mutex::new(FxHashMap::default()),
            buses: Mutex::new(FxHashMap::default()),
            bus_failure: AtomicBool::new(false),
        }
    }

    /// Most recently opened line for `pin`.
    pub fn line(&self, pin: u16) -> Option<MockLine> {
        self.lines.lock().get(&pin).cloned()
    }

    /// Registers the device answering at its address.
    pub fn attach_bus(&self, bus: MockI2c) {
        self.buses.lock().insert(bus.address(), bus);
    }

    pub fn bus(&self, address: u8) -> Option<MockI2c> {
        self.buses.lock().get(&address).cloned()
    }

    pub fn set_bus_failure(&self, failing: bool) {
        self.bus_failure.store(failing, Ordering::Release);
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new(Board::default())
    }
}

impl Platform for MockPlatform {
    type Line = MockLine;
    type Bus = MockI2c;

    fn board(&self) -> &Board {
        &self.board
    }

    fn open_line(&self, pin: u16, direction: Direction, edge: Edge) -> Result<MockLine> {
        let line = MockLine::new(pin, direction, edge);
        self.lines.lock().insert(pin, line.clone());
        Ok(line)
    }

    fn open_bus(&self, address: u8) -> Result<MockI2c> {
        if self.bus_failure.load(Ordering::Acquire) {
            return Err(PiIoError::OperationFailed(format!(
                "i2c device 0x{address:02x} unavailable"
            )));
        }
        Ok(self
            .buses
            .lock()
            .entry(address)
            .or_insert_with(|| MockI2c::new(address))
            .clone())
    }
}
