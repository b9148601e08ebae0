//! The UART Lite interrupt example: bring up the UART and the interrupt
//! controller, send a fixed pattern, receive the same number of bytes and
//! report the outcome on a console.

use crate::drivers::intc::{IntcDriver, StartMode};
use crate::drivers::uartlite::{UartLiteDriver, UartLiteStats};
use crate::drivers::{DriverError, DriverResult};
use crate::tracker::{CompletionState, TrackerError, TransferTracker};
use crate::transfer::{Direction, Transfer};
use crate::{Board, RunLimits, SimulationError, StopReason};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;

/// Bytes sent by the example.
pub const TEST_PATTERN: [u8; 5] = [0x56, 0x00, 0x36, 0x01, 0x00];

/// How the example decides a transfer went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCheck {
    /// Read the done flag once, right after submitting, with no time
    /// elapsed. Almost never sees a finished transfer.
    Immediate,
    /// Run the board until the transfer completes or the limits expire.
    #[default]
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoOptions {
    pub uart_device_id: u16,
    pub intc_device_id: u16,
    pub pattern: Vec<u8>,
    pub check: CompletionCheck,
    /// Applied to each wait separately.
    pub limits: RunLimits,
    /// Compare received bytes against the pattern (wait mode only).
    pub verify: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            uart_device_id: 0,
            intc_device_id: 0,
            pattern: TEST_PATTERN.to_vec(),
            check: CompletionCheck::default(),
            limits: RunLimits::default(),
            verify: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("UART Lite device {0} not found")]
    UartNotFound(u16),
    #[error("UART Lite initialization failed")]
    UartInit(#[source] DriverError),
    #[error("UART Lite self test failed")]
    SelfTest(#[source] DriverError),
    #[error("UART Lite {0} is not wired to an interrupt line")]
    NoInterruptLine(u16),
    #[error("Interrupt system setup failed")]
    InterruptSetup(#[source] DriverError),
    #[error("Enabling UART Lite interrupts failed")]
    EnableInterrupt(#[source] DriverError),
    #[error(transparent)]
    Busy(#[from] TrackerError),
    #[error("Submitting the {direction} transfer failed")]
    Submit {
        direction: Direction,
        #[source]
        source: DriverError,
    },
    #[error("{direction} transfer stopped on {reason:?} after {completed}/{requested} bytes")]
    Timeout {
        direction: Direction,
        reason: StopReason,
        completed: usize,
        requested: usize,
    },
    #[error("Received {received:02x?}, expected {sent:02x?}")]
    DataMismatch { sent: Vec<u8>, received: Vec<u8> },
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error("Console write failed")]
    Console(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoReport {
    pub check: CompletionCheck,
    pub transmit_ok: bool,
    pub receive_ok: bool,
    pub sent: Vec<u8>,
    /// Receive buffer, once the driver handed it back.
    pub received: Option<Vec<u8>>,
    pub verified: Option<bool>,
    pub send_state: CompletionState,
    pub receive_state: CompletionState,
    pub stats: UartLiteStats,
    pub steps: u64,
}

/// Connect the UART to the interrupt controller, start the controller in
/// real mode, and install it as the board's exception handler.
pub fn setup_interrupt_system(
    board: &mut Board,
    uart: &UartLiteDriver,
    intc_device_id: u16,
    line: u32,
) -> DriverResult<()> {
    let mut intc = IntcDriver::initialize(&mut board.bus, &board.devices, intc_device_id)?;
    if board.devices.root_intc().map(|c| c.device_id) != Some(intc_device_id) {
        return Err(DriverError::LineNotRouted {
            device_id: intc_device_id,
            line,
        });
    }

    let device = uart.clone();
    intc.connect(line, move |bus| device.interrupt_handler(bus))?;
    intc.start(&mut board.bus, StartMode::Real)?;
    intc.enable(&mut board.bus, line)?;

    board.register_exception_handler(intc);
    board.enable_exceptions();
    Ok(())
}

fn wait_for(
    board: &mut Board,
    tracker: &TransferTracker,
    direction: Direction,
    limits: &RunLimits,
) -> Result<(), DemoError> {
    let reason = board.run_until(limits, || tracker.is_done(direction))?;
    if reason != StopReason::Condition {
        let state = tracker.state(direction);
        return Err(DemoError::Timeout {
            direction,
            reason,
            completed: state.completed,
            requested: state.requested,
        });
    }
    Ok(())
}

pub fn run(
    board: &mut Board,
    options: &DemoOptions,
    console: &mut dyn Write,
) -> Result<DemoReport, DemoError> {
    let config = UartLiteDriver::lookup_config(&board.devices, options.uart_device_id)
        .cloned()
        .ok_or(DemoError::UartNotFound(options.uart_device_id))?;
    let uart = UartLiteDriver::initialize(&mut board.bus, &config).map_err(DemoError::UartInit)?;
    uart.self_test(&mut board.bus).map_err(DemoError::SelfTest)?;

    let line = config
        .interrupt_line
        .ok_or(DemoError::NoInterruptLine(config.device_id))?;
    setup_interrupt_system(board, &uart, options.intc_device_id, line)
        .map_err(DemoError::InterruptSetup)?;

    let tracker = Arc::new(TransferTracker::new());
    uart.set_send_handler(tracker.completion_handler(Direction::Send));
    uart.set_recv_handler(tracker.completion_handler(Direction::Receive));
    uart.enable_interrupt(&mut board.bus).map_err(DemoError::EnableInterrupt)?;

    let len = options.pattern.len();
    tracker.begin(Direction::Send, len)?;
    uart.send(&mut board.bus, Transfer::send(options.pattern.clone()))
        .map_err(|source| DemoError::Submit {
            direction: Direction::Send,
            source,
        })?;
    let immediate_tx = tracker.is_done(Direction::Send);

    tracker.begin(Direction::Receive, len)?;
    uart.recv(&mut board.bus, Transfer::receive(len)).map_err(|source| DemoError::Submit {
        direction: Direction::Receive,
        source,
    })?;
    let immediate_rx = tracker.is_done(Direction::Receive);

    let (transmit_ok, receive_ok) = match options.check {
        CompletionCheck::Immediate => {
            tracing::warn!(
                "Completion checked right after submission; transfers are still in flight"
            );
            (immediate_tx, immediate_rx)
        }
        CompletionCheck::Wait => {
            wait_for(board, &tracker, Direction::Send, &options.limits)?;
            wait_for(board, &tracker, Direction::Receive, &options.limits)?;
            (true, true)
        }
    };

    if transmit_ok {
        writeln!(console, "Transmit OK")?;
    }
    if receive_ok {
        writeln!(console, "Receive OK")?;
    }

    let sent = uart
        .reclaim(Direction::Send)
        .map(Transfer::into_buffer)
        .unwrap_or_else(|| options.pattern.clone());
    let received = uart.reclaim(Direction::Receive).map(Transfer::into_buffer);

    let mut verified = None;
    if options.verify && options.check == CompletionCheck::Wait {
        let got = received.clone().unwrap_or_default();
        if got == sent {
            writeln!(console, "Data Received")?;
            verified = Some(true);
        } else {
            writeln!(console, "Data not received")?;
            return Err(DemoError::DataMismatch {
                sent,
                received: got,
            });
        }
    }

    tracing::info!(
        "Example finished after {} steps (tx {}, rx {})",
        board.steps(),
        transmit_ok,
        receive_ok
    );

    Ok(DemoReport {
        check: options.check,
        transmit_ok,
        receive_ok,
        sent,
        received,
        verified,
        send_state: tracker.state(Direction::Send),
        receive_state: tracker.state(Direction::Receive),
        stats: uart.stats(),
        steps: board.steps(),
    })
}
