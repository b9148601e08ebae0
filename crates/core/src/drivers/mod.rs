//! Driver facades written against the `Bus` the way they would be written
//! against real MMIO: UART Lite and the interrupt controller.

pub mod intc;
pub mod uartlite;

use crate::transfer::Direction;
use crate::SimulationError;

use self::intc::IntcConfig;
use self::uartlite::UartLiteConfig;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("No {kind} with device id {device_id}")]
    DeviceNotFound { kind: &'static str, device_id: u16 },
    #[error("Self test failed: status {status:#010x}")]
    SelfTestFailed { status: u32 },
    #[error("Interrupt line {line} out of range (controller has {inputs} inputs)")]
    InvalidLine { line: u32, inputs: u32 },
    #[error("Interrupt controller already started")]
    AlreadyStarted,
    #[error("Interrupt controller {device_id} does not receive peripheral line {line}")]
    LineNotRouted { device_id: u16, line: u32 },
    #[error("Operation requires the controller in simulation mode")]
    NotSimulationMode,
    #[error("A {0} transfer is already in flight")]
    Busy(Direction),
    #[error("Submitted a {got} transfer to the {expected} path")]
    DirectionMismatch { expected: Direction, got: Direction },
    #[error(transparent)]
    Bus(#[from] SimulationError),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Per-board configuration table the drivers look devices up in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceTable {
    pub uartlite: Vec<UartLiteConfig>,
    pub intc: Vec<IntcConfig>,
}

impl DeviceTable {
    /// Controller that peripheral interrupt lines are wired to.
    pub fn root_intc(&self) -> Option<&IntcConfig> {
        self.intc.first()
    }

    pub fn from_config(descriptor: &uartlite_config::BoardDescriptor) -> Self {
        Self {
            uartlite: descriptor
                .uartlite
                .iter()
                .map(|d| UartLiteConfig {
                    device_id: d.device_id,
                    base_address: d.base_address,
                    baud_rate: d.baud_rate,
                    use_parity: d.use_parity,
                    odd_parity: d.odd_parity,
                    data_bits: d.data_bits,
                    interrupt_line: d.irq,
                })
                .collect(),
            intc: descriptor
                .intc
                .iter()
                .map(|d| IntcConfig {
                    device_id: d.device_id,
                    base_address: d.base_address,
                    num_inputs: d.num_inputs,
                })
                .collect(),
        }
    }
}
