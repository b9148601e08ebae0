pub mod bus;
pub mod demo;
pub mod drivers;
pub mod metrics;
pub mod peripherals;
pub mod snapshot;
pub mod tracker;
pub mod transfer;

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::drivers::intc::IntcDriver;
use crate::drivers::DeviceTable;


#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Bus access violation at {0:#x}")]
    MemoryViolation(u64),
    #[error("Unaligned register access at {0:#x}")]
    Unaligned(u64),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Trait for observing board events in a modular way.
pub trait BoardObserver: std::fmt::Debug + Send + Sync {
    fn on_run_start(&self) {}
    fn on_run_stop(&self, _reason: StopReason) {}
    fn on_step(&self, _step: u64) {}
    fn on_interrupt(&self, _line: u32) {}
}

/// Trait representing a memory-mapped peripheral with 32-bit registers.
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&mut self, offset: u64) -> SimResult<u32>;
    fn write(&mut self, offset: u64, value: u32) -> SimResult<()>;
    /// Advance by one step; returns true when the peripheral raises its
    /// interrupt output.
    fn tick(&mut self) -> bool {
        false
    }
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// Trait representing the system bus as seen by drivers.
pub trait Bus {
    fn read_u32(&mut self, addr: u64) -> SimResult<u32>;
    fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()>;
}

/// Why a bounded run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Condition,
    MaxSteps,
    WallTime,
}

/// Bounds for `Board::run_until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    pub max_steps: u64,
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            wall_time_ms: None,
        }
    }
}

/// A simulated MicroBlaze-style board: the system bus, its device
/// configuration table and the processor's exception layer.
pub struct Board {
    pub bus: bus::SystemBus,
    pub observers: Vec<Arc<dyn BoardObserver>>,
    pub devices: DeviceTable,
    exception_handler: Option<IntcDriver>,
    exceptions_enabled: bool,
    steps: u64,
}

impl Board {
    pub fn new(bus: bus::SystemBus, devices: DeviceTable) -> Self {
        Self {
            bus,
            observers: Vec::new(),
            devices,
            exception_handler: None,
            exceptions_enabled: false,
            steps: 0,
        }
    }

    /// Build the bus and device table described by a board descriptor.
    pub fn from_config(descriptor: &uartlite_config::BoardDescriptor) -> anyhow::Result<Self> {
        descriptor.validate()?;
        let bus = bus::SystemBus::from_config(descriptor);
        let devices = DeviceTable::from_config(descriptor);
        tracing::info!(
            "Board '{}': {} UART Lite, {} interrupt controller(s)",
            descriptor.name,
            devices.uartlite.len(),
            devices.intc.len()
        );
        Ok(Self::new(bus, devices))
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Install the handler called when the interrupt controller asserts the
    /// processor interrupt input. Replaces any previous handler.
    pub fn register_exception_handler(&mut self, handler: IntcDriver) {
        self.exception_handler = Some(handler);
    }

    pub fn exception_handler(&self) -> Option<&IntcDriver> {
        self.exception_handler.as_ref()
    }

    pub fn enable_exceptions(&mut self) {
        self.exceptions_enabled = true;
    }

    pub fn disable_exceptions(&mut self) {
        self.exceptions_enabled = false;
    }

    pub fn exceptions_enabled(&self) -> bool {
        self.exceptions_enabled
    }

    pub fn step(&mut self) -> SimResult<()> {
        self.steps += 1;
        for observer in &self.observers {
            observer.on_step(self.steps);
        }

        // Propagate peripherals
        let lines = self.bus.tick_peripherals();
        if let Some(intc) = &self.bus.intc {
            for line in lines {
                intc.raise(line);
                tracing::trace!("IRQ line {} raised", line);
            }
        }

        let asserted = self
            .bus
            .intc
            .as_ref()
            .map(|intc| intc.irq_asserted())
            .unwrap_or(false);
        if asserted && self.exceptions_enabled {
            if let Some(handler) = self.exception_handler.as_mut() {
                let dispatched = handler.interrupt_handler(&mut self.bus)?;
                for line in (0..32).filter(|l| dispatched & (1 << l) != 0) {
                    for observer in &self.observers {
                        observer.on_interrupt(line);
                    }
                }
            }
        }

        Ok(())
    }

    /// Step until `done` returns true or a limit expires. `done` is checked
    /// before the first step.
    pub fn run_until<F>(&mut self, limits: &RunLimits, mut done: F) -> SimResult<StopReason>
    where
        F: FnMut() -> bool,
    {
        for observer in &self.observers {
            observer.on_run_start();
        }

        let deadline = limits
            .wall_time_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut taken = 0u64;
        let reason = loop {
            if done() {
                break StopReason::Condition;
            }
            if taken >= limits.max_steps {
                break StopReason::MaxSteps;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break StopReason::WallTime;
            }
            self.step()?;
            taken += 1;
        };

        tracing::debug!("Run stopped after {} steps: {:?}", taken, reason);
        for observer in &self.observers {
            observer.on_run_stop(reason);
        }
        Ok(reason)
    }

    pub fn snapshot(&self) -> snapshot::BoardSnapshot {
        snapshot::BoardSnapshot::capture(self)
    }
}

impl Default for Board {
    fn default() -> Self {
        let descriptor = uartlite_config::BoardDescriptor::default();
        Self::new(
            bus::SystemBus::from_config(&descriptor),
            DeviceTable::from_config(&descriptor),
        )
    }
}
