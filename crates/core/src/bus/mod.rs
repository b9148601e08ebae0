use crate::peripherals::intc::{Intc, IntcState};
use crate::peripherals::uartlite::UartLite;
use crate::{Peripheral, SimResult, SimulationError};
use std::sync::Arc;

#[derive(Debug)]
pub struct PeripheralEntry {
    pub name: String,
    pub base: u64,
    pub size: u64,
    /// Interrupt controller input driven by this peripheral.
    pub irq: Option<u32>,
    pub dev: Box<dyn Peripheral>,
}

#[derive(Debug, Default)]
pub struct SystemBus {
    pub peripherals: Vec<PeripheralEntry>,
    /// Pending/enable state of the root interrupt controller.
    pub intc: Option<Arc<IntcState>>,
}

impl SystemBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every core named by the descriptor. The first interrupt
    /// controller becomes the root that peripheral lines are routed to.
    pub fn from_config(descriptor: &uartlite_config::BoardDescriptor) -> Self {
        let mut bus = Self::new();

        for (idx, desc) in descriptor.intc.iter().enumerate() {
            let state = Arc::new(IntcState::new(desc.num_inputs));
            if idx == 0 {
                bus.intc = Some(state.clone());
            }
            bus.peripherals.push(PeripheralEntry {
                name: desc.id.clone(),
                base: desc.base_address,
                size: uartlite_config::INTC_REGION_SIZE,
                irq: None,
                dev: Box::new(Intc::new(state)),
            });
        }

        for desc in &descriptor.uartlite {
            let frame_bits = 1 + u32::from(desc.data_bits) + u32::from(desc.use_parity) + 1;
            let mut uart = UartLite::new(frame_bits.saturating_mul(descriptor.ticks_per_bit));
            uart.set_loopback(desc.loopback);
            uart.set_stuck_status(desc.faults.stuck_status);
            bus.peripherals.push(PeripheralEntry {
                name: desc.id.clone(),
                base: desc.base_address,
                size: uartlite_config::UARTLITE_REGION_SIZE,
                irq: desc.irq,
                dev: Box::new(uart),
            });
        }

        bus
    }

    fn find_peripheral(&mut self, addr: u64) -> SimResult<(&mut PeripheralEntry, u64)> {
        if addr % 4 != 0 {
            return Err(SimulationError::Unaligned(addr));
        }
        self.peripherals
            .iter_mut()
            .find(|p| addr >= p.base && addr - p.base < p.size)
            .map(|p| {
                let offset = addr - p.base;
                (p, offset)
            })
            .ok_or(SimulationError::MemoryViolation(addr))
    }

    /// Tick every peripheral; returns the interrupt lines raised this step.
    pub fn tick_peripherals(&mut self) -> Vec<u32> {
        let mut lines = Vec::new();
        for p in &mut self.peripherals {
            if p.dev.tick() {
                if let Some(irq) = p.irq {
                    lines.push(irq);
                }
            }
        }
        lines
    }

    pub fn peripheral<T: 'static>(&self, name: &str) -> Option<&T> {
        self.peripherals
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.dev.as_any())
            .and_then(|any| any.downcast_ref::<T>())
    }

    pub fn peripheral_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        self.peripherals
            .iter_mut()
            .find(|p| p.name == name)
            .and_then(|p| p.dev.as_any_mut())
            .and_then(|any| any.downcast_mut::<T>())
    }
}

impl crate::Bus for SystemBus {
    fn read_u32(&mut self, addr: u64) -> SimResult<u32> {
        let (entry, offset) = self.find_peripheral(addr)?;
        entry.dev.read(offset)
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()> {
        let (entry, offset) = self.find_peripheral(addr)?;
        entry.dev.write(offset, value)
    }
}
