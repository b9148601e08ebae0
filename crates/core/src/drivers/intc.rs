use super::{DeviceTable, DriverError, DriverResult};
use crate::peripherals::intc::{MasterEnable, CIE, IAR, IER, IPR, ISR, MER, SIE};
use crate::{Bus, SimResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handler connected to an interrupt line.
pub type InterruptHandler = Box<dyn FnMut(&mut dyn Bus) -> SimResult<()> + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntcConfig {
    pub device_id: u16,
    pub base_address: u64,
    pub num_inputs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Only software-generated interrupts (`simulate_interrupt`).
    Simulation,
    /// Hardware inputs latch and drive the processor.
    Real,
}

/// Interrupt controller driver: owns the vector table and dispatches
/// pending lines to connected handlers.
pub struct IntcDriver {
    config: IntcConfig,
    vector_table: Vec<Option<InterruptHandler>>,
    mode: Option<StartMode>,
}

impl fmt::Debug for IntcDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connected: Vec<usize> = self
            .vector_table
            .iter()
            .enumerate()
            .filter_map(|(line, h)| h.as_ref().map(|_| line))
            .collect();
        f.debug_struct("IntcDriver")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("connected", &connected)
            .finish()
    }
}

impl IntcDriver {
    pub fn lookup_config(table: &DeviceTable, device_id: u16) -> Option<&IntcConfig> {
        table.intc.iter().find(|c| c.device_id == device_id)
    }

    /// Look up the controller and quiesce it: master enable off, every line
    /// disabled and acknowledged.
    pub fn initialize(
        bus: &mut dyn Bus,
        table: &DeviceTable,
        device_id: u16,
    ) -> DriverResult<Self> {
        let config = Self::lookup_config(table, device_id)
            .cloned()
            .ok_or(DriverError::DeviceNotFound {
                kind: "interrupt controller",
                device_id,
            })?;

        bus.write_u32(config.base_address + MER, 0)?;
        bus.write_u32(config.base_address + IER, 0)?;
        bus.write_u32(config.base_address + IAR, u32::MAX)?;

        tracing::info!(
            "INTC {} at {:#x} with {} inputs",
            config.device_id,
            config.base_address,
            config.num_inputs
        );
        let mut vector_table = Vec::new();
        vector_table.resize_with(config.num_inputs as usize, || None);
        Ok(Self {
            config,
            vector_table,
            mode: None,
        })
    }

    pub fn config(&self) -> &IntcConfig {
        &self.config
    }

    pub fn mode(&self) -> Option<StartMode> {
        self.mode
    }

    fn reg(&self, offset: u64) -> u64 {
        self.config.base_address + offset
    }

    fn check_line(&self, line: u32) -> DriverResult<u32> {
        if line >= self.config.num_inputs {
            return Err(DriverError::InvalidLine {
                line,
                inputs: self.config.num_inputs,
            });
        }
        Ok(1 << line)
    }

    pub fn connect<F>(&mut self, line: u32, handler: F) -> DriverResult<()>
    where
        F: FnMut(&mut dyn Bus) -> SimResult<()> + Send + 'static,
    {
        self.check_line(line)?;
        self.vector_table[line as usize] = Some(Box::new(handler));
        tracing::debug!("INTC {}: handler connected to line {}", self.config.device_id, line);
        Ok(())
    }

    /// Disable the line and drop its handler.
    pub fn disconnect(&mut self, bus: &mut dyn Bus, line: u32) -> DriverResult<()> {
        self.disable(bus, line)?;
        self.vector_table[line as usize] = None;
        Ok(())
    }

    pub fn start(&mut self, bus: &mut dyn Bus, mode: StartMode) -> DriverResult<()> {
        if self.mode.is_some() {
            return Err(DriverError::AlreadyStarted);
        }
        let mer = match mode {
            StartMode::Simulation => MasterEnable::ME,
            StartMode::Real => MasterEnable::ME | MasterEnable::HIE,
        };
        bus.write_u32(self.reg(MER), mer.bits())?;
        self.mode = Some(mode);
        tracing::info!("INTC {} started in {:?} mode", self.config.device_id, mode);
        Ok(())
    }

    pub fn stop(&mut self, bus: &mut dyn Bus) -> DriverResult<()> {
        bus.write_u32(self.reg(MER), 0)?;
        self.mode = None;
        Ok(())
    }

    pub fn enable(&mut self, bus: &mut dyn Bus, line: u32) -> DriverResult<()> {
        let mask = self.check_line(line)?;
        bus.write_u32(self.reg(SIE), mask)?;
        Ok(())
    }

    pub fn disable(&mut self, bus: &mut dyn Bus, line: u32) -> DriverResult<()> {
        let mask = self.check_line(line)?;
        bus.write_u32(self.reg(CIE), mask)?;
        Ok(())
    }

    pub fn acknowledge(&mut self, bus: &mut dyn Bus, line: u32) -> DriverResult<()> {
        let mask = self.check_line(line)?;
        bus.write_u32(self.reg(IAR), mask)?;
        Ok(())
    }

    /// Raise `line` from software. Only possible before hardware interrupts
    /// are enabled, i.e. in simulation mode.
    pub fn simulate_interrupt(&mut self, bus: &mut dyn Bus, line: u32) -> DriverResult<()> {
        let mask = self.check_line(line)?;
        if self.mode != Some(StartMode::Simulation) {
            return Err(DriverError::NotSimulationMode);
        }
        bus.write_u32(self.reg(ISR), mask)?;
        Ok(())
    }

    /// Dispatch every pending line, lowest first, acknowledging each after
    /// its handler returns. Returns the mask of lines serviced.
    pub fn interrupt_handler(&mut self, bus: &mut dyn Bus) -> SimResult<u32> {
        let pending = bus.read_u32(self.reg(IPR))?;
        let mut serviced = 0;
        for (line, slot) in self.vector_table.iter_mut().enumerate() {
            let mask = 1u32 << line;
            if pending & mask == 0 {
                continue;
            }
            match slot.as_mut() {
                Some(handler) => handler(bus)?,
                None => tracing::warn!("INTC: spurious interrupt on line {}", line),
            }
            bus.write_u32(self.config.base_address + IAR, mask)?;
            serviced |= mask;
        }
        Ok(serviced)
    }
}
