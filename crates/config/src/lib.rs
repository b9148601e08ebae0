use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Register window of a UART Lite core.
pub const UARTLITE_REGION_SIZE: u64 = 0x10;
/// Register window of an interrupt controller core.
pub const INTC_REGION_SIZE: u64 = 0x20;
/// Widest interrupt controller supported (one ISR word).
pub const MAX_INTC_INPUTS: u32 = 32;
/// Longest UART frame: start, 8 data, parity, stop.
pub const MAX_FRAME_BITS: u32 = 11;

fn default_ticks_per_bit() -> u32 {
    1
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_num_inputs() -> u32 {
    MAX_INTC_INPUTS
}

/// Fault injection knobs for a simulated UART Lite.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UartFaults {
    /// Status bits that always read back as set.
    #[serde(default)]
    pub stuck_status: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UartLiteDescriptor {
    pub id: String,
    pub device_id: u16,
    pub base_address: u64,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub use_parity: bool,
    #[serde(default)]
    pub odd_parity: bool,
    /// Input line on the root interrupt controller.
    #[serde(default)]
    pub irq: Option<u32>,
    /// Wire TX back into RX, like a jumpered PMOD.
    #[serde(default)]
    pub loopback: bool,
    #[serde(default)]
    pub faults: UartFaults,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IntcDescriptor {
    pub id: String,
    pub device_id: u16,
    pub base_address: u64,
    #[serde(default = "default_num_inputs")]
    pub num_inputs: u32,
}

/// Hardware description of a board: which UART Lite and interrupt
/// controller cores exist and where they are mapped.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BoardDescriptor {
    pub name: String,
    /// Simulation steps per UART bit period.
    #[serde(default = "default_ticks_per_bit")]
    pub ticks_per_bit: u32,
    #[serde(default)]
    pub uartlite: Vec<UartLiteDescriptor>,
    #[serde(default)]
    pub intc: Vec<IntcDescriptor>,
}

impl Default for BoardDescriptor {
    /// MicroBlaze reference design: UART Lite 0 on INTC 0, input 0, with the
    /// RS485 PMOD jumpered for loopback.
    fn default() -> Self {
        Self {
            name: "microblaze-uartlite".to_string(),
            ticks_per_bit: default_ticks_per_bit(),
            uartlite: vec![UartLiteDescriptor {
                id: "uartlite0".to_string(),
                device_id: 0,
                base_address: 0x4060_0000,
                baud_rate: default_baud_rate(),
                data_bits: default_data_bits(),
                use_parity: false,
                odd_parity: false,
                irq: Some(0),
                loopback: true,
                faults: UartFaults::default(),
            }],
            intc: vec![IntcDescriptor {
                id: "intc0".to_string(),
                device_id: 0,
                base_address: 0x4120_0000,
                num_inputs: default_num_inputs(),
            }],
        }
    }
}

impl BoardDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open board descriptor at {:?}", path.as_ref()))?;
        let board: Self =
            serde_yaml::from_reader(f).context("Failed to parse Board Descriptor")?;
        board.validate()?;
        Ok(board)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Board 'name' cannot be empty");
        }

        if self.ticks_per_bit == 0 {
            anyhow::bail!("'ticks_per_bit' must be greater than zero");
        }
        if self.ticks_per_bit.checked_mul(MAX_FRAME_BITS).is_none() {
            anyhow::bail!("'ticks_per_bit' {} is too large", self.ticks_per_bit);
        }

        let mut uart_ids = HashSet::new();
        for uart in &self.uartlite {
            if !uart_ids.insert(uart.device_id) {
                anyhow::bail!("Duplicate UART Lite device_id {}", uart.device_id);
            }
            if !(5..=8).contains(&uart.data_bits) {
                anyhow::bail!(
                    "UART Lite '{}': data_bits must be 5..=8, got {}",
                    uart.id,
                    uart.data_bits
                );
            }
            if uart.baud_rate == 0 {
                anyhow::bail!("UART Lite '{}': baud_rate must be greater than zero", uart.id);
            }
        }

        let mut intc_ids = HashSet::new();
        for intc in &self.intc {
            if !intc_ids.insert(intc.device_id) {
                anyhow::bail!("Duplicate interrupt controller device_id {}", intc.device_id);
            }
            if intc.num_inputs == 0 || intc.num_inputs > MAX_INTC_INPUTS {
                anyhow::bail!(
                    "Interrupt controller '{}': num_inputs must be 1..={}, got {}",
                    intc.id,
                    MAX_INTC_INPUTS,
                    intc.num_inputs
                );
            }
        }

        // Lines are routed to the first controller only.
        let root_inputs = self.intc.first().map(|i| i.num_inputs);
        for uart in &self.uartlite {
            if let Some(irq) = uart.irq {
                match root_inputs {
                    None => anyhow::bail!(
                        "UART Lite '{}' uses irq {} but the board has no interrupt controller",
                        uart.id,
                        irq
                    ),
                    Some(n) if irq >= n => anyhow::bail!(
                        "UART Lite '{}': irq {} out of range (controller has {} inputs)",
                        uart.id,
                        irq,
                        n
                    ),
                    _ => {}
                }
            }
        }

        let mut regions: Vec<(&str, u64, u64)> = self
            .uartlite
            .iter()
            .map(|u| (u.id.as_str(), u.base_address, UARTLITE_REGION_SIZE))
            .chain(
                self.intc
                    .iter()
                    .map(|i| (i.id.as_str(), i.base_address, INTC_REGION_SIZE)),
            )
            .collect();
        for (id, base, size) in &regions {
            if base.checked_add(*size).is_none() {
                anyhow::bail!(
                    "Register window of '{}' at {:#x} runs past the address space",
                    id,
                    base
                );
            }
        }
        regions.sort_by_key(|r| r.1);
        for pair in regions.windows(2) {
            let (a_id, a_base, a_size) = pair[0];
            let (b_id, b_base, _) = pair[1];
            if a_base.saturating_add(a_size) > b_base {
                anyhow::bail!(
                    "Register windows of '{}' ({:#x}) and '{}' ({:#x}) overlap",
                    a_id,
                    a_base,
                    b_id,
                    b_base
                );
            }
        }

        Ok(())
    }
}
