use crate::{Peripheral, SimResult};
use bitflags::bitflags;
use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const ISR: u64 = 0x00;
pub const IPR: u64 = 0x04;
pub const IER: u64 = 0x08;
pub const IAR: u64 = 0x0C;
pub const SIE: u64 = 0x10;
pub const CIE: u64 = 0x14;
pub const IVR: u64 = 0x18;
pub const MER: u64 = 0x1C;

/// IVR value when nothing is pending.
pub const NO_VECTOR: u32 = 0xFFFF_FFFF;

bitflags! {
    /// Master Enable Register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MasterEnable: u32 {
        /// Drive the processor interrupt output.
        const ME = 1 << 0;
        /// Latch hardware inputs; locks out software ISR writes.
        const HIE = 1 << 1;
    }
}

/// Shared state for the controller registers. Peripherals raise lines into
/// it from the board's tick path; the register model and drivers see the
/// same words.
#[derive(Debug)]
pub struct IntcState {
    pub isr: AtomicU32,
    pub ier: AtomicU32,
    pub mer: AtomicU32,
    valid_mask: u32,
}

impl IntcState {
    pub fn new(num_inputs: u32) -> Self {
        let valid_mask = if num_inputs >= 32 {
            u32::MAX
        } else {
            (1u32 << num_inputs) - 1
        };
        Self {
            isr: AtomicU32::new(0),
            ier: AtomicU32::new(0),
            mer: AtomicU32::new(0),
            valid_mask,
        }
    }

    pub fn master_enable(&self) -> MasterEnable {
        MasterEnable::from_bits_truncate(self.mer.load(Ordering::SeqCst))
    }

    /// Latch a hardware input. Ignored until hardware interrupts are enabled.
    pub fn raise(&self, line: u32) {
        if line >= 32 || self.valid_mask & (1 << line) == 0 {
            tracing::warn!("INTC: ignoring raise of nonexistent input {}", line);
            return;
        }
        if self.master_enable().contains(MasterEnable::HIE) {
            self.isr.fetch_or(1 << line, Ordering::SeqCst);
        }
    }

    pub fn pending(&self) -> u32 {
        self.isr.load(Ordering::SeqCst) & self.ier.load(Ordering::SeqCst)
    }

    /// State of the controller's interrupt output to the processor.
    pub fn irq_asserted(&self) -> bool {
        self.master_enable().contains(MasterEnable::ME) && self.pending() != 0
    }
}

/// AXI-style interrupt controller register model.
#[derive(Debug, Clone)]
pub struct Intc {
    pub state: Arc<IntcState>,
}

impl Intc {
    pub fn new(state: Arc<IntcState>) -> Self {
        Self { state }
    }
}

impl Peripheral for Intc {
    fn read(&mut self, offset: u64) -> SimResult<u32> {
        let s = &self.state;
        let val = match offset {
            ISR => s.isr.load(Ordering::SeqCst),
            IPR => s.pending(),
            IER => s.ier.load(Ordering::SeqCst),
            IVR => {
                let pending = s.pending();
                if pending == 0 {
                    NO_VECTOR
                } else {
                    pending.trailing_zeros()
                }
            }
            MER => s.mer.load(Ordering::SeqCst),
            // IAR, SIE, CIE are write-only
            _ => 0,
        };
        Ok(val)
    }

    fn write(&mut self, offset: u64, value: u32) -> SimResult<()> {
        let s = &self.state;
        let value_masked = value & s.valid_mask;
        match offset {
            ISR => {
                if s.master_enable().contains(MasterEnable::HIE) {
                    tracing::debug!("INTC: ISR write ignored with HIE set");
                } else {
                    s.isr.fetch_or(value_masked, Ordering::SeqCst);
                    tracing::debug!("INTC: software ISR set {:#x}", value_masked);
                }
            }
            IER => s.ier.store(value_masked, Ordering::SeqCst),
            IAR => {
                s.isr.fetch_and(!value_masked, Ordering::SeqCst);
            }
            SIE => {
                s.ier.fetch_or(value_masked, Ordering::SeqCst);
                tracing::debug!("INTC: IER set to {:#x}", s.ier.load(Ordering::SeqCst));
            }
            CIE => {
                s.ier.fetch_and(!value_masked, Ordering::SeqCst);
                tracing::debug!("INTC: IER cleared to {:#x}", s.ier.load(Ordering::SeqCst));
            }
            MER => {
                // HIE is write-once: it stays set until reset.
                let current = s.master_enable();
                let mut next = MasterEnable::from_bits_truncate(value);
                if current.contains(MasterEnable::HIE) {
                    next |= MasterEnable::HIE;
                }
                s.mer.store(next.bits(), Ordering::SeqCst);
                tracing::debug!("INTC: MER = {:?}", next);
            }
            _ => {}
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "isr": self.state.isr.load(Ordering::SeqCst),
            "ier": self.state.ier.load(Ordering::SeqCst),
            "mer": self.state.mer.load(Ordering::SeqCst),
        })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intc() -> Intc {
        Intc::new(Arc::new(IntcState::new(8)))
    }

    #[test]
    fn test_hardware_lines_need_hie() {
        let mut intc = intc();
        intc.state.raise(2);
        assert_eq!(intc.read(ISR).unwrap(), 0);

        intc.write(MER, (MasterEnable::ME | MasterEnable::HIE).bits()).unwrap();
        intc.state.raise(2);
        assert_eq!(intc.read(ISR).unwrap(), 1 << 2);
        // Not enabled yet, so nothing is pending.
        assert_eq!(intc.read(IPR).unwrap(), 0);
        assert!(!intc.state.irq_asserted());

        intc.write(SIE, 1 << 2).unwrap();
        assert_eq!(intc.read(IPR).unwrap(), 1 << 2);
        assert_eq!(intc.read(IVR).unwrap(), 2);
        assert!(intc.state.irq_asserted());

        intc.write(IAR, 1 << 2).unwrap();
        assert_eq!(intc.read(IVR).unwrap(), NO_VECTOR);
        assert!(!intc.state.irq_asserted());
    }

    #[test]
    fn test_software_isr_writes_only_without_hie() {
        let mut intc = intc();
        intc.write(MER, MasterEnable::ME.bits()).unwrap();
        intc.write(ISR, 1 << 1).unwrap();
        assert_eq!(intc.read(ISR).unwrap(), 1 << 1);

        intc.write(IAR, 0xFF).unwrap();
        intc.write(MER, (MasterEnable::ME | MasterEnable::HIE).bits()).unwrap();
        intc.write(ISR, 1 << 1).unwrap();
        assert_eq!(intc.read(ISR).unwrap(), 0);
    }

    #[test]
    fn test_hie_is_sticky() {
        let mut intc = intc();
        intc.write(MER, (MasterEnable::ME | MasterEnable::HIE).bits()).unwrap();
        intc.write(MER, 0).unwrap();
        assert_eq!(intc.read(MER).unwrap(), MasterEnable::HIE.bits());
    }

    #[test]
    fn test_inputs_beyond_width_are_masked() {
        let mut intc = intc();
        intc.write(SIE, 0xFFFF).unwrap();
        assert_eq!(intc.read(IER).unwrap(), 0xFF);
        intc.write(CIE, 0x0F).unwrap();
        assert_eq!(intc.read(IER).unwrap(), 0xF0);
    }
}
