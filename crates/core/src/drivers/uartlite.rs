//! Interrupt-driven UART Lite driver.
//!
//! `send` and `recv` take ownership of a [`Transfer`], prime the FIFO and
//! return immediately. The interrupt handler moves the rest of the data and
//! reports the cumulative byte count to the registered completion handler.
//! Once a transfer completes its buffer is handed back through
//! [`UartLiteDriver::reclaim`].

use super::{DeviceTable, DriverError, DriverResult};
use crate::peripherals::uartlite::{Control, Status, CTRL, RX_FIFO, STAT, TX_FIFO};
use crate::transfer::{Direction, Transfer};
use crate::{Bus, SimResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Completion handler: receives the cumulative byte count of the active
/// transfer. Runs in interrupt context with the driver locked, so it must
/// not call back into the driver.
pub type CompletionHandler = Box<dyn FnMut(usize) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartLiteConfig {
    pub device_id: u16,
    pub base_address: u64,
    pub baud_rate: u32,
    pub use_parity: bool,
    pub odd_parity: bool,
    pub data_bits: u8,
    pub interrupt_line: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartLiteStats {
    pub transmit_interrupts: u32,
    pub receive_interrupts: u32,
    pub characters_transmitted: u32,
    pub characters_received: u32,
    pub receive_overrun_errors: u32,
    pub receive_parity_errors: u32,
    pub receive_framing_errors: u32,
}

impl UartLiteStats {
    fn record_errors(&mut self, status: Status) {
        if status.contains(Status::OVERRUN) {
            self.receive_overrun_errors += 1;
        }
        if status.contains(Status::PARITY_ERROR) {
            self.receive_parity_errors += 1;
        }
        if status.contains(Status::FRAME_ERROR) {
            self.receive_framing_errors += 1;
        }
    }
}

struct InFlight {
    transfer: Transfer,
    remaining: usize,
}

impl InFlight {
    fn new(transfer: Transfer) -> Self {
        let remaining = transfer.requested_length();
        Self {
            transfer,
            remaining,
        }
    }

    fn completed(&self) -> usize {
        self.transfer.requested_length() - self.remaining
    }
}

#[derive(Default)]
struct Inner {
    send: Option<InFlight>,
    recv: Option<InFlight>,
    send_done: Option<Transfer>,
    recv_done: Option<Transfer>,
    send_handler: Option<CompletionHandler>,
    recv_handler: Option<CompletionHandler>,
    stats: UartLiteStats,
    intr_enabled: bool,
}

/// Handle to one UART Lite instance. Clones share the same instance, which
/// is how the interrupt controller's vector table and the foreground both
/// reach it.
#[derive(Clone)]
pub struct UartLiteDriver {
    config: UartLiteConfig,
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for UartLiteDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("UartLiteDriver")
            .field("config", &self.config)
            .field("sending", &inner.send.is_some())
            .field("receiving", &inner.recv.is_some())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl UartLiteDriver {
    pub fn lookup_config(table: &DeviceTable, device_id: u16) -> Option<&UartLiteConfig> {
        table.uartlite.iter().find(|c| c.device_id == device_id)
    }

    /// Bind a driver instance to the device and bring it to a known state:
    /// FIFOs reset, interrupts disabled, no transfers.
    pub fn initialize(bus: &mut dyn Bus, config: &UartLiteConfig) -> DriverResult<Self> {
        bus.write_u32(
            config.base_address + CTRL,
            (Control::RST_TX | Control::RST_RX).bits(),
        )?;
        tracing::info!(
            "UART Lite {} at {:#x}: {} baud, {} data bits",
            config.device_id,
            config.base_address,
            config.baud_rate,
            config.data_bits
        );
        Ok(Self {
            config: config.clone(),
            inner: Arc::new(Mutex::new(Inner::default())),
        })
    }

    pub fn config(&self) -> &UartLiteConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reg(&self, offset: u64) -> u64 {
        self.config.base_address + offset
    }

    fn write_ctrl(&self, bus: &mut dyn Bus, ctrl: Control) -> SimResult<()> {
        bus.write_u32(self.reg(CTRL), ctrl.bits())
    }

    fn intr_ctrl(enabled: bool) -> Control {
        if enabled {
            Control::ENABLE_INTR
        } else {
            Control::empty()
        }
    }

    /// Reset both FIFOs and check the status register reads back as idle.
    /// Leaves interrupts disabled, like the reset does.
    pub fn self_test(&self, bus: &mut dyn Bus) -> DriverResult<()> {
        self.write_ctrl(bus, Control::RST_TX | Control::RST_RX)?;
        self.lock().intr_enabled = false;
        let status = Status::from_bits_truncate(bus.read_u32(self.reg(STAT))?);
        let idle = Status::RX_VALID | Status::RX_FULL | Status::TX_EMPTY | Status::TX_FULL;
        if status & idle != Status::TX_EMPTY {
            tracing::warn!("UART Lite {} self test failed: {:?}", self.config.device_id, status);
            return Err(DriverError::SelfTestFailed {
                status: status.bits(),
            });
        }
        Ok(())
    }

    pub fn set_send_handler<F>(&self, handler: F)
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.lock().send_handler = Some(Box::new(handler));
    }

    pub fn set_recv_handler<F>(&self, handler: F)
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.lock().recv_handler = Some(Box::new(handler));
    }

    pub fn enable_interrupt(&self, bus: &mut dyn Bus) -> DriverResult<()> {
        self.write_ctrl(bus, Control::ENABLE_INTR)?;
        self.lock().intr_enabled = true;
        Ok(())
    }

    pub fn disable_interrupt(&self, bus: &mut dyn Bus) -> DriverResult<()> {
        self.write_ctrl(bus, Control::empty())?;
        self.lock().intr_enabled = false;
        Ok(())
    }

    pub fn reset_fifos(&self, bus: &mut dyn Bus) -> DriverResult<()> {
        let enabled = self.lock().intr_enabled;
        self.write_ctrl(
            bus,
            Control::RST_TX | Control::RST_RX | Self::intr_ctrl(enabled),
        )?;
        Ok(())
    }

    /// True while the TX FIFO still holds bytes.
    pub fn is_sending(&self, bus: &mut dyn Bus) -> DriverResult<bool> {
        let status = Status::from_bits_truncate(bus.read_u32(self.reg(STAT))?);
        self.lock().stats.record_errors(status);
        Ok(!status.contains(Status::TX_EMPTY))
    }

    /// Start sending `transfer`. Returns how many bytes went straight into
    /// the TX FIFO; the rest follow from the interrupt handler. A completed
    /// send that was never reclaimed is dropped.
    pub fn send(&self, bus: &mut dyn Bus, transfer: Transfer) -> DriverResult<usize> {
        if transfer.direction() != Direction::Send {
            return Err(DriverError::DirectionMismatch {
                expected: Direction::Send,
                got: transfer.direction(),
            });
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.send.is_some() {
            return Err(DriverError::Busy(Direction::Send));
        }

        // Keep the TX-empty interrupt out while the buffer is set up.
        self.write_ctrl(bus, Control::empty())?;
        let mut flight = InFlight::new(transfer);
        let written = self.fill_tx(bus, &mut flight, &mut inner.stats)?;
        tracing::debug!(
            "UART Lite {}: send {} bytes, {} queued",
            self.config.device_id,
            flight.transfer.requested_length(),
            written
        );
        self.drop_unreclaimed(&mut inner.send_done, Direction::Send);
        if flight.transfer.requested_length() == 0 {
            inner.send_done = Some(flight.transfer);
        } else {
            inner.send = Some(flight);
        }
        self.write_ctrl(bus, Self::intr_ctrl(inner.intr_enabled))?;
        Ok(written)
    }

    /// Start receiving into `transfer`. Bytes already waiting in the RX FIFO
    /// are taken immediately and reported to the receive handler; the
    /// return value is that count.
    pub fn recv(&self, bus: &mut dyn Bus, transfer: Transfer) -> DriverResult<usize> {
        if transfer.direction() != Direction::Receive {
            return Err(DriverError::DirectionMismatch {
                expected: Direction::Receive,
                got: transfer.direction(),
            });
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.recv.is_some() {
            return Err(DriverError::Busy(Direction::Receive));
        }

        self.write_ctrl(bus, Control::empty())?;
        let mut flight = InFlight::new(transfer);
        let got = self.drain_rx(bus, &mut flight, &mut inner.stats)?;
        let count = flight.completed();
        self.drop_unreclaimed(&mut inner.recv_done, Direction::Receive);
        if flight.remaining == 0 {
            inner.recv_done = Some(flight.transfer);
        } else {
            inner.recv = Some(flight);
        }
        if got > 0 {
            if let Some(handler) = inner.recv_handler.as_mut() {
                handler(count);
            }
        }
        self.write_ctrl(bus, Self::intr_ctrl(inner.intr_enabled))?;
        Ok(got)
    }

    fn drop_unreclaimed(&self, slot: &mut Option<Transfer>, direction: Direction) {
        if let Some(stale) = slot.take() {
            tracing::debug!(
                "UART Lite {}: dropping unreclaimed {} buffer of {} bytes",
                self.config.device_id,
                direction,
                stale.requested_length()
            );
        }
    }

    /// Hand back the buffer of the last completed transfer in `direction`.
    pub fn reclaim(&self, direction: Direction) -> Option<Transfer> {
        let mut inner = self.lock();
        match direction {
            Direction::Send => inner.send_done.take(),
            Direction::Receive => inner.recv_done.take(),
        }
    }

    pub fn stats(&self) -> UartLiteStats {
        self.lock().stats
    }

    pub fn clear_stats(&self) {
        self.lock().stats = UartLiteStats::default();
    }

    /// Service the device. Connected to the interrupt controller line.
    pub fn interrupt_handler(&self, bus: &mut dyn Bus) -> SimResult<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let status = Status::from_bits_truncate(bus.read_u32(self.reg(STAT))?);
        inner.stats.record_errors(status);
        tracing::trace!("UART Lite {}: irq status {:?}", self.config.device_id, status);

        if status.intersects(Status::RX_VALID | Status::RX_FULL) {
            self.receive_data(bus, inner)?;
        }
        if status.contains(Status::TX_EMPTY) && inner.send.is_some() {
            self.send_data(bus, inner)?;
        }
        Ok(())
    }

    fn receive_data(&self, bus: &mut dyn Bus, inner: &mut Inner) -> SimResult<()> {
        inner.stats.receive_interrupts += 1;
        let Some(flight) = inner.recv.as_mut() else {
            // Nobody is receiving; data stays in the FIFO for the next recv.
            return Ok(());
        };

        let got = self.drain_rx(bus, flight, &mut inner.stats)?;
        if got == 0 {
            return Ok(());
        }
        let count = flight.completed();
        if flight.remaining == 0 {
            inner.recv_done = inner.recv.take().map(|f| f.transfer);
        }
        if let Some(handler) = inner.recv_handler.as_mut() {
            handler(count);
        }
        Ok(())
    }

    fn send_data(&self, bus: &mut dyn Bus, inner: &mut Inner) -> SimResult<()> {
        inner.stats.transmit_interrupts += 1;
        let Some(flight) = inner.send.as_mut() else {
            return Ok(());
        };

        // The FIFO is empty, so everything written so far is on the wire.
        let sent = flight.completed();
        if flight.remaining == 0 {
            inner.send_done = inner.send.take().map(|f| f.transfer);
        } else {
            self.fill_tx(bus, flight, &mut inner.stats)?;
        }
        if let Some(handler) = inner.send_handler.as_mut() {
            handler(sent);
        }
        Ok(())
    }

    fn fill_tx(
        &self,
        bus: &mut dyn Bus,
        flight: &mut InFlight,
        stats: &mut UartLiteStats,
    ) -> SimResult<usize> {
        let mut written = 0;
        while flight.remaining > 0 {
            let status = Status::from_bits_truncate(bus.read_u32(self.reg(STAT))?);
            stats.record_errors(status);
            if status.contains(Status::TX_FULL) {
                break;
            }
            let byte = flight.transfer.buffer()[flight.completed()];
            bus.write_u32(self.reg(TX_FIFO), u32::from(byte))?;
            flight.remaining -= 1;
            written += 1;
        }
        stats.characters_transmitted += written as u32;
        Ok(written)
    }

    fn drain_rx(
        &self,
        bus: &mut dyn Bus,
        flight: &mut InFlight,
        stats: &mut UartLiteStats,
    ) -> SimResult<usize> {
        let mut got = 0;
        while flight.remaining > 0 {
            let status = Status::from_bits_truncate(bus.read_u32(self.reg(STAT))?);
            stats.record_errors(status);
            if !status.contains(Status::RX_VALID) {
                break;
            }
            let byte = bus.read_u32(self.reg(RX_FIFO))? as u8;
            let index = flight.completed();
            flight.transfer.buffer_mut()[index] = byte;
            flight.remaining -= 1;
            got += 1;
        }
        stats.characters_received += got as u32;
        Ok(got)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SystemBus;
    use crate::peripherals::uartlite::{UartLite, FIFO_DEPTH};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: u64 = 0x4060_0000;

    fn setup(loopback: bool) -> (SystemBus, UartLiteDriver) {
        let mut descriptor = uartlite_config::BoardDescriptor::default();
        descriptor.uartlite[0].loopback = loopback;
        let mut bus = SystemBus::from_config(&descriptor);
        let table = DeviceTable::from_config(&descriptor);
        let config = UartLiteDriver::lookup_config(&table, 0).unwrap().clone();
        let driver = UartLiteDriver::initialize(&mut bus, &config).unwrap();
        (bus, driver)
    }

    /// Tick the UART and call the handler whenever it raises its output,
    /// standing in for the interrupt controller.
    fn pump(bus: &mut SystemBus, driver: &UartLiteDriver, steps: usize) {
        for _ in 0..steps {
            if !bus.tick_peripherals().is_empty() {
                driver.interrupt_handler(bus).unwrap();
            }
        }
    }

    fn uart(bus: &mut SystemBus) -> &mut UartLite {
        bus.peripheral_mut::<UartLite>("uartlite0").unwrap()
    }

    #[test]
    fn test_lookup_missing_device() {
        let table = DeviceTable::default();
        assert!(UartLiteDriver::lookup_config(&table, 0).is_none());
    }

    #[test]
    fn test_self_test_passes_on_idle_device() {
        let (mut bus, driver) = setup(false);
        driver.self_test(&mut bus).unwrap();
    }

    #[test]
    fn test_self_test_fails_with_stuck_rx() {
        let (mut bus, driver) = setup(false);
        uart(&mut bus).set_stuck_status(Status::RX_VALID.bits());
        let err = driver.self_test(&mut bus).unwrap_err();
        assert!(matches!(err, DriverError::SelfTestFailed { .. }));
    }

    #[test]
    fn test_send_reports_progress_and_completes() {
        let (mut bus, driver) = setup(false);
        let counts = Arc::new(Mutex::new(Vec::new()));
        let seen = counts.clone();
        driver.set_send_handler(move |n| seen.lock().unwrap().push(n));
        driver.enable_interrupt(&mut bus).unwrap();

        let pattern: Vec<u8> = (0..40).collect();
        let queued = driver.send(&mut bus, Transfer::send(pattern.clone())).unwrap();
        assert_eq!(queued, FIFO_DEPTH);
        assert!(driver.is_sending(&mut bus).unwrap());

        let ticks = uart(&mut bus).ticks_per_byte() as usize;
        pump(&mut bus, &driver, ticks * (pattern.len() + 1));

        assert_eq!(uart(&mut bus).transmitted(), pattern.as_slice());
        assert_eq!(*counts.lock().unwrap(), vec![16, 32, 40]);
        let done = driver.reclaim(Direction::Send).unwrap();
        assert_eq!(done.buffer(), pattern.as_slice());
        assert!(driver.reclaim(Direction::Send).is_none());

        let stats = driver.stats();
        assert_eq!(stats.characters_transmitted, 40);
        assert_eq!(stats.transmit_interrupts, 3);
    }

    #[test]
    fn test_second_send_while_busy_rejected() {
        let (mut bus, driver) = setup(false);
        driver.send(&mut bus, Transfer::send(vec![1, 2, 3])).unwrap();
        let err = driver.send(&mut bus, Transfer::send(vec![4])).unwrap_err();
        assert!(matches!(err, DriverError::Busy(Direction::Send)));
    }

    #[test]
    fn test_direction_mismatch() {
        let (mut bus, driver) = setup(false);
        let err = driver.send(&mut bus, Transfer::receive(2)).unwrap_err();
        assert!(matches!(
            err,
            DriverError::DirectionMismatch {
                expected: Direction::Send,
                got: Direction::Receive
            }
        ));
    }

    #[test]
    fn test_receive_injected_bytes() {
        let (mut bus, driver) = setup(false);
        let last = Arc::new(AtomicUsize::new(0));
        let seen = last.clone();
        driver.set_recv_handler(move |n| seen.store(n, Ordering::SeqCst));
        driver.enable_interrupt(&mut bus).unwrap();

        assert_eq!(driver.recv(&mut bus, Transfer::receive(3)).unwrap(), 0);
        uart(&mut bus).inject_rx(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let ticks = uart(&mut bus).ticks_per_byte() as usize;
        pump(&mut bus, &driver, ticks * 4);

        assert_eq!(last.load(Ordering::SeqCst), 3);
        let done = driver.reclaim(Direction::Receive).unwrap();
        assert_eq!(done.buffer(), &[0xAA, 0xBB, 0xCC]);
        // The extra byte waits in the FIFO for the next receive.
        assert_eq!(driver.recv(&mut bus, Transfer::receive(1)).unwrap(), 1);
        assert_eq!(last.load(Ordering::SeqCst), 1);
        assert_eq!(driver.reclaim(Direction::Receive).unwrap().buffer(), &[0xDD]);
    }

    #[test]
    fn test_loopback_round_trip() {
        let (mut bus, driver) = setup(true);
        driver.enable_interrupt(&mut bus).unwrap();
        let pattern = vec![0x56, 0x00, 0x36, 0x01, 0x00];
        driver.recv(&mut bus, Transfer::receive(pattern.len())).unwrap();
        driver.send(&mut bus, Transfer::send(pattern.clone())).unwrap();

        let ticks = uart(&mut bus).ticks_per_byte() as usize;
        pump(&mut bus, &driver, ticks * (pattern.len() + 1));

        assert!(driver.reclaim(Direction::Send).is_some());
        assert_eq!(
            driver.reclaim(Direction::Receive).unwrap().into_buffer(),
            pattern
        );
    }

    #[test]
    fn test_zero_length_send_completes_immediately() {
        let (mut bus, driver) = setup(false);
        assert_eq!(driver.send(&mut bus, Transfer::send(Vec::new())).unwrap(), 0);
        assert!(driver.reclaim(Direction::Send).is_some());
        // Not busy afterwards.
        driver.send(&mut bus, Transfer::send(vec![1])).unwrap();
    }

    #[test]
    fn test_send_preserves_interrupt_enable() {
        let (mut bus, driver) = setup(false);
        driver.enable_interrupt(&mut bus).unwrap();
        driver.send(&mut bus, Transfer::send(vec![1])).unwrap();
        let status = Status::from_bits_truncate(bus.read_u32(BASE + STAT).unwrap());
        assert!(status.contains(Status::INTR_ENABLED));
    }

    #[test]
    fn test_unreclaimed_send_replaced() {
        let (mut bus, driver) = setup(false);
        driver.enable_interrupt(&mut bus).unwrap();
        driver.send(&mut bus, Transfer::send(vec![1, 2])).unwrap();
        let ticks = uart(&mut bus).ticks_per_byte() as usize;
        pump(&mut bus, &driver, ticks * 3);

        driver.send(&mut bus, Transfer::send(Vec::new())).unwrap();
        assert!(driver.reclaim(Direction::Send).unwrap().buffer().is_empty());
        assert!(driver.reclaim(Direction::Send).is_none());
    }

    #[test]
    fn test_reset_fifos_keeps_interrupt_enable() {
        let (mut bus, driver) = setup(false);
        driver.enable_interrupt(&mut bus).unwrap();
        uart(&mut bus).inject_rx(&[0x11, 0x22]);
        let ticks = uart(&mut bus).ticks_per_byte() as usize;
        // No receive is armed, so the bytes stay in the FIFO.
        pump(&mut bus, &driver, ticks * 2);
        bus.write_u32(BASE + TX_FIFO, 0x55).unwrap();
        let status = uart(&mut bus).status();
        assert!(status.contains(Status::RX_VALID));
        assert!(!status.contains(Status::TX_EMPTY));

        driver.reset_fifos(&mut bus).unwrap();
        let status = Status::from_bits_truncate(bus.read_u32(BASE + STAT).unwrap());
        assert_eq!(status, Status::TX_EMPTY | Status::INTR_ENABLED);
    }

    #[test]
    fn test_disable_interrupt_silences_line() {
        let (mut bus, driver) = setup(false);
        driver.enable_interrupt(&mut bus).unwrap();
        driver.disable_interrupt(&mut bus).unwrap();
        uart(&mut bus).inject_rx(&[0x42]);
        let ticks = uart(&mut bus).ticks_per_byte() as usize;
        for _ in 0..ticks * 2 {
            assert!(bus.tick_peripherals().is_empty());
        }
        let status = uart(&mut bus).status();
        assert!(status.contains(Status::RX_VALID));
        assert!(!status.contains(Status::INTR_ENABLED));

        // Re-enabled, the next arrival into an empty FIFO raises the line.
        bus.read_u32(BASE + RX_FIFO).unwrap();
        driver.enable_interrupt(&mut bus).unwrap();
        uart(&mut bus).inject_rx(&[0x43]);
        let raised = (0..ticks).any(|_| !bus.tick_peripherals().is_empty());
        assert!(raised);
    }

    #[test]
    fn test_overrun_counted() {
        let (mut bus, driver) = setup(false);
        let bytes: Vec<u8> = (0..(FIFO_DEPTH as u8 + 1)).collect();
        uart(&mut bus).inject_rx(&bytes);
        let ticks = uart(&mut bus).ticks_per_byte() as usize;
        pump(&mut bus, &driver, ticks * bytes.len());
        assert!(!driver.is_sending(&mut bus).unwrap());
        assert_eq!(driver.stats().receive_overrun_errors, 1);
        driver.clear_stats();
        assert_eq!(driver.stats(), UartLiteStats::default());
    }
}
