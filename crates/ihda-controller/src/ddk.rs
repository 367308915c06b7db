//! Traits at the device-framework boundary.
//!
//! The surrounding device manager supplies the PCI protocol, the interrupt
//! object, DMA-capable memory, and client channels; it consumes the driver's
//! lifecycle hooks. Each seam is a trait so the framework (or a test fake)
//! can stand on the other side.

use std::sync::Arc;

use crate::dma::DmaRegion;
use crate::error::Result;
use crate::mmio::RegisterIo;

/// PCI identity of the bound device, captured at bind time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
}

/// Why the interrupt worker woke up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Wake {
    /// Hardware interrupt delivery; status registers need draining.
    Interrupt,
    /// Explicit shutdown signal from `unbind`.
    Shutdown,
}

/// The controller's interrupt object.
///
/// `wait` blocks until hardware raises the interrupt line or until
/// `trigger_shutdown` forces a wakeup; it is the only indefinitely-blocking
/// operation in the driver and is always interruptible by shutdown.
pub trait InterruptSource: Send + Sync {
    fn wait(&self) -> Result<Wake>;
    fn trigger_shutdown(&self);
}

/// A bidirectional message channel to one client.
///
/// `read` fills `buf` with exactly one inbound message and returns its
/// length. After `deactivate` returns, no dispatch callback is in flight and
/// no further read or write will succeed.
pub trait Channel: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, buf: &[u8]) -> Result<()>;
    fn deactivate(&self);
}

/// The PCI protocol handle obtained from the parent device.
pub trait PciProtocol: Send + Sync {
    fn device_info(&self) -> PciDeviceInfo;

    /// Map BAR0, the controller register window.
    fn map_registers(&self) -> Result<Arc<dyn RegisterIo>>;

    /// Claim the device interrupt.
    fn map_interrupt(&self) -> Result<Arc<dyn InterruptSource>>;

    /// Allocate pinned, physically-contiguous, DMA-capable memory.
    fn allocate_contiguous(&self, bytes: usize) -> Result<DmaRegion>;
}

/// The parent device handed to `bind`.
pub trait ParentDevice {
    fn pci_protocol(&self) -> Result<Arc<dyn PciProtocol>>;
}
