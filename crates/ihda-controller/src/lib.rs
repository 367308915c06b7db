//! Intel HD Audio controller driver core.
//!
//! This crate drives the bus-controller half of an HDA sound device: it
//! claims the PCI device, programs the CORB/RIRB command rings and the
//! stream DMA engines, runs a dedicated interrupt worker, and multiplexes a
//! fixed pool of hardware stream contexts among clients. The surrounding
//! device framework supplies registers, interrupts, DMA memory, and client
//! channels through the traits in [`ddk`].

mod controller;
pub mod ddk;
pub mod dispatch;
pub mod dma;
pub mod error;
pub mod mmio;
pub mod ring;
pub mod stream;
pub mod testing;
mod worker;

pub use controller::{
    driver_init, CodecResponseHandler, CodecWakeHandler, DeviceCookie, HdaClient,
    HdaController, State, StreamCompletionHandler,
};
pub use error::HdaError;
