//! Userspace NVMe controller driver and in-process device simulator.
//!
//! This crate is layered the way a kernel NVMe driver is layered, just
//! hosted in userspace: a byte-addressable gateway at the bottom
//! ([`gateway`]), bitfield-accurate register overlays on top of it
//! ([`registers`]), a DMA memory subsystem ([`dma`]), the queue-pair and PRP
//! machinery NVMe commands ride on ([`queue`], `dma::prp`), the command
//! lifecycle and status-code registry ([`command`]), and the controller
//! state machine that ties bring-up, tear-down and the I/O path together
//! ([`controller`]). [`sim`] is a complete in-process device model
//! implementing the other end of the wire, so the whole stack can be
//! exercised without real hardware or a VFIO container.
//!
//! Nothing here opens a PCI device, maps a BAR, or talks to VFIO — those are
//! host responsibilities. [`gateway::ByteGateway`] and [`dma::DmaGateway`]
//! are the seams an external VFIO crate implements; this crate ships only
//! the in-memory implementations it uses for its own simulator and tests.

pub mod command;
pub mod controller;
pub mod dma;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod queue;
pub mod registers;
pub mod sim;

pub use controller::{Controller, ControllerConfig, ControllerState};
pub use error::{DriverError, Result};
pub use gateway::{ByteGateway, MmioRegion, RegisterIo, VecGateway};
