//! # coresight-dap
//!
//! A transport for the ARM CoreSight Debug Access Port (DAP).
//!
//! The crate implements the Debug Port (DP) and Memory Access Port (MEM-AP) register
//! protocol on top of one of several raw register backends:
//!
//! - a JTAG-DP driver issuing DPACC/APACC scans through a [`JtagAccess`] bit driver,
//! - an SWD driver issuing packet requests through an [`SwdAccess`] line driver,
//! - the native AP/DP register calls of a J-Link probe ([`JlinkDap`]).
//!
//! All of them are unified behind [`CoresightTransport`], which resolves MEM-AP
//! connections by index and exposes memory and core register access.
//!
//! ```no_run
//! use coresight_dap::{ApSelector, ConnectionId, CoresightTransport};
//! # fn probe() -> Box<dyn coresight_dap::RawDapAccess> { unimplemented!() }
//!
//! let mut transport = CoresightTransport::new(probe());
//! let conn = ConnectionId::new(ApSelector::ahb(0));
//! let bytes = transport.memory_read(&conn, 0x2000_0000, 0x2000_0010)?;
//! # Ok::<(), coresight_dap::Error>(())
//! ```
//!
//! [`JtagAccess`]: probe::jtag::JtagAccess
//! [`SwdAccess`]: probe::swd::SwdAccess
//! [`JlinkDap`]: probe::jlink::JlinkDap

#![warn(missing_docs)]

pub mod ap;
pub mod config;
pub mod dp;
mod error;
pub mod memory;
pub mod probe;
pub mod register;
pub mod transport;

pub use crate::ap::{ApClass, ApLayout, ApType};
pub use crate::config::{ProbeSelector, ScanChain, TargetSelect, TransportConfig, WireProtocol};
pub use crate::dp::{ChipVersion, DebugPort, DebugPortVersion};
pub use crate::error::{DapError, Error};
pub use crate::memory::{BusyCheck, MemAp};
pub use crate::probe::{PortType, RawDapAccess};
pub use crate::transport::{
    ApDetails, ApExtraDetails, ApSelector, ConnectionId, CorePeripheral, CoreStatus,
    CoresightTransport, RunControl,
};
