//! Support for J-Link probes through the vendor library.
//!
//! The library has native calls for single DP and AP register accesses and, in newer
//! versions, a call taking an array of access descriptors which runs a whole TAR/DRW
//! sequence in one round trip. Everything the crate needs from the library goes
//! through the [`JlinkApi`] trait.

mod error;
#[cfg(feature = "jlink-dll")]
pub mod ffi;

pub use error::JlinkError;

use bitvec::prelude::*;
use once_cell::sync::OnceCell;
use static_assertions::const_assert_eq;

use super::jtag::{JtagAccess, JtagDp};
use super::swd::{self, IoSequence, SwdAccess, SwdDp};
use super::{boundaries_crossed, PortType, RawDapAccess, DRW_INDEX, TAR_INDEX};
use crate::config::{ProbeSelector, TransportConfig, WireProtocol};
use crate::error::{DapError, Error};
use crate::memory::BusyCheck;

/// Maximum number of words submitted in one multi-access call.
pub const BLOCK_CHUNK_WORDS: usize = 1024;

/// Timeout of a read-until descriptor.
const READ_UNTIL_TIMEOUT_MS: i32 = 10;

static MISSING_MULTI_ACCESS: OnceCell<()> = OnceCell::new();

/// One access of a multi-access call, laid out as the library expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegDescriptor {
    /// Written value, or the read value after the call.
    pub data: u32,
    /// Mask for read-until accesses, zero otherwise.
    pub mask: u32,
    /// Expected masked value for read-until accesses.
    pub comp_val: u32,
    /// Per-access result, negative on failure.
    pub status: i32,
    /// Poll timeout of a read-until access.
    pub timeout_ms_read_until: i32,
    /// Register index, A[3:2].
    pub reg_index: u8,
    /// 1 for an AP access.
    pub ap_n_dp: u8,
    /// 1 for a read.
    pub r_n_w: u8,
}

const_assert_eq!(std::mem::size_of::<RegDescriptor>(), 24);

impl RegDescriptor {
    fn write_tar(address: u32) -> Self {
        RegDescriptor {
            data: address,
            reg_index: TAR_INDEX,
            ap_n_dp: 1,
            ..Default::default()
        }
    }

    fn write_drw(value: u32) -> Self {
        RegDescriptor {
            data: value,
            reg_index: DRW_INDEX,
            ap_n_dp: 1,
            ..Default::default()
        }
    }

    fn read_drw() -> Self {
        RegDescriptor {
            reg_index: DRW_INDEX,
            ap_n_dp: 1,
            r_n_w: 1,
            ..Default::default()
        }
    }

    fn read_drw_until(check: &BusyCheck) -> Self {
        RegDescriptor {
            mask: check.mask,
            comp_val: check.expected,
            timeout_ms_read_until: READ_UNTIL_TIMEOUT_MS,
            ..Self::read_drw()
        }
    }
}

/// The calls of the J-Link library this crate uses.
///
/// Register calls return the raw status code of the library: negative on failure,
/// positive if the target answered WAIT.
pub trait JlinkApi: std::fmt::Debug {
    /// Open a connection, to the probe chosen by `selector` if given.
    fn open(&mut self, selector: Option<&ProbeSelector>) -> Result<(), JlinkError>;

    /// Select the target interface.
    fn select_interface(&mut self, protocol: WireProtocol) -> Result<(), JlinkError>;

    /// Set the interface clock.
    fn set_speed(&mut self, speed_khz: u32) -> Result<(), JlinkError>;

    /// Configure the CoreSight DAP, `settings` describes the JTAG scan chain.
    fn coresight_configure(&mut self, settings: &str) -> Result<(), JlinkError>;

    /// Read DP or AP register `index`.
    fn read_apdp_reg(&mut self, index: u8, ap_n_dp: bool, value: &mut u32) -> i32;

    /// Write DP or AP register `index`.
    fn write_apdp_reg(&mut self, index: u8, ap_n_dp: bool, value: u32) -> i32;

    /// Whether the library exports the multi-access call.
    fn has_apdp_reg_multiple(&mut self) -> bool;

    /// Run all `descriptors` in one call.
    fn apdp_reg_multiple(&mut self, descriptors: &mut [RegDescriptor]) -> i32;

    /// Clock `num_bits` bits on SWDIO and return the sampled values, packed LSB first.
    fn swd_store_get_raw(
        &mut self,
        direction: &[u8],
        data: &[u8],
        num_bits: usize,
    ) -> Result<Vec<u8>, JlinkError>;

    /// Shift an instruction into the DAP's IR.
    fn jtag_store_inst(&mut self, tdi: &[u8], num_bits: usize) -> Result<(), JlinkError>;

    /// Shift data through the DAP's selected DR and return the captured bits.
    fn jtag_store_get_data(&mut self, tdi: &[u8], num_bits: usize)
        -> Result<Vec<u8>, JlinkError>;
}

fn drive_swd_line<A: JlinkApi + ?Sized>(
    api: &mut A,
    sequence: &IoSequence,
) -> Result<Vec<bool>, DapError> {
    let direction: BitVec<u8, Lsb0> = sequence.direction_bits().iter().copied().collect();
    let data: BitVec<u8, Lsb0> = sequence.io_bits().iter().copied().collect();
    let num_bits = sequence.len();

    let response = api.swd_store_get_raw(direction.as_raw_slice(), data.as_raw_slice(), num_bits)?;
    let bits = response.view_bits::<Lsb0>();
    if bits.len() < num_bits {
        return Err(DapError::ProbeSpecific(
            anyhow::anyhow!("Short SWD capture of {} bits", bits.len()).into(),
        ));
    }
    Ok(bits[..num_bits].iter().by_vals().collect())
}

/// DP and AP register access through the native calls of the library.
#[derive(Debug)]
pub struct JlinkDap<A> {
    api: A,
    multi_access: bool,
}

impl<A: JlinkApi> JlinkDap<A> {
    /// Wrap an opened and configured library.
    ///
    /// Whether block transfers are available is decided here, once.
    pub fn new(mut api: A) -> Self {
        let multi_access = api.has_apdp_reg_multiple();
        if !multi_access {
            MISSING_MULTI_ACCESS.get_or_init(|| {
                tracing::warn!(
                    "The J-Link library is too old for block transfers, \
                     memory access will be slow. Please update the J-Link software."
                );
            });
        }
        JlinkDap { api, multi_access }
    }

    /// Give up the library.
    pub fn into_inner(self) -> A {
        self.api
    }

    fn submit(&mut self, descriptors: &mut [RegDescriptor]) -> Result<(), DapError> {
        tracing::debug!("Submitting {} accesses to the J-Link", descriptors.len());
        let ret = self.api.apdp_reg_multiple(descriptors);
        let failed = descriptors.iter().find(|descriptor| descriptor.status < 0);

        if ret < 0 || failed.is_some() {
            let reg_index = failed.map_or(DRW_INDEX, |descriptor| descriptor.reg_index);
            return Err(DapError::AccessFailed {
                port: PortType::AccessPort,
                address: reg_index << 2,
            });
        }
        Ok(())
    }

    fn read_chunk(
        &mut self,
        start: u32,
        count: usize,
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<Vec<u32>, DapError> {
        let mut descriptors = Vec::new();
        let mut reads = Vec::with_capacity(count);

        match busy_check {
            None => {
                let end = start.wrapping_add(4 * count as u32);
                let boundaries = if autoinc { boundaries_crossed(start, end) } else { 0 };
                descriptors.reserve(count + boundaries + 1);

                descriptors.push(RegDescriptor::write_tar(start));
                for i in 0..count {
                    let address = start.wrapping_add(4 * i as u32);
                    if autoinc && i > 0 && address & 0x3ff == 0 {
                        descriptors.push(RegDescriptor::write_tar(address));
                    }
                    reads.push(descriptors.len());
                    descriptors.push(RegDescriptor::read_drw());
                }
            }
            Some(check) => {
                // Every word costs four accesses: point TAR at the status register,
                // poll it, point TAR back and read.
                descriptors.reserve(4 * count);
                for _ in 0..count {
                    descriptors.push(RegDescriptor::write_tar(check.address));
                    descriptors.push(RegDescriptor::read_drw_until(&check));
                    descriptors.push(RegDescriptor::write_tar(start));
                    reads.push(descriptors.len());
                    descriptors.push(RegDescriptor::read_drw());
                }
            }
        }

        self.submit(&mut descriptors)?;
        Ok(reads.into_iter().map(|i| descriptors[i].data).collect())
    }

    fn write_chunk(
        &mut self,
        start: u32,
        data: &[u32],
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<(), DapError> {
        let mut descriptors = Vec::new();

        match busy_check {
            None => {
                let end = start.wrapping_add(4 * data.len() as u32);
                let boundaries = if autoinc { boundaries_crossed(start, end) } else { 0 };
                descriptors.reserve(data.len() + boundaries + 1);

                descriptors.push(RegDescriptor::write_tar(start));
                for (i, value) in data.iter().enumerate() {
                    let address = start.wrapping_add(4 * i as u32);
                    if autoinc && i > 0 && address & 0x3ff == 0 {
                        descriptors.push(RegDescriptor::write_tar(address));
                    }
                    descriptors.push(RegDescriptor::write_drw(*value));
                }
            }
            Some(check) => {
                descriptors.reserve(4 * data.len());
                for value in data {
                    descriptors.push(RegDescriptor::write_tar(check.address));
                    descriptors.push(RegDescriptor::read_drw_until(&check));
                    descriptors.push(RegDescriptor::write_tar(start));
                    descriptors.push(RegDescriptor::write_drw(*value));
                }
            }
        }

        self.submit(&mut descriptors)
    }
}

impl<A: JlinkApi> RawDapAccess for JlinkDap<A> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
        let mut value = 0;
        let ret = self
            .api
            .read_apdp_reg((address >> 2) & 0x3, port.ap_n_dp(), &mut value);
        tracing::trace!("J-Link read {:?} {:#x}: {} {:#010x}", port, address, ret, value);

        match ret {
            ret if ret < 0 => Err(DapError::AccessFailed { port, address }),
            0 => Ok(value),
            _ => Err(DapError::WaitResponse),
        }
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError> {
        let ret = self
            .api
            .write_apdp_reg((address >> 2) & 0x3, port.ap_n_dp(), value);
        tracing::trace!("J-Link write {:?} {:#x} = {:#010x}: {}", port, address, value, ret);

        match ret {
            ret if ret < 0 => Err(DapError::AccessFailed { port, address }),
            0 => Ok(()),
            _ => Err(DapError::WaitResponse),
        }
    }

    fn reasserts_power_on_dp_failure(&self) -> bool {
        true
    }

    fn supports_block_access(&self) -> bool {
        self.multi_access
    }

    fn read_drw_block(
        &mut self,
        start: u32,
        count: usize,
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<Vec<u32>, DapError> {
        if !self.multi_access {
            return Err(DapError::NotImplemented("block access"));
        }
        if autoinc && busy_check.is_some() {
            return Err(DapError::NotImplemented("busy check with address increment"));
        }

        let mut words = Vec::with_capacity(count);
        while words.len() < count {
            let chunk = (count - words.len()).min(BLOCK_CHUNK_WORDS);
            let address = if autoinc {
                start.wrapping_add(4 * words.len() as u32)
            } else {
                start
            };
            words.extend(self.read_chunk(address, chunk, autoinc, busy_check)?);
        }
        Ok(words)
    }

    fn write_drw_block(
        &mut self,
        start: u32,
        data: &[u32],
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<(), DapError> {
        if !self.multi_access {
            return Err(DapError::NotImplemented("block access"));
        }
        if autoinc && busy_check.is_some() {
            return Err(DapError::NotImplemented("busy check with address increment"));
        }

        for (i, chunk) in data.chunks(BLOCK_CHUNK_WORDS).enumerate() {
            let address = if autoinc {
                start.wrapping_add((4 * i * BLOCK_CHUNK_WORDS) as u32)
            } else {
                start
            };
            self.write_chunk(address, chunk, autoinc, busy_check)?;
        }
        Ok(())
    }
}

impl<A: JlinkApi> SwdAccess for JlinkDap<A> {
    fn drive_line(&mut self, sequence: &IoSequence) -> Result<Vec<bool>, DapError> {
        drive_swd_line(&mut self.api, sequence)
    }
}

/// The SWD line of a J-Link, for the bit level SWD driver.
#[derive(Debug)]
pub struct JlinkSwd<A> {
    api: A,
}

impl<A: JlinkApi> SwdAccess for JlinkSwd<A> {
    fn drive_line(&mut self, sequence: &IoSequence) -> Result<Vec<bool>, DapError> {
        drive_swd_line(&mut self.api, sequence)
    }
}

/// The DAP's TAP behind a J-Link, for the JTAG-DP driver.
///
/// The library pads the scans for the other devices on the chain itself.
#[derive(Debug)]
pub struct JlinkJtag<A> {
    api: A,
}

impl<A: JlinkApi> JtagAccess for JlinkJtag<A> {
    fn ir_scan(&mut self, instruction: &BitSlice<u8, Lsb0>) -> Result<(), DapError> {
        let tdi = instruction.to_bitvec();
        self.api
            .jtag_store_inst(tdi.as_raw_slice(), instruction.len())?;
        Ok(())
    }

    fn dr_scan(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<BitVec<u8, Lsb0>, DapError> {
        let tdi = data.to_bitvec();
        let tdo = self.api.jtag_store_get_data(tdi.as_raw_slice(), data.len())?;

        let mut captured = BitVec::<u8, Lsb0>::from_vec(tdo);
        captured.truncate(data.len());
        Ok(captured)
    }
}

/// An opened and configured J-Link library.
#[derive(Debug)]
pub struct JlinkSession<A> {
    api: A,
    protocol: WireProtocol,
    ir_len: u8,
    raw_driver: bool,
}

impl<A: JlinkApi> JlinkSession<A> {
    /// Open the probe and configure the DAP connection.
    ///
    /// For SWD with a multi-drop target configured, the target selection sequence
    /// runs before this returns.
    #[tracing::instrument(level = "debug", skip(api))]
    pub fn connect(mut api: A, config: &TransportConfig) -> Result<Self, Error> {
        config.validate()?;

        api.open(config.probe.as_ref())?;
        api.select_interface(config.protocol)?;
        api.set_speed(config.speed_khz)?;

        match config.protocol {
            WireProtocol::Jtag => {
                api.coresight_configure(&config.scan_chain.settings_string())?;
            }
            WireProtocol::Swd => {
                api.coresight_configure("")?;

                if let Some(target) = &config.target_select {
                    let mut dap = JlinkDap {
                        api,
                        multi_access: false,
                    };
                    swd::select_target(&mut dap, target)?;
                    api = dap.into_inner();

                    api.coresight_configure("")?;
                }
            }
        }
        tracing::debug!("J-Link configured for {}", config.protocol);

        Ok(JlinkSession {
            api,
            protocol: config.protocol,
            ir_len: config.scan_chain.ir_len,
            raw_driver: config.raw_driver,
        })
    }

    /// The wire protocol of the session.
    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }
}

impl<A: JlinkApi + 'static> JlinkSession<A> {
    /// Turn the session into the raw register access for a [`DebugPort`](crate::DebugPort).
    pub fn into_dap(self) -> Result<Box<dyn RawDapAccess>, Error> {
        Ok(match (self.raw_driver, self.protocol) {
            (false, _) => Box::new(JlinkDap::new(self.api)),
            (true, WireProtocol::Jtag) => Box::new(JtagDp::connect(
                JlinkJtag { api: self.api },
                self.ir_len,
            )?),
            (true, WireProtocol::Swd) => Box::new(SwdDp::new(JlinkSwd { api: self.api })),
        })
    }
}
