//! Raw DP/AP register access and the backends implementing it.

pub mod jaylink;
pub mod jlink;
pub mod jtag;
pub mod swd;

#[cfg(test)]
#[doc(hidden)]
pub(crate) mod mock;

use crate::error::DapError;
use crate::memory::BusyCheck;

/// Register index of TAR inside the TAR/DRW bank of a MEM-AP.
pub(crate) const TAR_INDEX: u8 = 1;
/// Register index of DRW inside the TAR/DRW bank of a MEM-AP.
pub(crate) const DRW_INDEX: u8 = 3;

/// The type of port a raw register access goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    /// The debug port.
    DebugPort,
    /// The currently selected access port.
    AccessPort,
}

impl PortType {
    /// The APnDP bit of a request.
    pub fn ap_n_dp(self) -> bool {
        self == PortType::AccessPort
    }
}

/// Low-level DAP register access.
///
/// Bank selection through DP.SELECT is the caller's responsibility; implementations
/// only ever see the lowest four bits of a register address.
pub trait RawDapAccess: std::fmt::Debug {
    /// Read a DP or AP register.
    ///
    /// Only the lowest 4 bits of `address` are used.
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError>;

    /// Write a value to a DP or AP register.
    ///
    /// Only the lowest 4 bits of `address` are used.
    fn raw_write_register(&mut self, port: PortType, address: u8, value: u32)
        -> Result<(), DapError>;

    /// Read the same register several times in a row.
    fn raw_read_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), DapError> {
        for value in values {
            *value = self.raw_read_register(port, address)?;
        }

        Ok(())
    }

    /// Write the same register several times in a row.
    fn raw_write_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &[u32],
    ) -> Result<(), DapError> {
        for value in values {
            self.raw_write_register(port, address, *value)?;
        }

        Ok(())
    }

    /// Whether a failed DP access should be retried once after reasserting the
    /// debug power requests.
    fn reasserts_power_on_dp_failure(&self) -> bool {
        false
    }

    /// Whether the backend implements [`read_drw_block`](Self::read_drw_block) and
    /// [`write_drw_block`](Self::write_drw_block).
    ///
    /// This is resolved once when the backend is constructed.
    fn supports_block_access(&self) -> bool {
        false
    }

    /// Read `count` words through DRW of the currently selected MEM-AP in one submission.
    ///
    /// The TAR/DRW bank must already be selected. TAR is written before the first access
    /// and, if `autoinc` is set, again at every 1 KiB boundary. If `busy_check` is given,
    /// every access is preceded by polling the busy check address.
    fn read_drw_block(
        &mut self,
        _start: u32,
        _count: usize,
        _autoinc: bool,
        _busy_check: Option<BusyCheck>,
    ) -> Result<Vec<u32>, DapError> {
        Err(DapError::NotImplemented("block access"))
    }

    /// Write words through DRW of the currently selected MEM-AP in one submission.
    ///
    /// Same preconditions as [`read_drw_block`](Self::read_drw_block).
    fn write_drw_block(
        &mut self,
        _start: u32,
        _data: &[u32],
        _autoinc: bool,
        _busy_check: Option<BusyCheck>,
    ) -> Result<(), DapError> {
        Err(DapError::NotImplemented("block access"))
    }
}

impl<T: RawDapAccess + ?Sized> RawDapAccess for Box<T> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
        (**self).raw_read_register(port, address)
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError> {
        (**self).raw_write_register(port, address, value)
    }

    fn raw_read_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), DapError> {
        (**self).raw_read_block(port, address, values)
    }

    fn raw_write_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &[u32],
    ) -> Result<(), DapError> {
        (**self).raw_write_block(port, address, values)
    }

    fn reasserts_power_on_dp_failure(&self) -> bool {
        (**self).reasserts_power_on_dp_failure()
    }

    fn supports_block_access(&self) -> bool {
        (**self).supports_block_access()
    }

    fn read_drw_block(
        &mut self,
        start: u32,
        count: usize,
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<Vec<u32>, DapError> {
        (**self).read_drw_block(start, count, autoinc, busy_check)
    }

    fn write_drw_block(
        &mut self,
        start: u32,
        data: &[u32],
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<(), DapError> {
        (**self).write_drw_block(start, data, autoinc, busy_check)
    }
}

/// Number of 1 KiB boundaries crossed by the word range `start..end`.
pub(crate) fn boundaries_crossed(start: u32, end: u32) -> usize {
    if end <= start {
        return 0;
    }
    (((end - 1) & !0x3ff).wrapping_sub(start & !0x3ff) / 0x400) as usize
}
