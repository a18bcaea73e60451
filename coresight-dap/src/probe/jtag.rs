//! The JTAG-DP driver.
//!
//! DP and AP registers are reached through the DPACC and APACC scan chains. Each DR
//! scan shifts in a 35 bit request, `RnW` followed by `A[3:2]` and 32 data bits, and
//! shifts out the acknowledge and the read data of the *previous* request. Reads are
//! therefore pipelined, with a final read of RDBUFF to collect the last result.

use bitvec::prelude::*;

use super::{PortType, RawDapAccess};
use crate::error::DapError;

/// Number of WAIT acknowledges tolerated for one request before giving up.
pub const WAIT_THRESHOLD: usize = 3;

/// Width of a DPACC/APACC scan.
const ACC_LEN: usize = 35;

const ACK_OK_FAULT: u8 = 0b010;
const ACK_WAIT: u8 = 0b001;

/// CSYSPWRUPREQ | CDBGPWRUPREQ.
const POWER_UP_REQUEST: u32 = 0x5000_0000;

/// JTAG-DP instruction register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    /// Write-only ABORT register.
    Abort = 0x8,
    /// DP register access.
    DpAcc = 0xa,
    /// AP register access.
    ApAcc = 0xb,
    /// The TAP identification code.
    IdCode = 0xe,
    /// One bit bypass register.
    Bypass = 0xf,
}

impl From<PortType> for Instruction {
    fn from(port: PortType) -> Self {
        match port {
            PortType::DebugPort => Instruction::DpAcc,
            PortType::AccessPort => Instruction::ApAcc,
        }
    }
}

/// Raw access to the scan chain of the TAP a DAP sits behind.
///
/// Implementations put any other TAPs on the chain into BYPASS and add their bits
/// before and after the scanned data, so callers only see the DAP's registers.
pub trait JtagAccess: std::fmt::Debug {
    /// Shift `instruction` into the instruction register.
    fn ir_scan(&mut self, instruction: &BitSlice<u8, Lsb0>) -> Result<(), DapError>;

    /// Shift `data` through the selected data register and return the captured bits.
    fn dr_scan(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<BitVec<u8, Lsb0>, DapError>;
}

impl<T: JtagAccess + ?Sized> JtagAccess for Box<T> {
    fn ir_scan(&mut self, instruction: &BitSlice<u8, Lsb0>) -> Result<(), DapError> {
        (**self).ir_scan(instruction)
    }

    fn dr_scan(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<BitVec<u8, Lsb0>, DapError> {
        (**self).dr_scan(data)
    }
}

/// A DAP driven through its JTAG-DP.
#[derive(Debug)]
pub struct JtagDp<J> {
    driver: J,
    ir_len: usize,
    /// The instruction currently in IR, to skip redundant IR scans.
    instruction: Option<Instruction>,
}

impl<J: JtagAccess> JtagDp<J> {
    /// Wrap a JTAG driver whose DAP has an instruction register of `ir_len` bits.
    ///
    /// The debug power-up requests are asserted straight away.
    pub fn connect(driver: J, ir_len: u8) -> Result<Self, DapError> {
        let mut dp = JtagDp {
            driver,
            ir_len: usize::from(ir_len),
            instruction: None,
        };
        dp.write(PortType::DebugPort, 0x4, POWER_UP_REQUEST)?;
        Ok(dp)
    }

    /// Give up the driver.
    pub fn into_inner(self) -> J {
        self.driver
    }

    fn select_instruction(&mut self, instruction: Instruction) -> Result<(), DapError> {
        if self.instruction == Some(instruction) {
            return Ok(());
        }

        let value = instruction as u8;
        let bits = &value.view_bits::<Lsb0>()[..self.ir_len.min(8)];
        tracing::trace!("IR scan {:?}", instruction);
        self.driver.ir_scan(bits)?;
        self.instruction = Some(instruction);
        Ok(())
    }

    /// Issue one DPACC/APACC scan and return the data captured from the previous one.
    ///
    /// A WAIT acknowledge repeats the same scan, up to [`WAIT_THRESHOLD`] times.
    fn scan(&mut self, port: PortType, read: bool, address: u8, data: u32) -> Result<u32, DapError> {
        self.select_instruction(port.into())?;

        let mut request = BitVec::<u8, Lsb0>::with_capacity(ACC_LEN);
        request.push(read);
        request.push(address & 0x4 != 0);
        request.push(address & 0x8 != 0);
        request.extend((0..32).map(|bit| data >> bit & 1 == 1));

        let mut waits = 0;
        loop {
            let response = self.driver.dr_scan(&request)?;
            if response.len() < ACC_LEN {
                return Err(DapError::ProbeSpecific(
                    anyhow::anyhow!("Short DR capture of {} bits", response.len()).into(),
                ));
            }

            let ack = response[0..3].load_le::<u8>();
            match ack {
                ACK_OK_FAULT => {
                    let value = response[3..ACC_LEN].load_le::<u32>();
                    tracing::trace!("{:?} scan A={:#x} read={} -> {:#010x}", port, address, read, value);
                    return Ok(value);
                }
                ACK_WAIT => {
                    waits += 1;
                    if waits > WAIT_THRESHOLD {
                        tracing::error!("Too many WAIT responses from the JTAG-DP");
                        return Err(DapError::WaitAckExhausted { waits });
                    }
                    tracing::debug!("WAIT response, retrying ({} of {})", waits, WAIT_THRESHOLD);
                }
                ack => return Err(DapError::UnexpectedAck { ack }),
            }
        }
    }

    /// Read several registers in one pipeline.
    ///
    /// `N` reads take `N + 1` scans: the result of each read is captured by the scan
    /// after it, and the last one by a read of DP.RDBUFF.
    pub fn read_registers(&mut self, registers: &[(PortType, u8)]) -> Result<Vec<u32>, DapError> {
        let mut values = Vec::with_capacity(registers.len());
        for (i, (port, address)) in registers.iter().enumerate() {
            let previous = self.scan(*port, true, *address, 0)?;
            if i > 0 {
                values.push(previous);
            }
        }
        if !registers.is_empty() {
            values.push(self.scan(PortType::DebugPort, true, 0xc, 0)?);
        }
        Ok(values)
    }

    /// Write a register. The write is posted, failures show up in CTRL/STAT.
    pub fn write(&mut self, port: PortType, address: u8, value: u32) -> Result<(), DapError> {
        self.scan(port, false, address, value).map(|_| ())
    }

    /// Read IDCODE of the TAP.
    pub fn idcode(&mut self) -> Result<u32, DapError> {
        self.select_instruction(Instruction::IdCode)?;
        let response = self.driver.dr_scan(&bitvec![u8, Lsb0; 0; 32])?;
        Ok(response[..32.min(response.len())].load_le::<u32>())
    }
}

impl<J: JtagAccess> RawDapAccess for JtagDp<J> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
        let values = self.read_registers(&[(port, address)])?;
        values
            .first()
            .copied()
            .ok_or(DapError::AccessFailed { port, address })
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError> {
        if port == PortType::DebugPort && address & 0xc == 0 {
            // ABORT has its own instruction on JTAG
            self.select_instruction(Instruction::Abort)?;
            let mut request = BitVec::<u8, Lsb0>::with_capacity(ACC_LEN);
            request.extend([false, false, false]);
            request.extend((0..32).map(|bit| value >> bit & 1 == 1));
            self.driver.dr_scan(&request)?;
            return Ok(());
        }
        self.write(port, address, value)
    }

    fn raw_read_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), DapError> {
        let requests = vec![(port, address); values.len()];
        let results = self.read_registers(&requests)?;
        values.copy_from_slice(&results);
        Ok(())
    }
}
