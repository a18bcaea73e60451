//! J-Link probes driven over USB with the `jaylink` crate.
//!
//! The probe only shifts bits here; the JTAG-DP and SWD drivers of this crate run on
//! top of it.

use std::iter;

use bitvec::prelude::*;
use jaylink::{Interface, JayLink, SpeedConfig};

use super::jtag::{JtagAccess, JtagDp};
use super::swd::{self, IoSequence, SwdAccess, SwdDp};
use super::RawDapAccess;
use crate::config::{ProbeSelector, ScanChain, TargetSelect, TransportConfig, WireProtocol};
use crate::error::{DapError, Error};

fn probe_error(e: jaylink::Error) -> DapError {
    DapError::ProbeSpecific(Box::new(e))
}

/// TMS and TDI for one scan starting and ending in Run-Test/Idle.
#[derive(Debug, PartialEq, Eq)]
struct Scan {
    tms: Vec<bool>,
    tdi: Vec<bool>,
    /// Clock cycle at which the scanned register's first bit comes out on TDO.
    capture: usize,
}

impl Scan {
    /// `header` moves from Run-Test/Idle to the Shift state, `pre` and `post` are
    /// the bits of the other devices on the chain.
    fn new(header: &[bool], pre: usize, data: &BitSlice<u8, Lsb0>, post: usize, pad: bool) -> Self {
        let shift_len = pre + data.len() + post;

        let tms = header
            .iter()
            .copied()
            .chain(iter::repeat(false).take(shift_len.saturating_sub(1)))
            // Exit1, Update, Run-Test/Idle
            .chain([true, true, false])
            .collect();
        let tdi = iter::repeat(false)
            .take(header.len())
            .chain(iter::repeat(pad).take(pre))
            .chain(data.iter().by_vals())
            .chain(iter::repeat(pad).take(post))
            .chain([false, false])
            .collect();

        Scan {
            tms,
            tdi,
            capture: header.len() + pre,
        }
    }

    fn ir(chain: &ScanChain, instruction: &BitSlice<u8, Lsb0>) -> Self {
        // Other devices get the all ones BYPASS instruction
        Self::new(
            &[true, true, false, false],
            usize::from(chain.ir_pre),
            instruction,
            usize::from(chain.ir_post),
            true,
        )
    }

    fn dr(chain: &ScanChain, data: &BitSlice<u8, Lsb0>) -> Self {
        // One bypass bit per other device
        Self::new(
            &[true, false, false],
            usize::from(chain.dr_pre),
            data,
            usize::from(chain.dr_post),
            false,
        )
    }
}

/// The J-Link samples SWDIO one clock early, move the samples back in line with
/// the sequence.
fn realign_swd(raw: impl IntoIterator<Item = bool>, len: usize) -> Vec<bool> {
    iter::once(false).chain(raw).take(len).collect()
}

/// A J-Link opened over USB.
pub struct JaylinkDriver {
    handle: JayLink,
    protocol: WireProtocol,
    chain: ScanChain,
    target_select: Option<TargetSelect>,
}

impl std::fmt::Debug for JaylinkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JaylinkDriver")
            .field("protocol", &self.protocol)
            .field("chain", &self.chain)
            .finish()
    }
}

impl JaylinkDriver {
    /// Open the probe chosen by `config` and set up its interface and clock.
    #[tracing::instrument(level = "debug")]
    pub fn open(config: &TransportConfig) -> Result<Self, Error> {
        config.validate()?;

        let serial = match &config.probe {
            Some(ProbeSelector::Serial(serial)) => Some(serial.to_string()),
            Some(ProbeSelector::Ip(_)) => {
                return Err(Error::Unsupported("networked probes over USB"));
            }
            None => None,
        };
        let mut handle = JayLink::open_by_serial(serial.as_deref()).map_err(probe_error)?;

        let interface = match config.protocol {
            WireProtocol::Swd => Interface::Swd,
            WireProtocol::Jtag => Interface::Jtag,
        };
        handle.select_interface(interface).map_err(probe_error)?;

        let speed = u16::try_from(config.speed_khz)
            .ok()
            .and_then(SpeedConfig::khz)
            .ok_or(Error::Unsupported("clock speed"))?;
        handle.set_speed(speed).map_err(probe_error)?;

        let mut driver = JaylinkDriver {
            handle,
            protocol: config.protocol,
            chain: config.scan_chain,
            target_select: config.target_select,
        };
        if driver.protocol == WireProtocol::Jtag {
            driver.reset_tap()?;
        }
        Ok(driver)
    }

    fn jtag_io(&mut self, scan: &Scan) -> Result<Vec<bool>, DapError> {
        if self.protocol != WireProtocol::Jtag {
            return Err(DapError::NotImplemented("JTAG scans in SWD mode"));
        }
        let tdo = self
            .handle
            .jtag_io(scan.tms.iter().copied(), scan.tdi.iter().copied())
            .map_err(probe_error)?;
        Ok(tdo.collect())
    }

    /// Five clocks with TMS high reach Test-Logic-Reset from any state.
    fn reset_tap(&mut self) -> Result<(), DapError> {
        let tms = [true, true, true, true, true, false];
        self.handle
            .jtag_io(tms, [false; 6])
            .map_err(probe_error)?;
        Ok(())
    }

    /// Hand the probe to the JTAG-DP or SWD driver.
    ///
    /// For SWD with a multi-drop target configured, the target selection sequence
    /// runs first.
    pub fn into_dap(self) -> Result<Box<dyn RawDapAccess>, Error> {
        match self.protocol {
            WireProtocol::Jtag => {
                let ir_len = self.chain.ir_len;
                Ok(Box::new(JtagDp::connect(self, ir_len)?))
            }
            WireProtocol::Swd => {
                let target_select = self.target_select;
                let mut dp = SwdDp::new(self);
                if let Some(target) = &target_select {
                    swd::select_target(&mut dp, target)?;
                }
                Ok(Box::new(dp))
            }
        }
    }
}

impl JtagAccess for JaylinkDriver {
    fn ir_scan(&mut self, instruction: &BitSlice<u8, Lsb0>) -> Result<(), DapError> {
        let scan = Scan::ir(&self.chain, instruction);
        tracing::trace!("IR scan {} bits", scan.tms.len());
        self.jtag_io(&scan)?;
        Ok(())
    }

    fn dr_scan(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<BitVec<u8, Lsb0>, DapError> {
        let scan = Scan::dr(&self.chain, data);
        let tdo = self.jtag_io(&scan)?;

        let captured = tdo.get(scan.capture..scan.capture + data.len()).ok_or_else(|| {
            DapError::ProbeSpecific(anyhow::anyhow!("Short TDO capture of {} bits", tdo.len()).into())
        })?;
        Ok(captured.iter().copied().collect())
    }
}

impl SwdAccess for JaylinkDriver {
    fn drive_line(&mut self, sequence: &IoSequence) -> Result<Vec<bool>, DapError> {
        if self.protocol != WireProtocol::Swd {
            return Err(DapError::NotImplemented("SWD transfers in JTAG mode"));
        }
        let raw = self
            .handle
            .swd_io(
                sequence.direction_bits().iter().copied(),
                sequence.io_bits().iter().copied(),
            )
            .map_err(probe_error)?;
        Ok(realign_swd(raw, sequence.len()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ir_scan_single_device() {
        let instruction = 0xau8;
        let scan = Scan::ir(&ScanChain::default(), &instruction.view_bits::<Lsb0>()[..4]);

        assert_eq!(
            scan.tms,
            vec![true, true, false, false, false, false, false, true, true, false]
        );
        assert_eq!(
            scan.tdi,
            vec![false, false, false, false, false, true, false, true, false, false]
        );
        assert_eq!(scan.capture, 4);
    }

    #[test]
    fn dr_scan_with_bypassed_devices() {
        let chain = ScanChain {
            dr_pre: 1,
            dr_post: 2,
            ..Default::default()
        };
        let data = bitvec![u8, Lsb0; 1, 1, 0];
        let scan = Scan::dr(&chain, &data);

        // 3 header, 6 shift, 2 trailer
        assert_eq!(scan.tms.len(), 11);
        assert_eq!(scan.tdi.len(), 11);
        assert_eq!(&scan.tdi[3..9], &[false, true, true, false, false, false]);
        assert_eq!(scan.capture, 4);
        assert!(scan.tms[8]);
        assert!(!scan.tms[7]);
    }

    #[test]
    fn ir_padding_is_bypass() {
        let chain = ScanChain {
            ir_pre: 2,
            ir_post: 3,
            ..Default::default()
        };
        let instruction = 0u8;
        let scan = Scan::ir(&chain, &instruction.view_bits::<Lsb0>()[..4]);

        assert_eq!(&scan.tdi[4..6], &[true, true]);
        assert_eq!(&scan.tdi[10..13], &[true, true, true]);
        assert_eq!(scan.capture, 6);
    }

    #[test]
    fn swd_samples_are_realigned() {
        let raw = vec![true, false, true, true];
        assert_eq!(realign_swd(raw, 4), vec![false, true, false, true]);
    }
}
