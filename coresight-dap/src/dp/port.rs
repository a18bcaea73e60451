use std::time::{Duration, Instant};

use super::{
    detect_version, Abort, ChipVersion, Ctrl, DebugPortId, DebugPortVersion, Dlpidr, DpBank,
    DpRegister, Dpidr, Select, TargetId,
};
use crate::config::TargetSelect;
use crate::error::{DapError, Error};
use crate::probe::{PortType, RawDapAccess};

/// Re-reads of CTRL/STAT granted to a transiently unstable bus before sticky flags are reported.
const STICKY_SETTLE_READS: usize = 10;

const POWER_UP_TIMEOUT: Duration = Duration::from_secs(1);
const RESET_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A debug port, owning the raw register backend and the SELECT cache.
///
/// Every AP register access goes through [`select_ap`](Self::select_ap), which only
/// writes DP.SELECT when the AP index or register bank changes. A run of accesses can
/// additionally be [frozen](Self::freeze_select) to a single bank.
#[derive(Debug)]
pub struct DebugPort {
    probe: Box<dyn RawDapAccess>,
    version: DebugPortVersion,
    /// Last value written to SELECT, `None` if unknown.
    select: Option<u32>,
    frozen: Option<u32>,
    overrun_detection: bool,
    reset_in_progress: bool,
    power_up_timeout: Duration,
}

impl DebugPort {
    /// Create a debug port of a known version without touching the target.
    pub fn new(probe: Box<dyn RawDapAccess>, version: DebugPortVersion) -> Self {
        DebugPort {
            probe,
            version,
            select: None,
            frozen: None,
            overrun_detection: false,
            reset_in_progress: false,
            power_up_timeout: POWER_UP_TIMEOUT,
        }
    }

    /// Detect the version of the debug port behind `probe` and create it.
    ///
    /// If `overrun_detection` is set, CTRL/STAT.ORUNDETECT is enabled and sticky error
    /// clears include ORUNERRCLR. On failure the probe is handed back with the error.
    pub fn connect(
        mut probe: Box<dyn RawDapAccess>,
        overrun_detection: bool,
    ) -> Result<Self, (Box<dyn RawDapAccess>, Error)> {
        let version = match detect_version(probe.as_mut()) {
            Ok(Some(version)) => version,
            Ok(None) => return Err((probe, Error::DebugPortNotPresent)),
            Err(e) => return Err((probe, e)),
        };

        let mut port = DebugPort::new(probe, version);
        port.overrun_detection = overrun_detection;

        if overrun_detection {
            if let Err(e) = port.enable_overrun_detection() {
                return Err((port.probe, e));
            }
        }

        Ok(port)
    }

    fn enable_overrun_detection(&mut self) -> Result<(), Error> {
        let mut ctrl: Ctrl = self.read_dp_register()?;
        ctrl.set_orundetect(true);
        self.write_dp_register(ctrl)
    }

    /// The architecture version of this debug port.
    pub fn version(&self) -> DebugPortVersion {
        self.version
    }

    /// Give up the debug port and return the raw backend.
    pub fn into_probe(self) -> Box<dyn RawDapAccess> {
        self.probe
    }

    pub(crate) fn probe_mut(&mut self) -> &mut dyn RawDapAccess {
        self.probe.as_mut()
    }

    #[cfg(test)]
    pub(crate) fn set_power_up_timeout(&mut self, timeout: Duration) {
        self.power_up_timeout = timeout;
    }

    /// Forget the cached SELECT value, for example after a line reset.
    pub fn invalidate_select(&mut self) {
        self.select = None;
        self.frozen = None;
    }

    /// Read a typed DP register, selecting its bank first if necessary.
    pub fn read_dp_register<R: DpRegister>(&mut self) -> Result<R, Error> {
        self.select_dp_bank_for::<R>()?;
        tracing::trace!("Reading DP register {}", R::NAME);
        let value = self.dp_read(R::ADDRESS)?;
        tracing::trace!("Read DP register {}, value={:#010x}", R::NAME, value);
        Ok(value.into())
    }

    /// Write a typed DP register, selecting its bank first if necessary.
    pub fn write_dp_register<R: DpRegister>(&mut self, register: R) -> Result<(), Error> {
        self.select_dp_bank_for::<R>()?;
        let value: u32 = register.into();
        tracing::trace!("Writing DP register {}, value={:#010x}", R::NAME, value);
        self.dp_write(R::ADDRESS, value)?;
        Ok(())
    }

    fn select_dp_bank_for<R: DpRegister>(&mut self) -> Result<(), Error> {
        match R::BANK {
            DpBank::Bank(bank) if self.version.is_banked(R::ADDRESS) => self.select_dp_bank(bank),
            _ => Ok(()),
        }
    }

    fn select_dp_bank(&mut self, bank: u8) -> Result<(), Error> {
        let value = (self.select.unwrap_or(0) & !0xf) | u32::from(bank & 0xf);
        if self.select != Some(value) {
            self.write_select(value)?;
        }
        Ok(())
    }

    fn write_select(&mut self, value: u32) -> Result<(), Error> {
        tracing::debug!("Writing SELECT = {:#010x}", value);
        match self.dp_write(Select::ADDRESS, value) {
            Ok(()) => {
                self.select = Some(value);
                Ok(())
            }
            Err(e) => {
                self.select = None;
                Err(e)
            }
        }
    }

    /// Point SELECT at the register bank containing `address` in AP `ap`.
    ///
    /// The write is skipped if the selection is frozen to the same value or if SELECT
    /// already holds it. Selecting a different bank ends a frozen selection.
    pub fn select_ap(&mut self, ap: u8, address: u16) -> Result<(), Error> {
        // Only ADIv6 APs have a non-zero upper nibble in the register address.
        let value = (u32::from(ap) << 24) | (u32::from(address) & 0xff0);

        if self.frozen == Some(value) {
            return Ok(());
        }
        if self.frozen.take().is_some() {
            tracing::debug!("Access to another bank, leaving frozen selection");
        }

        if self.select != Some(value) {
            self.write_select(value)?;
        }
        Ok(())
    }

    /// Freeze the current selection. Nested freezes have no effect.
    pub fn freeze_select(&mut self) {
        if self.frozen.is_none() {
            self.frozen = self.select;
        }
    }

    /// End a frozen selection.
    pub fn unfreeze_select(&mut self) {
        self.frozen = None;
    }

    pub(crate) fn frozen_selection(&self) -> Option<u32> {
        self.frozen
    }

    /// Put back a frozen selection saved with [`frozen_selection`](Self::frozen_selection).
    ///
    /// It is only restored if SELECT still holds that value.
    pub(crate) fn restore_frozen_selection(&mut self, frozen: Option<u32>) {
        self.frozen = frozen.filter(|value| self.select == Some(*value));
    }

    /// Returns `true` while the selection is frozen.
    pub fn select_is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Read an AP register, selecting AP and bank first.
    pub fn read_ap_register(&mut self, ap: u8, address: u16) -> Result<u32, Error> {
        self.select_ap(ap, address)?;
        let value = self.ap_read_selected(address as u8)?;
        tracing::trace!("AP {} read {:#05x} = {:#010x}", ap, address, value);
        Ok(value)
    }

    /// Write an AP register, selecting AP and bank first.
    pub fn write_ap_register(&mut self, ap: u8, address: u16, value: u32) -> Result<(), Error> {
        self.select_ap(ap, address)?;
        tracing::trace!("AP {} write {:#05x} = {:#010x}", ap, address, value);
        self.ap_write_selected(address as u8, value)?;
        Ok(())
    }

    /// Read an AP register in the currently selected bank.
    pub(crate) fn ap_read_selected(&mut self, address: u8) -> Result<u32, DapError> {
        self.probe
            .raw_read_register(PortType::AccessPort, address & 0xf)
    }

    /// Write an AP register in the currently selected bank.
    pub(crate) fn ap_write_selected(&mut self, address: u8, value: u32) -> Result<(), DapError> {
        self.probe
            .raw_write_register(PortType::AccessPort, address & 0xf, value)
    }

    /// A failed DP access is retried once if the backend reports that failures can mean
    /// lost debug power and the power requests actually had to be reasserted. A power-up
    /// timeout is returned as is.
    fn dp_read(&mut self, address: u8) -> Result<u32, Error> {
        match self.probe.raw_read_register(PortType::DebugPort, address) {
            Err(e) if e.is_access_error() && self.probe.reasserts_power_on_dp_failure() => {
                tracing::debug!("DP read failed ({}), reasserting power", e);
                if !self.reassert_power()? {
                    return Err(e.into());
                }
                Ok(self.probe.raw_read_register(PortType::DebugPort, address)?)
            }
            result => Ok(result?),
        }
    }

    fn dp_write(&mut self, address: u8, value: u32) -> Result<(), Error> {
        match self
            .probe
            .raw_write_register(PortType::DebugPort, address, value)
        {
            Err(e) if e.is_access_error() && self.probe.reasserts_power_on_dp_failure() => {
                tracing::debug!("DP write failed ({}), reasserting power", e);
                if !self.reassert_power()? {
                    return Err(e.into());
                }
                Ok(self
                    .probe
                    .raw_write_register(PortType::DebugPort, address, value)?)
            }
            result => Ok(result?),
        }
    }

    /// Read CTRL/STAT without the power retry. Used where a failure must not recurse.
    fn read_ctrl_no_retry(&mut self) -> Result<Ctrl, DapError> {
        if self.version.is_banked(Ctrl::ADDRESS) && self.select.map(|s| s & 0xf) != Some(0) {
            let value = self.select.unwrap_or(0) & !0xf;
            self.probe
                .raw_write_register(PortType::DebugPort, Select::ADDRESS, value)?;
            self.select = Some(value);
        }
        self.probe
            .raw_read_register(PortType::DebugPort, Ctrl::ADDRESS)
            .map(Ctrl)
    }

    /// Check CTRL/STAT for latched sticky errors.
    ///
    /// If a flag is set the register is re-read until two consecutive reads agree, to let
    /// a transiently unstable bus settle. If the flags are still set afterwards a
    /// [`Error::StickyError`] with the final snapshot is returned.
    pub fn check_for_sticky_errors(&mut self) -> Result<(), Error> {
        let mut ctrl: Ctrl = self.read_dp_register()?;
        if !ctrl.has_sticky_errors() {
            return Ok(());
        }

        let mut previous = None;
        let mut rereads = 0;
        while previous != Some(ctrl) && rereads < STICKY_SETTLE_READS {
            previous = Some(ctrl);
            ctrl = self.read_dp_register()?;
            rereads += 1;
        }

        if ctrl.has_sticky_errors() {
            tracing::debug!("Sticky errors set: {:?}", ctrl);
            return Err(Error::StickyError { ctrl_stat: ctrl });
        }
        Ok(())
    }

    fn sticky_clear_bits(&self) -> Abort {
        let mut abort = Abort(0);
        abort.set_wderrclr(true);
        abort.set_stkerrclr(true);
        abort.set_stkcmpclr(true);
        if self.overrun_detection {
            abort.set_orunerrclr(true);
        }
        abort
    }

    /// Clear the sticky error flags through DP.ABORT.
    pub fn clear_sticky_errors(&mut self) -> Result<(), Error> {
        tracing::debug!("Clearing sticky errors");
        let abort = self.sticky_clear_bits();
        self.write_dp_register(abort)
    }

    /// Abort the current AP transaction and clear the sticky error flags.
    pub fn abort_transaction(&mut self) -> Result<(), Error> {
        let mut abort = self.sticky_clear_bits();
        abort.set_dapabort(true);
        self.write_dp_register(abort)
    }

    /// Reassert the power-up requests if they are clear.
    ///
    /// Returns `false` if the port was already powered, `true` if the requests were
    /// asserted and acknowledged. Fails with [`Error::PowerUpTimeout`] if the
    /// acknowledges do not appear within one second; this is not retried.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reassert_power(&mut self) -> Result<bool, Error> {
        let ctrl = match self.read_ctrl_no_retry() {
            Ok(ctrl) if ctrl.0 & Ctrl::POWER_MASK != 0 => return Ok(false),
            Ok(ctrl) => ctrl,
            Err(e) if e.is_access_error() => Ctrl(0),
            Err(e) => return Err(e.into()),
        };

        let mut request = ctrl;
        request.set_csyspwrupreq(true);
        request.set_cdbgpwrupreq(true);
        tracing::debug!("Reasserting debug power requests");
        self.probe
            .raw_write_register(PortType::DebugPort, Ctrl::ADDRESS, request.0)?;

        self.wait_for_power_up(false)?;
        Ok(true)
    }

    fn wait_for_power_up(&mut self, retry: bool) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            let ctrl = if retry {
                self.read_dp_register::<Ctrl>()?
            } else {
                self.read_ctrl_no_retry()?
            };
            if ctrl.powered_up() {
                return Ok(());
            }
            if start.elapsed() > self.power_up_timeout {
                tracing::error!("Debug power-up requests not acknowledged: {:?}", ctrl);
                return Err(Error::PowerUpTimeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Set CDBGPWRUPREQ and CSYSPWRUPREQ and wait for both acknowledges.
    pub fn assert_power_request(&mut self) -> Result<(), Error> {
        let mut ctrl: Ctrl = self.read_dp_register()?;
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        self.write_dp_register(ctrl)?;
        self.wait_for_power_up(true)
    }

    /// Clear CDBGPWRUPREQ and CSYSPWRUPREQ.
    pub fn clear_power_request(&mut self) -> Result<(), Error> {
        let mut ctrl: Ctrl = self.read_dp_register()?;
        ctrl.set_csyspwrupreq(false);
        ctrl.set_cdbgpwrupreq(false);
        self.write_dp_register(ctrl)
    }

    /// Pulse CDBGRSTREQ and wait for CDBGRSTACK.
    ///
    /// The request is cleared again even if the acknowledge does not arrive within
    /// half a second, in which case [`Error::ResetTimeout`] is returned.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reset_request(&mut self) -> Result<(), Error> {
        let mut ctrl: Ctrl = self.read_dp_register()?;
        ctrl.set_cdbgrstreq(false);
        self.write_dp_register(ctrl)?;
        ctrl.set_cdbgrstreq(true);
        self.write_dp_register(ctrl)?;

        let start = Instant::now();
        let acknowledged = loop {
            if self.read_dp_register::<Ctrl>()?.cdbgrstack() {
                break true;
            }
            if start.elapsed() > RESET_TIMEOUT {
                break false;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        ctrl.set_cdbgrstreq(false);
        self.write_dp_register(ctrl)?;

        if acknowledged {
            Ok(())
        } else {
            Err(Error::ResetTimeout)
        }
    }

    /// Mark that the following write is expected to reset the target.
    pub fn begin_reset(&mut self) {
        self.reset_in_progress = true;
    }

    /// Returns `true` between [`begin_reset`](Self::begin_reset) and [`end_reset`](Self::end_reset).
    pub fn reset_in_progress(&self) -> bool {
        self.reset_in_progress
    }

    /// Leave reset mode.
    pub fn end_reset(&mut self) {
        self.reset_in_progress = false;
    }

    /// Read and decode DPIDR.
    pub fn debug_port_id(&mut self) -> Result<DebugPortId, Error> {
        let dpidr: Dpidr = self.read_dp_register()?;
        Ok(dpidr.into())
    }

    /// Identify the target through TARGETID and DLPIDR.
    ///
    /// Returns `None` on a DPv1 port, which has neither register.
    pub fn chip_version(&mut self) -> Result<Option<ChipVersion>, Error> {
        if self.version < DebugPortVersion::DPv2 {
            return Ok(None);
        }

        let target_id: TargetId = self.read_dp_register()?;
        let dlpidr: Dlpidr = self.read_dp_register()?;
        Ok(Some(ChipVersion {
            designer: target_id.tdesigner(),
            part_no: target_id.tpartno(),
            revision: target_id.trevision(),
            instance: dlpidr.tinstance(),
        }))
    }
}

/// Check with raw accesses whether the SWD target selection took effect.
///
/// DPIDR must be read straight after TARGETSEL. TARGETID and DLPIDR are then read
/// through their DP banks and compared against the requested target. SELECT is left
/// pointing at bank 0.
pub(crate) fn verify_target_selection<P: RawDapAccess + ?Sized>(
    probe: &mut P,
    target: &TargetSelect,
) -> Result<bool, DapError> {
    probe.raw_read_register(PortType::DebugPort, Dpidr::ADDRESS)?;

    probe.raw_write_register(PortType::DebugPort, Select::ADDRESS, 2)?;
    let target_id = probe.raw_read_register(PortType::DebugPort, TargetId::ADDRESS)?;
    probe.raw_write_register(PortType::DebugPort, Select::ADDRESS, 3)?;
    let dlpidr = Dlpidr(probe.raw_read_register(PortType::DebugPort, Dlpidr::ADDRESS)?);
    probe.raw_write_register(PortType::DebugPort, Select::ADDRESS, 0)?;

    let selected = (target_id & 0x0fff_ffff, dlpidr.tinstance());
    tracing::debug!("Selected target {:#x}:{}", selected.0, selected.1);
    Ok(selected == (target.targetid, target.instance))
}
