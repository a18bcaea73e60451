//! The transport front end: MEM-AP connections by index, memory and core register access.
//!
//! A [`CoresightTransport`] owns the raw backend. The debug port is detected and powered
//! up on the first access, access ports are probed the first time they are used and
//! cached for the rest of the session.
//!
//! Every memory and register operation that fails with a sticky error is retried
//! exactly once after the sticky flags were cleared.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use crate::ap::{ApClass, ApLayout, ApType, Csw, DataSize, Idr};
use crate::config::TransportConfig;
use crate::dp::{ChipVersion, DebugPort};
use crate::error::Error;
use crate::memory::{MemAp, MemApState};
use crate::probe::RawDapAccess;

/// An access port index together with the bus the caller expects behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApSelector {
    /// Index of the access port.
    pub index: u8,
    /// The expected bus. Only the bus family is looked at.
    pub bus: Option<ApType>,
}

impl ApSelector {
    /// An access port of unspecified bus type.
    pub fn new(index: u8) -> Self {
        ApSelector { index, bus: None }
    }

    /// An access port in front of an AHB bus.
    pub fn ahb(index: u8) -> Self {
        ApSelector {
            index,
            bus: Some(ApType::AmbaAhb3),
        }
    }

    /// An access port in front of an APB bus.
    pub fn apb(index: u8) -> Self {
        ApSelector {
            index,
            bus: Some(ApType::AmbaApb2Apb3),
        }
    }
}

impl From<u8> for ApSelector {
    fn from(index: u8) -> Self {
        ApSelector::new(index)
    }
}

/// Identifies a connection: an access port and how to use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionId {
    /// The access port.
    pub ap: ApSelector,
    /// Default address increment. Only used when the connection is first made.
    pub autoinc: Option<bool>,
    /// Name of an attached peripheral codec to go through.
    pub peripheral: Option<String>,
    /// Connect even if CSW.DeviceEn is clear.
    pub allow_disabled: bool,
}

impl ConnectionId {
    /// A plain connection to `ap`.
    pub fn new(ap: ApSelector) -> Self {
        ConnectionId {
            ap,
            autoinc: None,
            peripheral: None,
            allow_disabled: false,
        }
    }

    /// Override the default address increment.
    pub fn with_autoinc(mut self, autoinc: bool) -> Self {
        self.autoinc = Some(autoinc);
        self
    }

    /// Go through the peripheral attached under `name`.
    pub fn with_peripheral(mut self, name: impl Into<String>) -> Self {
        self.peripheral = Some(name.into());
        self
    }

    /// Accept a disabled access port.
    pub fn allow_disabled(mut self) -> Self {
        self.allow_disabled = true;
        self
    }

    /// Address increment is on by default for AHB access ports without a peripheral.
    ///
    /// `None` leaves the decision to the bus type read from IDR.
    fn default_autoinc(&self) -> Option<bool> {
        if self.peripheral.is_some() {
            return Some(false);
        }
        self.autoinc
            .or_else(|| self.ap.bus.map(|bus| bus.is_ahb()))
    }
}

impl From<ApSelector> for ConnectionId {
    fn from(ap: ApSelector) -> Self {
        ConnectionId::new(ap)
    }
}

/// Run control requests for the core behind a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    /// Stop the core.
    Halt,
    /// Let the core run.
    Resume,
    /// Execute a single instruction.
    Step,
    /// Reset the core.
    Reset,
}

/// Run state of the core behind a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// The core is executing.
    Running,
    /// The core is halted in debug state.
    Halted,
    /// The state could not be determined.
    Unknown,
}

/// A codec for a debug component reached through a MEM-AP, for example the debug
/// module of a core behind an APB-AP.
///
/// The transport handles sticky error recovery, implementations only issue accesses.
pub trait CorePeripheral: fmt::Debug {
    /// Read the core registers `registers`.
    fn read_registers(&mut self, ap: &mut MemAp<'_>, registers: &[u32]) -> Result<Vec<u32>, Error>;

    /// Write `values` to the core registers `registers`.
    fn write_registers(
        &mut self,
        ap: &mut MemAp<'_>,
        registers: &[u32],
        values: &[u32],
    ) -> Result<(), Error>;

    /// Report the run state of the core.
    fn run_ctrl_read(&mut self, ap: &mut MemAp<'_>) -> Result<CoreStatus, Error>;

    /// Change the run state of the core.
    fn run_ctrl_write(&mut self, ap: &mut MemAp<'_>, request: RunControl) -> Result<(), Error>;

    /// Read memory as seen by the core. Defaults to the bus behind the access port.
    fn memory_read(&mut self, ap: &mut MemAp<'_>, start: u32, end: u32) -> Result<Vec<u8>, Error> {
        ap.read_memory(start, end)
    }

    /// Write memory as seen by the core. Defaults to the bus behind the access port.
    fn memory_write(&mut self, ap: &mut MemAp<'_>, start: u32, data: &[u8]) -> Result<(), Error> {
        ap.write_memory(start, data)
    }
}

/// What [`CoresightTransport::scan_aps`] found at one access port index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApDetails {
    /// Index of the access port.
    pub index: u8,
    /// Class from IDR.
    pub class: Option<ApClass>,
    /// Bus type from IDR.
    pub ap_type: Option<ApType>,
    /// CSW.DeviceEn.
    pub enabled: bool,
    /// Only filled in for a detailed scan.
    pub extra: Option<ApExtraDetails>,
}

/// The additional fields of a detailed access port scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApExtraDetails {
    /// IDR.VARIANT.
    pub variant: u8,
    /// Designer, only Arm is recognised.
    pub designer: &'static str,
    /// IDR.REVISION.
    pub revision: u8,
    /// The access size currently set in CSW.
    pub access_size: Option<DataSize>,
    /// CSW.TrInProg.
    pub transfer_in_progress: bool,
}

impl ApDetails {
    fn class_name(&self) -> Option<&'static str> {
        match self.class {
            Some(ApClass::MemAp) => Some("MEM-AP"),
            Some(ApClass::ComAp) => Some("COM-AP"),
            _ => None,
        }
    }

    fn bus_name(&self) -> &'static str {
        match self.ap_type {
            Some(ApType::JtagComAp) if self.class == Some(ApClass::Undefined) => "JTAG",
            Some(ApType::JtagComAp) => "COM-AP",
            Some(bus) if self.extra.is_none() => bus.short_name(),
            Some(ApType::AmbaAhb3) => "AHB3",
            Some(ApType::AmbaApb2Apb3) => "APB2/3",
            Some(ApType::AmbaAxi3Axi4) => "AXI3/4",
            Some(ApType::AmbaAhb5) => "AHB5",
            Some(ApType::AmbaApb4) => "APB4",
            None => "Unknown",
        }
    }

    /// The "Class and Bus Type" column of the scan table.
    pub fn description(&self) -> String {
        match self.class_name() {
            Some(class) => format!("{}: {}", class, self.bus_name()),
            None => self.bus_name().to_string(),
        }
    }
}

fn yes_no(flag: bool) -> String {
    let text = if flag { "Y" } else { "N" };
    text.to_string()
}

fn render_table(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|column| column.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut table = String::new();
    let lines = std::iter::once(header.iter().map(|c| c.to_string()).collect::<Vec<_>>())
        .chain(rows.iter().cloned());
    for line in lines {
        let mut text = String::new();
        for (cell, width) in line.iter().zip(&widths) {
            let _ = write!(text, "{:<width$}  ", cell, width = *width);
        }
        table.push_str(text.trim_end());
        table.push('\n');
    }
    table
}

/// The DAP transport.
///
/// See the [crate documentation](crate) for an example.
#[derive(Debug)]
pub struct CoresightTransport {
    /// The backend while no debug port is connected.
    probe: Option<Box<dyn RawDapAccess>>,
    dp: Option<DebugPort>,
    overrun_detection: bool,
    /// `None` marks an index probed as absent.
    aps: HashMap<u8, Option<MemApState>>,
    peripherals: HashMap<(u8, String), Box<dyn CorePeripheral>>,
}

impl CoresightTransport {
    /// Create a transport over `probe`. Nothing is accessed until the first operation.
    pub fn new(probe: Box<dyn RawDapAccess>) -> Self {
        CoresightTransport {
            probe: Some(probe),
            dp: None,
            overrun_detection: false,
            aps: HashMap::new(),
            peripherals: HashMap::new(),
        }
    }

    /// Create a transport using the debug port settings of `config`.
    pub fn with_config(probe: Box<dyn RawDapAccess>, config: &TransportConfig) -> Self {
        let mut transport = CoresightTransport::new(probe);
        transport.overrun_detection = config.overrun_detection;
        transport
    }

    /// Attach a peripheral codec to the access port `ap` under `name`.
    pub fn attach_peripheral(
        &mut self,
        ap: u8,
        name: impl Into<String>,
        peripheral: Box<dyn CorePeripheral>,
    ) {
        self.peripherals.insert((ap, name.into()), peripheral);
    }

    /// The debug port, detected and powered up on first use.
    pub fn debug_port(&mut self) -> Result<&mut DebugPort, Error> {
        let dp = match self.dp.take() {
            Some(dp) => dp,
            None => self.connect_debug_port()?,
        };
        Ok(self.dp.insert(dp))
    }

    fn connect_debug_port(&mut self) -> Result<DebugPort, Error> {
        let probe = self
            .probe
            .take()
            .ok_or(Error::Unsupported("a transport without a probe"))?;

        let mut dp = match DebugPort::connect(probe, self.overrun_detection) {
            Ok(dp) => dp,
            Err((probe, e)) => {
                self.probe = Some(probe);
                return Err(e);
            }
        };
        if let Err(e) = dp.reassert_power() {
            self.probe = Some(dp.into_probe());
            return Err(e);
        }

        tracing::debug!("Connected to {} debug port", dp.version());
        Ok(dp)
    }

    /// Identify the target through TARGETID and DLPIDR. `None` on a DPv1 port.
    pub fn get_chip_version(&mut self) -> Result<Option<ChipVersion>, Error> {
        self.debug_port()?.chip_version()
    }

    /// Probe the access port of `conn` if it has not been seen yet.
    fn resolve(&mut self, conn: &ConnectionId) -> Result<(), Error> {
        let index = conn.ap.index;
        match self.aps.get(&index) {
            Some(Some(_)) => return Ok(()),
            Some(None) => return Err(Error::ApNotPresent { ap: index }),
            None => {}
        }

        let autoinc = conn.default_autoinc();
        let dp = self.debug_port()?;
        match MemApState::connect(dp, index, autoinc)? {
            None => {
                self.aps.insert(index, None);
                Err(Error::ApNotPresent { ap: index })
            }
            Some(state) if !state.is_enabled() && !conn.allow_disabled => {
                tracing::debug!("AP {} is disabled", index);
                Err(Error::ApDisabled { ap: index })
            }
            Some(state) => {
                self.aps.insert(index, Some(state));
                Ok(())
            }
        }
    }

    /// Resolve `conn` and return the MEM-AP behind it.
    ///
    /// Returns `None` if there is no access port at the index. `conn.autoinc` only
    /// takes effect when the access port is first connected.
    pub fn get_connection(&mut self, conn: &ConnectionId) -> Result<Option<MemAp<'_>>, Error> {
        match self.resolve(conn) {
            Ok(()) => {}
            Err(Error::ApNotPresent { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }
        if let Some(name) = &conn.peripheral {
            if !self.peripherals.contains_key(&(conn.ap.index, name.clone())) {
                return Err(Error::UnknownPeripheral(name.clone()));
            }
        }

        let index = conn.ap.index;
        let (Some(dp), Some(Some(state))) = (self.dp.as_mut(), self.aps.get_mut(&index)) else {
            return Ok(None);
        };
        Ok(Some(MemAp::new(dp, state)))
    }

    /// Run `op` against the connection, clearing sticky errors and retrying once if
    /// it fails with one.
    fn with_retry<T>(
        &mut self,
        conn: &ConnectionId,
        mut op: impl FnMut(&mut MemAp<'_>, Option<&mut (dyn CorePeripheral + 'static)>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.resolve(conn)?;
        let index = conn.ap.index;

        let mut peripheral: Option<&mut (dyn CorePeripheral + 'static)> = match &conn.peripheral {
            Some(name) => {
                let peripheral = self
                    .peripherals
                    .get_mut(&(index, name.clone()))
                    .ok_or_else(|| Error::UnknownPeripheral(name.clone()))?;
                Some(&mut **peripheral)
            }
            None => None,
        };
        let dp = self.dp.as_mut().ok_or(Error::DebugPortNotPresent)?;
        let state = self
            .aps
            .get_mut(&index)
            .and_then(Option::as_mut)
            .ok_or(Error::ApNotPresent { ap: index })?;

        let mut ap = MemAp::new(dp, state);
        match op(&mut ap, peripheral.as_deref_mut()) {
            Err(e) if e.is_sticky() => {
                tracing::warn!("AP {}: {}, clearing sticky errors and retrying", index, e);
                ap.debug_port().clear_sticky_errors()?;
                op(&mut ap, peripheral.as_deref_mut())
            }
            result => result,
        }
    }

    /// Read the bytes `start..end` through the connection.
    pub fn memory_read(&mut self, conn: &ConnectionId, start: u32, end: u32) -> Result<Vec<u8>, Error> {
        self.with_retry(conn, |ap, peripheral| match peripheral {
            Some(peripheral) => peripheral.memory_read(ap, start, end),
            None => ap.read_memory(start, end),
        })
    }

    /// Write `data` to `start` through the connection.
    pub fn memory_write(&mut self, conn: &ConnectionId, start: u32, data: &[u8]) -> Result<(), Error> {
        self.with_retry(conn, |ap, peripheral| match peripheral {
            Some(peripheral) => peripheral.memory_write(ap, start, data),
            None => ap.write_memory(start, data),
        })
    }

    /// Read core registers through the peripheral named in `conn`.
    pub fn register_read(&mut self, conn: &ConnectionId, registers: &[u32]) -> Result<Vec<u32>, Error> {
        self.with_retry(conn, |ap, peripheral| {
            require(peripheral)?.read_registers(ap, registers)
        })
    }

    /// Write core registers through the peripheral named in `conn`.
    pub fn register_write(
        &mut self,
        conn: &ConnectionId,
        registers: &[u32],
        values: &[u32],
    ) -> Result<(), Error> {
        if registers.len() != values.len() {
            return Err(Error::Other(anyhow::anyhow!(
                "{} registers but {} values",
                registers.len(),
                values.len()
            )));
        }
        self.with_retry(conn, |ap, peripheral| {
            require(peripheral)?.write_registers(ap, registers, values)
        })
    }

    /// Report the run state of the core behind the peripheral named in `conn`.
    pub fn run_ctrl_read(&mut self, conn: &ConnectionId) -> Result<CoreStatus, Error> {
        self.with_retry(conn, |ap, peripheral| require(peripheral)?.run_ctrl_read(ap))
    }

    /// Change the run state of the core behind the peripheral named in `conn`.
    pub fn run_ctrl_write(&mut self, conn: &ConnectionId, request: RunControl) -> Result<(), Error> {
        self.with_retry(conn, |ap, peripheral| {
            require(peripheral)?.run_ctrl_write(ap, request)
        })
    }

    /// Walk the access ports from index 0 up to the first absent one.
    ///
    /// Only IDR and CSW are read, connections are neither created nor modified.
    /// With `extra_details` the variant, designer, revision and CSW transfer state
    /// are included.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn scan_aps(&mut self, extra_details: bool) -> Result<Vec<ApDetails>, Error> {
        let dp = self.debug_port()?;
        let layout = ApLayout::for_debug_port(dp.version());

        let mut found = Vec::new();
        for index in 0..=u8::MAX {
            let idr = Idr(dp.read_ap_register(index, layout.register_address::<Idr>())?);
            if !idr.is_present() {
                break;
            }
            let csw = Csw(dp.read_ap_register(index, layout.register_address::<Csw>())?);

            let extra = extra_details.then(|| ApExtraDetails {
                variant: idr.variant(),
                designer: idr.designer_name(),
                revision: idr.revision(),
                access_size: csw.size(),
                transfer_in_progress: csw.tr_in_prog(),
            });
            found.push(ApDetails {
                index,
                class: idr.class(),
                ap_type: idr.ap_type(),
                enabled: csw.device_en(),
                extra,
            });
        }

        tracing::debug!("Found {} access ports", found.len());
        Ok(found)
    }

    /// Render [`scan_aps`](Self::scan_aps) as a text table.
    pub fn ap_scan(&mut self, detailed: bool) -> Result<String, Error> {
        let aps = self.scan_aps(detailed)?;

        let rows: Vec<Vec<String>> = aps
            .iter()
            .map(|ap| match &ap.extra {
                Some(extra) => vec![
                    ap.index.to_string(),
                    ap.description(),
                    extra.variant.to_string(),
                    extra.designer.to_string(),
                    extra.revision.to_string(),
                    extra
                        .access_size
                        .map_or("unknown", |size| size.name())
                        .to_string(),
                    yes_no(ap.enabled),
                    yes_no(extra.transfer_in_progress),
                ],
                None => vec![ap.index.to_string(), ap.description(), yes_no(ap.enabled)],
            })
            .collect();

        let header: &[&str] = if detailed {
            &[
                "Index",
                "Class and Bus Type",
                "Variant",
                "Designer",
                "Revision",
                "Access size",
                "Enabled?",
                "Xfer in progress?",
            ]
        } else {
            &["Index", "Class and Bus Type", "Enabled?"]
        };
        Ok(render_table(header, &rows))
    }

    /// Drop all connections and the debug port. The next access detects the debug
    /// port again.
    pub fn close(&mut self) {
        self.aps.clear();
        if let Some(dp) = self.dp.take() {
            self.probe = Some(dp.into_probe());
        }
    }

    /// Tear the transport down and return the backend.
    pub fn into_probe(mut self) -> Option<Box<dyn RawDapAccess>> {
        self.close();
        self.probe.take()
    }
}

fn require<'a>(
    peripheral: Option<&'a mut (dyn CorePeripheral + 'static)>,
) -> Result<&'a mut (dyn CorePeripheral + 'static), Error> {
    peripheral.ok_or(Error::Unsupported("core register access without a peripheral"))
}
