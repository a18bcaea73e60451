//! Debug port register model.
//!
//! Register layouts follow section B2.2 of the ARM Debug Interface Architecture
//! Specification (IHI0031 for DPv1/DPv2, IHI0074 for DPv3).

#[macro_use]
mod register_generation;
mod port;

pub use port::DebugPort;
pub(crate) use port::verify_target_selection;

use crate::error::Error;
use crate::probe::{PortType, RawDapAccess};
use crate::register::{Access, Field, Register, RegisterDescriptor};
use bitfield::bitfield;
use jep106::JEP106Code;

/// The DP bank (SELECT.DPBANKSEL) a register is accessed through.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DpBank {
    /// The register address is not banked.
    DontCare,
    /// The register is only visible with DPBANKSEL set to this value.
    Bank(u8),
}

/// A typed debug port register.
pub trait DpRegister: Register {
    /// Byte address of the register, only bits [3:2] are used on the wire.
    const ADDRESS: u8;
    /// DP bank of the register.
    const BANK: DpBank;
}

bitfield! {
    /// ABORT, write only.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl_dp_register!(Abort, 0x0, DpBank::DontCare, "ABORT");

bitfield! {
    /// DPIDR, the debug port identification register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Dpidr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    pub u16, designer, _: 11, 1;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

impl_dp_register!(Dpidr, 0x0, DpBank::Bank(0), "DPIDR");

bitfield! {
    /// DPIDR1, DPv3 only.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Dpidr1(u32);
    impl Debug;
    pub errmode, _: 7;
    pub u8, asize, _: 6, 0;
}

impl_dp_register!(Dpidr1, 0x0, DpBank::Bank(1), "DPIDR1");

bitfield! {
    /// BASEPTR0, DPv3 only.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct BasePtr0(u32);
    impl Debug;
    pub u32, ptr, _: 31, 12;
    pub valid, _: 0;
}

impl_dp_register!(BasePtr0, 0x0, DpBank::Bank(2), "BASEPTR0");

bitfield! {
    /// BASEPTR1, DPv3 only.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct BasePtr1(u32);
    impl Debug;
    pub u32, ptr, _: 31, 0;
}

impl_dp_register!(BasePtr1, 0x0, DpBank::Bank(3), "BASEPTR1");

bitfield! {
    /// CTRL/STAT, the control and status register.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub cdbgrstreq, set_cdbgrstreq: 26;
    pub errmode, set_errmode: 24;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub wdataerr, _: 7;
    pub readok, _: 6;
    pub stickyerr, _: 5;
    pub stickycmp, _: 4;
    pub u8, trn_mode, set_trn_mode: 3, 2;
    pub stickyorun, _: 1;
    pub orundetect, set_orundetect: 0;
}

impl_dp_register!(Ctrl, 0x4, DpBank::Bank(0), "CTRL/STAT");

impl Ctrl {
    /// Mask of both power-up acknowledge and request bits.
    pub const POWER_MASK: u32 = 0xf000_0000;

    /// Returns `true` if any of the four sticky error flags is set.
    pub fn has_sticky_errors(&self) -> bool {
        self.stickyerr() || self.stickycmp() || self.stickyorun() || self.wdataerr()
    }

    /// Returns `true` if both power-up requests are acknowledged.
    pub fn powered_up(&self) -> bool {
        self.csyspwrupack() && self.cdbgpwrupack()
    }
}

bitfield! {
    /// DLCR, the data link control register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Dlcr(u32);
    impl Debug;
    pub u8, turnround, set_turnround: 9, 8;
}

impl_dp_register!(Dlcr, 0x4, DpBank::Bank(1), "DLCR");

bitfield! {
    /// TARGETID, DPv2 and later.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TargetId(u32);
    impl Debug;
    pub u8, trevision, _: 31, 28;
    pub u16, tpartno, _: 27, 12;
    pub u16, tdesigner, _: 11, 1;
}

impl_dp_register!(TargetId, 0x4, DpBank::Bank(2), "TARGETID");

bitfield! {
    /// DLPIDR, DPv2 and later.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Dlpidr(u32);
    impl Debug;
    pub u8, tinstance, _: 31, 28;
    pub u8, protvsn, _: 3, 0;
}

impl_dp_register!(Dlpidr, 0x4, DpBank::Bank(3), "DLPIDR");

bitfield! {
    /// EVENTSTAT, DPv2 and later.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventStat(u32);
    impl Debug;
    pub ea, _: 0;
}

impl_dp_register!(EventStat, 0x4, DpBank::Bank(4), "EVENTSTAT");

bitfield! {
    /// SELECT1, the upper half of the 64-bit AP address, DPv3 only.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Select1(u32);
    impl Debug;
    pub u32, addr, set_addr: 31, 0;
}

impl_dp_register!(Select1, 0x4, DpBank::Bank(5), "SELECT1");

bitfield! {
    /// SELECT, write only.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u16, ap_bank_sel, set_ap_bank_sel: 11, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl_dp_register!(Select, 0x8, DpBank::DontCare, "SELECT");

bitfield! {
    /// RDBUFF, the read buffer.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RdBuff(u32);
    impl Debug;
    pub u32, data, _: 31, 0;
}

impl_dp_register!(RdBuff, 0xc, DpBank::DontCare, "RDBUFF");

bitfield! {
    /// TARGETSEL, write only, DPv2 and later.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TargetSel(u32);
    impl Debug;
    pub u8, tinstance, set_tinstance: 31, 28;
    pub u16, tpartno, set_tpartno: 27, 12;
    pub u16, tdesigner, set_tdesigner: 11, 1;
}

impl_dp_register!(TargetSel, 0xc, DpBank::DontCare, "TARGETSEL");

/// Architecture version of a debug port.
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub enum DebugPortVersion {
    /// DPv1, ADIv5.0 onwards.
    DPv1,
    /// DPv2, ADIv5.2, adds TARGETID, DLPIDR, EVENTSTAT and TARGETSEL.
    DPv2,
    /// DPv3, ADIv6.0, adds DPIDR1, BASEPTR0/1 and SELECT1.
    DPv3,
}

impl DebugPortVersion {
    /// Decode the DPIDR.VERSION field.
    ///
    /// Version 0 denotes legacy silicon without the field and is treated as DPv1.
    pub fn from_field(version: u8) -> Result<Self, Error> {
        match version {
            0 | 1 => Ok(DebugPortVersion::DPv1),
            2 => Ok(DebugPortVersion::DPv2),
            3 => Ok(DebugPortVersion::DPv3),
            version => Err(Error::VersionUnsupported { version }),
        }
    }

    /// The numeric architecture version.
    pub fn number(&self) -> u8 {
        match self {
            DebugPortVersion::DPv1 => 1,
            DebugPortVersion::DPv2 => 2,
            DebugPortVersion::DPv3 => 3,
        }
    }

    /// All registers of this debug port version.
    pub fn registers(&self) -> impl Iterator<Item = &'static RegisterDescriptor> {
        let v2 = if *self >= DebugPortVersion::DPv2 {
            DP_V2_REGISTERS
        } else {
            &[]
        };
        let v3 = if *self >= DebugPortVersion::DPv3 {
            DP_V3_REGISTERS
        } else {
            &[]
        };
        DP_V1_REGISTERS.iter().chain(v2).chain(v3)
    }

    /// Look up a register of this debug port version by name.
    pub fn register(&self, name: &str) -> Option<&'static RegisterDescriptor> {
        self.registers().find(|register| register.name == name)
    }

    /// Returns `true` if accesses to `address` depend on SELECT.DPBANKSEL.
    pub(crate) fn is_banked(&self, address: u8) -> bool {
        match address & 0xc {
            0x4 => true,
            0x0 => *self >= DebugPortVersion::DPv3,
            _ => false,
        }
    }
}

impl std::fmt::Display for DebugPortVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DPv{}", self.number())
    }
}

/// Read DPIDR and determine the debug port version.
///
/// Returns `None` if DPIDR reads back as all ones, which means there is no debug port.
#[tracing::instrument(level = "debug", skip(probe))]
pub fn detect_version(probe: &mut dyn RawDapAccess) -> Result<Option<DebugPortVersion>, Error> {
    let dpidr = probe.raw_read_register(PortType::DebugPort, Dpidr::ADDRESS)?;
    if dpidr == 0xffff_ffff {
        tracing::debug!("DPIDR reads as all ones, no debug port");
        return Ok(None);
    }

    let version = DebugPortVersion::from_field(Dpidr(dpidr).version())?;
    tracing::debug!("Detected {} (DPIDR = {:#010x})", version, dpidr);
    Ok(Some(version))
}

/// Identification data decoded from DPIDR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugPortId {
    /// Revision of the debug port implementation.
    pub revision: u8,
    /// Part number of the debug port.
    pub part_no: u8,
    /// Whether the minimal debug port extension is implemented.
    pub min_dp_support: bool,
    /// Raw DPIDR.VERSION value.
    pub version: u8,
    /// Designer of the debug port.
    pub designer: JEP106Code,
}

impl From<Dpidr> for DebugPortId {
    fn from(dpidr: Dpidr) -> DebugPortId {
        DebugPortId {
            revision: dpidr.revision(),
            part_no: dpidr.part_no(),
            min_dp_support: dpidr.min(),
            version: dpidr.version(),
            designer: JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()),
        }
    }
}

impl std::fmt::Display for DebugPortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DPv{} part {:#04x} rev {} by {}",
            self.version,
            self.part_no,
            self.revision,
            self.designer.get().unwrap_or("<unknown>")
        )
    }
}

/// Identification of the target behind a DPv2 or later debug port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipVersion {
    /// TARGETID.TDESIGNER, a JEP106 code.
    pub designer: u16,
    /// TARGETID.TPARTNO.
    pub part_no: u16,
    /// TARGETID.TREVISION.
    pub revision: u8,
    /// DLPIDR.TINSTANCE.
    pub instance: u8,
}

impl ChipVersion {
    /// Name of the designer, if the JEP106 code is known.
    pub fn designer_name(&self) -> Option<&'static str> {
        let cc = ((self.designer >> 7) & 0xf) as u8;
        let id = (self.designer & 0x7f) as u8;
        JEP106Code::new(cc, id).get()
    }
}

const ABORT_FIELDS: &[Field] = &[
    Field::new("DAPABORT", 0, 0),
    Field::new("STKCMPCLR", 1, 1),
    Field::new("STKERRCLR", 2, 2),
    Field::new("WDERRCLR", 3, 3),
    Field::new("ORUNERRCLR", 4, 4),
];

const DPIDR_FIELDS: &[Field] = &[
    Field::new("DESIGNER", 1, 11),
    Field::new("VERSION", 12, 15),
    Field::new("MIN", 16, 16),
    Field::new("PARTNO", 20, 27),
    Field::new("REVISION", 28, 31),
];

const CTRL_STAT_FIELDS: &[Field] = &[
    Field::new("ORUNDETECT", 0, 0),
    Field::new("STICKYORUN", 1, 1),
    Field::new("TRNMODE", 2, 3),
    Field::new("STICKYCMP", 4, 4),
    Field::new("STICKYERR", 5, 5),
    Field::new("READOK", 6, 6),
    Field::new("WDATAERR", 7, 7),
    Field::new("MASKLANE", 8, 11),
    Field::new("TRNCNT", 12, 23),
    Field::new("ERRMODE", 24, 24),
    Field::new("CDBGRSTREQ", 26, 26),
    Field::new("CDBGRSTACK", 27, 27),
    Field::new("CDBGPWRUPREQ", 28, 28),
    Field::new("CDBGPWRUPACK", 29, 29),
    Field::new("CSYSPWRUPREQ", 30, 30),
    Field::new("CSYSPWRUPACK", 31, 31),
];

const TARGET_FIELDS: &[Field] = &[
    Field::new("TDESIGNER", 1, 11),
    Field::new("TPARTNO", 12, 27),
    Field::new("TREVISION", 28, 31),
];

static DP_V1_REGISTERS: &[RegisterDescriptor] = &[
    RegisterDescriptor::new("ABORT", 0x0, None, Access::Write, ABORT_FIELDS),
    RegisterDescriptor::new("DPIDR", 0x0, Some(0), Access::Read, DPIDR_FIELDS),
    RegisterDescriptor::new(
        "CTRL_STAT",
        0x4,
        Some(0),
        Access::ReadWrite,
        CTRL_STAT_FIELDS,
    ),
    RegisterDescriptor::new(
        "DLCR",
        0x4,
        Some(1),
        Access::ReadWrite,
        &[Field::new("TURNROUND", 8, 9)],
    ),
    RegisterDescriptor::new("RESEND", 0x8, None, Access::Read, &[]),
    RegisterDescriptor::new(
        "SELECT",
        0x8,
        None,
        Access::Write,
        &[Field::new("DPBANKSEL", 0, 3), Field::new("ADDR", 4, 31)],
    ),
    RegisterDescriptor::new("RDBUFF", 0xc, None, Access::Read, &[]),
];

static DP_V2_REGISTERS: &[RegisterDescriptor] = &[
    RegisterDescriptor::new("TARGETID", 0x4, Some(2), Access::Read, TARGET_FIELDS),
    RegisterDescriptor::new(
        "DLPIDR",
        0x4,
        Some(3),
        Access::Read,
        &[Field::new("PROTVSN", 0, 3), Field::new("TINSTANCE", 28, 31)],
    ),
    RegisterDescriptor::new(
        "EVENTSTAT",
        0x4,
        Some(4),
        Access::Read,
        &[Field::new("EA", 0, 0)],
    ),
    RegisterDescriptor::new("TARGETSEL", 0xc, None, Access::Write, TARGET_FIELDS),
];

static DP_V3_REGISTERS: &[RegisterDescriptor] = &[
    RegisterDescriptor::new(
        "DPIDR1",
        0x0,
        Some(1),
        Access::Read,
        &[Field::new("ASIZE", 0, 6), Field::new("ERRMODE", 7, 7)],
    ),
    RegisterDescriptor::new(
        "BASEPTR0",
        0x0,
        Some(2),
        Access::Read,
        &[Field::new("VALID", 0, 0), Field::new("PTR", 12, 31)],
    ),
    RegisterDescriptor::new(
        "BASEPTR1",
        0x0,
        Some(3),
        Access::Read,
        &[Field::new("PTR", 0, 31)],
    ),
    RegisterDescriptor::new(
        "SELECT1",
        0x4,
        Some(5),
        Access::ReadWrite,
        &[Field::new("ADDR", 0, 31)],
    ),
];

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::mock::MockDap;
    use test_case::test_case;

    #[test_case(0x0ba0_0477 => Some(DebugPortVersion::DPv1); "legacy version zero")]
    #[test_case(0x2ba0_1477 => Some(DebugPortVersion::DPv1); "dpv1")]
    #[test_case(0x6ba0_2477 => Some(DebugPortVersion::DPv2); "dpv2")]
    #[test_case(0x0ba0_3477 => Some(DebugPortVersion::DPv3); "dpv3")]
    #[test_case(0xffff_ffff => None; "absent")]
    fn version_detection(dpidr: u32) -> Option<DebugPortVersion> {
        let mut mock = MockDap::new(dpidr);
        detect_version(&mut mock).expect("DPIDR read succeeds")
    }

    #[test]
    fn absent_debug_port_is_probed_once() {
        let mut mock = MockDap::new(0xffff_ffff);
        assert_eq!(detect_version(&mut mock).unwrap(), None);
        assert_eq!(mock.dp_reads(), 1);
        assert!(mock.select_writes().is_empty());
    }

    #[test]
    fn unsupported_version() {
        let mut mock = MockDap::new(0x0ba0_4477);
        let err = detect_version(&mut mock).unwrap_err();
        assert!(matches!(err, Error::VersionUnsupported { version: 4 }));
    }

    #[test]
    fn register_tables_grow_with_version() {
        let names = |version: DebugPortVersion| {
            version
                .registers()
                .map(|register| register.name)
                .collect::<Vec<_>>()
        };
        assert!(!names(DebugPortVersion::DPv1).contains(&"TARGETID"));
        assert!(names(DebugPortVersion::DPv2).contains(&"TARGETID"));
        assert!(!names(DebugPortVersion::DPv2).contains(&"DPIDR1"));
        assert!(names(DebugPortVersion::DPv3).contains(&"SELECT1"));

        let ctrl = DebugPortVersion::DPv1.register("CTRL_STAT").unwrap();
        let ack = ctrl.field("CDBGPWRUPACK").unwrap();
        assert_eq!(ack.extract(0x2000_0000), 1);
    }

    #[test]
    fn typed_fields_match_table() {
        let ctrl = Ctrl(0xa000_00a2);
        assert!(ctrl.has_sticky_errors());
        assert!(ctrl.powered_up());
        assert!(ctrl.stickyerr());
        assert!(ctrl.wdataerr());
        assert!(ctrl.stickyorun());
        assert!(!ctrl.stickycmp());

        let table = DebugPortVersion::DPv1.register("CTRL_STAT").unwrap();
        assert_eq!(table.field("STICKYERR").unwrap().extract(ctrl.0), 1);
    }

    #[test]
    fn dpidr_decoding() {
        let id = DebugPortId::from(Dpidr(0x2ba0_1477));
        assert_eq!(id.version, 1);
        assert_eq!(id.part_no, 0xba);
        assert_eq!(id.revision, 2);
        assert_eq!(id.designer.get(), Some("ARM Ltd"));
    }

    #[test]
    fn banked_addresses() {
        assert!(DebugPortVersion::DPv1.is_banked(0x4));
        assert!(!DebugPortVersion::DPv2.is_banked(0x0));
        assert!(DebugPortVersion::DPv3.is_banked(0x0));
        assert!(!DebugPortVersion::DPv3.is_banked(0xc));
    }
}
