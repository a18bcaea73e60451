//! MEM-AP register model.
//!
//! ADIv5 access ports place CSW, TAR and DRW at the start of their register space.
//! ADIv6 access ports are CoreSight components with the same registers moved to
//! offset `0xD00` and the component identification registers at the top of the 4 KiB
//! block. Typed registers carry their ADIv5 offset; [`ApLayout::address`] translates.

#[macro_use]
mod register_generation;

use crate::dp::DebugPortVersion;
use crate::register::{Access, Field, Register, RegisterDescriptor};
use bitfield::bitfield;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

/// The register layout of an access port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApLayout {
    /// ADIv5, registers at offset `0x00`.
    V5,
    /// ADIv6, registers at offset `0xD00`.
    V6,
}

impl ApLayout {
    /// The layout used by access ports behind a debug port of the given version.
    pub fn for_debug_port(version: DebugPortVersion) -> Self {
        if version >= DebugPortVersion::DPv3 {
            ApLayout::V6
        } else {
            ApLayout::V5
        }
    }

    /// Translate an ADIv5 register offset into an address in this layout.
    pub fn address(&self, offset: u16) -> u16 {
        match self {
            ApLayout::V5 => offset,
            ApLayout::V6 => 0xd00 | offset,
        }
    }

    /// Address of the register `R` in this layout.
    pub fn register_address<R: ApRegister>(&self) -> u16 {
        self.address(R::OFFSET)
    }

    /// All registers of this layout.
    pub fn registers(&self) -> &'static [RegisterDescriptor] {
        match self {
            ApLayout::V5 => AP_V5_REGISTERS,
            ApLayout::V6 => AP_V6_REGISTERS,
        }
    }

    /// Look up a register of this layout by name.
    pub fn register(&self, name: &str) -> Option<&'static RegisterDescriptor> {
        crate::register::find(self.registers(), name)
    }
}

/// A typed MEM-AP register.
pub trait ApRegister: Register {
    /// Offset of the register in the ADIv5 layout.
    const OFFSET: u16;
}

/// Transfer size selected by CSW.Size.
#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DataSize {
    /// 8 bit.
    U8 = 0b000,
    /// 16 bit.
    U16 = 0b001,
    /// 32 bit.
    #[default]
    U32 = 0b010,
    /// 64 bit.
    U64 = 0b011,
    /// 128 bit.
    U128 = 0b100,
    /// 256 bit.
    U256 = 0b101,
}

impl DataSize {
    /// Name of the access size as used in diagnostic output.
    pub fn name(&self) -> &'static str {
        match self {
            DataSize::U8 => "byte",
            DataSize::U16 => "halfword",
            DataSize::U32 => "word",
            DataSize::U64 => "doubleword",
            DataSize::U128 => "128 bit",
            DataSize::U256 => "256 bit",
        }
    }

    /// Number of bytes transferred per access.
    pub fn bytes(&self) -> u32 {
        1 << (*self as u32)
    }
}

/// The address increment mode selected by CSW.AddrInc.
#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressIncrement {
    /// No increment.
    #[default]
    Off = 0b00,
    /// Increment TAR by the transfer size after each DRW access.
    Single = 0b01,
    /// Packed transfers, increment by the packed size.
    Packed = 0b10,
}

/// The bus behind a MEM-AP, from IDR.TYPE.
#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApType {
    /// JTAG-AP or COM-AP, no memory bus.
    JtagComAp = 0x0,
    /// AMBA AHB3.
    AmbaAhb3 = 0x1,
    /// AMBA APB2 or APB3.
    AmbaApb2Apb3 = 0x2,
    /// AMBA AXI3 or AXI4.
    AmbaAxi3Axi4 = 0x4,
    /// AMBA AHB5.
    AmbaAhb5 = 0x5,
    /// AMBA APB4.
    AmbaApb4 = 0x6,
}

impl ApType {
    /// The full bus name.
    pub fn name(&self) -> &'static str {
        match self {
            ApType::JtagComAp => "JTAG",
            ApType::AmbaAhb3 => "AMBA AHB3",
            ApType::AmbaApb2Apb3 => "AMBA APB2 or APB3",
            ApType::AmbaAxi3Axi4 => "AMBA AXI3 or AXI4",
            ApType::AmbaAhb5 => "AMBA AHB5",
            ApType::AmbaApb4 => "AMBA APB4",
        }
    }

    /// The bus family, without the protocol revision.
    pub fn short_name(&self) -> &'static str {
        match self {
            ApType::JtagComAp => "JTAG",
            ApType::AmbaAhb3 | ApType::AmbaAhb5 => "AHB",
            ApType::AmbaApb2Apb3 | ApType::AmbaApb4 => "APB",
            ApType::AmbaAxi3Axi4 => "AXI",
        }
    }

    /// Returns `true` for the AHB bus types.
    pub fn is_ahb(&self) -> bool {
        matches!(self, ApType::AmbaAhb3 | ApType::AmbaAhb5)
    }

    /// Returns `true` for the APB bus types.
    pub fn is_apb(&self) -> bool {
        matches!(self, ApType::AmbaApb2Apb3 | ApType::AmbaApb4)
    }
}

/// The class of an access port, from IDR.CLASS.
#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq)]
pub enum ApClass {
    /// No defined class.
    Undefined = 0b0000,
    /// COM-AP.
    ComAp = 0b0001,
    /// MEM-AP.
    MemAp = 0b1000,
}

impl ApClass {
    /// Short name of the class.
    pub fn name(&self) -> &'static str {
        match self {
            ApClass::Undefined => "Undefined",
            ApClass::ComAp => "COM-AP",
            ApClass::MemAp => "MEM-AP",
        }
    }
}

/// JEP106 code of Arm in the IDR.DESIGNER encoding.
pub const DESIGNER_ARM: u16 = 0x23b;

bitfield! {
    /// CSW, the control/status word.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub sdevice_en, _: 23;
    pub errstop, set_errstop: 17;
    pub errnpass, set_errnpass: 16;
    pub u8, ty, set_ty: 15, 12;
    pub u8, mode, set_mode: 11, 8;
    pub tr_in_prog, _: 7;
    pub device_en, _: 6;
    pub u8, addr_inc_raw, set_addr_inc_raw: 5, 4;
    pub u8, size_raw, set_size_raw: 2, 0;
}

impl_ap_register!(Csw, 0x00, "CSW");

impl Csw {
    /// The decoded transfer size, `None` for reserved encodings.
    pub fn size(&self) -> Option<DataSize> {
        DataSize::from_u8(self.size_raw())
    }

    /// Set the transfer size.
    pub fn set_size(&mut self, size: DataSize) {
        self.set_size_raw(size as u8);
    }

    /// The decoded address increment mode, `None` for the reserved encoding.
    pub fn addr_inc(&self) -> Option<AddressIncrement> {
        AddressIncrement::from_u8(self.addr_inc_raw())
    }

    /// Set the address increment mode.
    pub fn set_addr_inc(&mut self, increment: AddressIncrement) {
        self.set_addr_inc_raw(increment as u8);
    }
}

bitfield! {
    /// TAR, the transfer address.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Tar(u32);
    impl Debug;
    pub u32, address, set_address: 31, 0;
}

impl_ap_register!(Tar, 0x04, "TAR");

bitfield! {
    /// DRW, the data read/write register.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Drw(u32);
    impl Debug;
    pub u32, data, set_data: 31, 0;
}

impl_ap_register!(Drw, 0x0c, "DRW");

bitfield! {
    /// CFG, the configuration register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Cfg(u32);
    impl Debug;
    pub ld, _: 2;
    pub la, _: 1;
    pub be, _: 0;
}

impl_ap_register!(Cfg, 0xf4, "CFG");

bitfield! {
    /// BASE, the debug base address.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Base(u32);
    impl Debug;
    pub u32, baseaddr, _: 31, 12;
    pub format, _: 1;
    pub present, _: 0;
}

impl_ap_register!(Base, 0xf8, "BASE");

bitfield! {
    /// IDR, the identification register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Idr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u16, designer, _: 27, 17;
    pub u8, class_raw, _: 16, 13;
    pub u8, variant, _: 7, 4;
    pub u8, type_raw, _: 3, 0;
}

impl_ap_register!(Idr, 0xfc, "IDR");

impl Idr {
    /// An IDR of zero means there is no access port at this index.
    pub fn is_present(&self) -> bool {
        self.0 != 0
    }

    /// The decoded class, `None` for reserved encodings.
    pub fn class(&self) -> Option<ApClass> {
        ApClass::from_u8(self.class_raw())
    }

    /// The decoded bus type, `None` for reserved encodings.
    pub fn ap_type(&self) -> Option<ApType> {
        ApType::from_u8(self.type_raw())
    }

    /// Name of the designer, only Arm is recognised.
    pub fn designer_name(&self) -> &'static str {
        if self.designer() == DESIGNER_ARM {
            "Arm"
        } else {
            "Unknown"
        }
    }
}

const CSW_FIELDS: &[Field] = &[
    Field::new("Size", 0, 2),
    Field::new("AddrInc", 4, 5),
    Field::new("DeviceEn", 6, 6),
    Field::new("TrInProg", 7, 7),
    Field::new("Mode", 8, 11),
    Field::new("Type", 12, 15),
    Field::new("ERRNPASS", 16, 16),
    Field::new("ERRSTOP", 17, 17),
    Field::new("SDeviceEn", 23, 23),
    Field::new("Prot", 24, 30),
    Field::new("DbgSwEnable", 31, 31),
];

const IDR_FIELDS: &[Field] = &[
    Field::new("TYPE", 0, 3),
    Field::new("VARIANT", 4, 7),
    Field::new("CLASS", 13, 16),
    Field::new("DESIGNER", 17, 27),
    Field::new("REVISION", 28, 31),
];

const CFG_FIELDS: &[Field] = &[
    Field::new("BE", 0, 0),
    Field::new("LA", 1, 1),
    Field::new("LD", 2, 2),
];

const BASE_FIELDS: &[Field] = &[
    Field::new("P", 0, 0),
    Field::new("Format", 1, 1),
    Field::new("BASEADDR", 12, 31),
];

const WORD: &[Field] = &[];

static AP_V5_REGISTERS: &[RegisterDescriptor] = &[
    RegisterDescriptor::new("CSW", 0x00, None, Access::ReadWrite, CSW_FIELDS),
    RegisterDescriptor::new("TAR", 0x04, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("DRW", 0x0c, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD0", 0x10, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD1", 0x14, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD2", 0x18, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD3", 0x1c, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("MBT", 0x20, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("CFG", 0xf4, None, Access::Read, CFG_FIELDS),
    RegisterDescriptor::new("BASE", 0xf8, None, Access::Read, BASE_FIELDS),
    RegisterDescriptor::new("IDR", 0xfc, None, Access::Read, IDR_FIELDS),
];

static AP_V6_REGISTERS: &[RegisterDescriptor] = &[
    RegisterDescriptor::new("CSW", 0xd00, None, Access::ReadWrite, CSW_FIELDS),
    RegisterDescriptor::new("TAR", 0xd04, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("DRW", 0xd0c, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD0", 0xd10, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD1", 0xd14, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD2", 0xd18, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("BD3", 0xd1c, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("MBT", 0xd20, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("TRR", 0xd24, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("T0TR", 0xd30, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("CFG1", 0xde0, None, Access::Read, WORD),
    RegisterDescriptor::new("CFG", 0xdf4, None, Access::Read, CFG_FIELDS),
    RegisterDescriptor::new("BASE", 0xdf8, None, Access::Read, BASE_FIELDS),
    RegisterDescriptor::new("IDR", 0xdfc, None, Access::Read, IDR_FIELDS),
    RegisterDescriptor::new("ITCTRL", 0xf00, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("CLAIMSET", 0xfa0, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("CLAIMCLR", 0xfa4, None, Access::ReadWrite, WORD),
    RegisterDescriptor::new("LAR", 0xfb0, None, Access::Write, WORD),
    RegisterDescriptor::new("LSR", 0xfb4, None, Access::Read, WORD),
    RegisterDescriptor::new("AUTHSTATUS", 0xfb8, None, Access::Read, WORD),
    RegisterDescriptor::new("DEVARCH", 0xfbc, None, Access::Read, WORD),
    RegisterDescriptor::new("DEVTYPE", 0xfcc, None, Access::Read, WORD),
    RegisterDescriptor::new("PIDR4", 0xfd0, None, Access::Read, WORD),
    RegisterDescriptor::new("PIDR0", 0xfe0, None, Access::Read, WORD),
    RegisterDescriptor::new("PIDR1", 0xfe4, None, Access::Read, WORD),
    RegisterDescriptor::new("PIDR2", 0xfe8, None, Access::Read, WORD),
    RegisterDescriptor::new("PIDR3", 0xfec, None, Access::Read, WORD),
    RegisterDescriptor::new("CIDR0", 0xff0, None, Access::Read, WORD),
    RegisterDescriptor::new("CIDR1", 0xff4, None, Access::Read, WORD),
    RegisterDescriptor::new("CIDR2", 0xff8, None, Access::Read, WORD),
    RegisterDescriptor::new("CIDR3", 0xffc, None, Access::Read, WORD),
];
