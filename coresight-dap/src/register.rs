//! Register layout descriptions.
//!
//! Typed registers (see [`dp`](crate::dp) and [`ap`](crate::ap)) are used on the hot
//! paths. The descriptor tables in this module describe the complete register maps per
//! architecture version, including registers which have no typed representation, and
//! are used for lookups by name and for diagnostics.

use std::fmt::Debug;

/// A register with a typed representation.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + Debug {
    /// Name of the register, as used in the architecture specification.
    const NAME: &'static str;
}

/// Whether a register can be read, written or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

/// A bit field inside a register, `lsb..=msb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field name.
    pub name: &'static str,
    /// Lowest bit of the field.
    pub lsb: u8,
    /// Highest bit of the field.
    pub msb: u8,
}

impl Field {
    /// Create a field spanning `lsb..=msb`.
    pub const fn new(name: &'static str, lsb: u8, msb: u8) -> Self {
        Field { name, lsb, msb }
    }

    /// Width of the field in bits.
    pub const fn width(&self) -> u8 {
        self.msb - self.lsb + 1
    }

    /// The field mask, in register position.
    pub const fn mask(&self) -> u32 {
        let unshifted = if self.width() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width()) - 1
        };
        unshifted << self.lsb
    }

    /// Extract the field value from a register value.
    pub const fn extract(&self, register: u32) -> u32 {
        (register & self.mask()) >> self.lsb
    }

    /// Replace the field in `register` with `value`. Excess bits of `value` are dropped.
    pub const fn insert(&self, register: u32, value: u32) -> u32 {
        (register & !self.mask()) | ((value << self.lsb) & self.mask())
    }
}

/// One entry of a register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    /// Register name.
    pub name: &'static str,
    /// Byte address of the register inside its port.
    pub address: u16,
    /// DP bank (SELECT.DPBANKSEL) the register lives in, if the address is banked.
    pub bank: Option<u8>,
    /// Access mode.
    pub access: Access,
    /// Bit fields, may be empty for plain data registers.
    pub fields: &'static [Field],
}

impl RegisterDescriptor {
    pub(crate) const fn new(
        name: &'static str,
        address: u16,
        bank: Option<u8>,
        access: Access,
        fields: &'static [Field],
    ) -> Self {
        RegisterDescriptor {
            name,
            address,
            bank,
            access,
            fields,
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Returns `true` if the register can be read.
    pub fn is_readable(&self) -> bool {
        self.access != Access::Write
    }

    /// Returns `true` if the register can be written.
    pub fn is_writable(&self) -> bool {
        self.access != Access::Read
    }
}

/// Look up a register by name in a register map.
pub fn find(
    table: &'static [RegisterDescriptor],
    name: &str,
) -> Option<&'static RegisterDescriptor> {
    table.iter().find(|register| register.name == name)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const SIZE: Field = Field::new("Size", 0, 2);
    const FULL: Field = Field::new("ADDR", 0, 31);

    #[test]
    fn field_mask_and_extract() {
        assert_eq!(SIZE.mask(), 0x7);
        assert_eq!(SIZE.extract(0x2300_0052), 2);
        assert_eq!(FULL.mask(), u32::MAX);
        assert_eq!(FULL.extract(0xdead_beef), 0xdead_beef);
    }

    #[test]
    fn field_insert_keeps_other_bits() {
        assert_eq!(SIZE.insert(0x2300_0052, 0), 0x2300_0050);
        // Excess bits are dropped
        assert_eq!(SIZE.insert(0, 0xf), 0x7);
    }
}
