//! Helper macros for the debug port registers.

/// Implements the conversions and the [`DpRegister`](super::DpRegister) trait for a
/// `bitfield!` register type.
macro_rules! impl_dp_register {
    ($name:ident, $address:expr, $bank:expr, $display:expr) => {
        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(raw: $name) -> Self {
                raw.0
            }
        }

        impl Register for $name {
            const NAME: &'static str = $display;
        }

        impl DpRegister for $name {
            const ADDRESS: u8 = $address;
            const BANK: DpBank = $bank;
        }
    };
}
