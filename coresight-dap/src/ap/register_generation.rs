//! Helper macros for the access port registers.

/// Implements the conversions and the [`ApRegister`](super::ApRegister) trait for a
/// `bitfield!` register type. `$offset` is the ADIv5 register offset.
macro_rules! impl_ap_register {
    ($name:ident, $offset:expr, $display:expr) => {
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

        impl ApRegister for $name {
            const OFFSET: u16 = $offset;
        }
    };
}
