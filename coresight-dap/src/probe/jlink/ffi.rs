//! Binding to the J-Link shared library.
//!
//! Requires the library (`libjlinkarm` or `JLink_x64.dll`) on the linker search path.

use std::ffi::{c_char, c_int, c_void, CStr, CString};

use super::{JlinkApi, JlinkError, RegDescriptor};
use crate::config::{ProbeSelector, WireProtocol};

/// `JLINKARM_TIF_JTAG`
const TIF_JTAG: c_int = 0;
/// `JLINKARM_TIF_SWD`
const TIF_SWD: c_int = 1;

/// Index of `JLINK_CORESIGHT_AccAPDPRegMul` in the `JLINK_GetpFunc` table.
const IFUNC_CORESIGHT_ACC_APDP_REG_MUL: c_int = 24;

type AccApdpRegMul = unsafe extern "system" fn(*mut RegDescriptor, c_int) -> c_int;

#[cfg_attr(windows, link(name = "JLink_x64"))]
#[cfg_attr(not(windows), link(name = "jlinkarm"))]
extern "C" {
    fn JLINKARM_EMU_SelectByUSBSN(serial_no: u32) -> c_int;
    fn JLINKARM_SelectIP(host: *const c_char, port: c_int) -> c_int;
    fn JLINKARM_Open() -> *const c_char;
    fn JLINKARM_Close();
    fn JLINKARM_TIF_Select(interface: c_int) -> c_int;
    fn JLINKARM_SetSpeed(speed_khz: u32);
    fn JLINKARM_CORESIGHT_Configure(config: *const c_char) -> c_int;
    fn JLINKARM_CORESIGHT_ReadAPDPReg(reg_index: u8, ap_n_dp: u8, data: *mut u32) -> c_int;
    fn JLINKARM_CORESIGHT_WriteAPDPReg(reg_index: u8, ap_n_dp: u8, data: u32) -> c_int;
    fn JLINKARM_JTAG_StoreInst(tdi: *const u8, num_bits: u32) -> c_int;
    fn JLINKARM_JTAG_StoreGetData(tdi: *const u8, tdo: *mut u8, num_bits: u32);
}

#[cfg_attr(windows, link(name = "JLink_x64"))]
#[cfg_attr(not(windows), link(name = "jlinkarm"))]
extern "system" {
    fn JLINK_GetpFunc(index: c_int) -> *const c_void;
    fn JLINK_SWD_StoreGetRaw(direction: *const u8, data: *const u8, input: *mut u8, num_bits: u32);
}

/// The J-Link shared library.
///
/// The library keeps one global connection, so only one `JlinkDll` should exist at a
/// time. The connection is closed on drop.
#[derive(Debug, Default)]
pub struct JlinkDll {
    multi_access: Option<AccApdpRegMul>,
    is_open: bool,
}

impl JlinkDll {
    /// A handle to the library. Nothing is called until [`JlinkApi::open`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for JlinkDll {
    fn drop(&mut self) {
        if self.is_open {
            // SAFETY: the connection was opened by `open`.
            unsafe { JLINKARM_Close() };
        }
    }
}

fn check(call: &'static str, code: c_int) -> Result<(), JlinkError> {
    if code < 0 {
        tracing::error!("{} returned {}", call, code);
        Err(JlinkError::Call { call, code })
    } else {
        Ok(())
    }
}

impl JlinkApi for JlinkDll {
    fn open(&mut self, selector: Option<&ProbeSelector>) -> Result<(), JlinkError> {
        match selector {
            Some(ProbeSelector::Serial(serial)) => {
                // SAFETY: plain value argument.
                if unsafe { JLINKARM_EMU_SelectByUSBSN(*serial) } < 0 {
                    return Err(JlinkError::NotFound(format!("serial {serial}")));
                }
            }
            Some(ProbeSelector::Ip(host)) => {
                let c_host = CString::new(host.as_str())
                    .map_err(|_| JlinkError::NotFound(format!("ip {host}")))?;
                // SAFETY: `c_host` is a valid C string for the duration of the call.
                if unsafe { JLINKARM_SelectIP(c_host.as_ptr(), 0) } < 0 {
                    return Err(JlinkError::NotFound(format!("ip {host}")));
                }
            }
            None => {}
        }

        // SAFETY: returns null or a pointer to a static error string.
        let message = unsafe { JLINKARM_Open() };
        if !message.is_null() {
            // SAFETY: checked for null, the library returns a C string.
            let message = unsafe { CStr::from_ptr(message) };
            return Err(JlinkError::Open(message.to_string_lossy().into_owned()));
        }
        self.is_open = true;

        // SAFETY: plain value argument.
        let function = unsafe { JLINK_GetpFunc(IFUNC_CORESIGHT_ACC_APDP_REG_MUL) };
        self.multi_access = if function.is_null() {
            None
        } else {
            // SAFETY: table entry 24 has this signature.
            Some(unsafe { std::mem::transmute::<*const c_void, AccApdpRegMul>(function) })
        };
        Ok(())
    }

    fn select_interface(&mut self, protocol: WireProtocol) -> Result<(), JlinkError> {
        let interface = match protocol {
            WireProtocol::Jtag => TIF_JTAG,
            WireProtocol::Swd => TIF_SWD,
        };
        // SAFETY: plain value argument.
        if unsafe { JLINKARM_TIF_Select(interface) } < 0 {
            return Err(JlinkError::InterfaceNotSupported(protocol));
        }
        Ok(())
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<(), JlinkError> {
        // SAFETY: plain value argument.
        unsafe { JLINKARM_SetSpeed(speed_khz) };
        Ok(())
    }

    fn coresight_configure(&mut self, settings: &str) -> Result<(), JlinkError> {
        let c_settings = CString::new(settings).map_err(|_| JlinkError::Call {
            call: "JLINKARM_CORESIGHT_Configure",
            code: -1,
        })?;
        // SAFETY: `c_settings` is a valid C string for the duration of the call.
        let code = unsafe { JLINKARM_CORESIGHT_Configure(c_settings.as_ptr()) };
        check("JLINKARM_CORESIGHT_Configure", code)
    }

    fn read_apdp_reg(&mut self, index: u8, ap_n_dp: bool, value: &mut u32) -> i32 {
        // SAFETY: `value` is a valid pointer for the duration of the call.
        unsafe { JLINKARM_CORESIGHT_ReadAPDPReg(index, u8::from(ap_n_dp), value) }
    }

    fn write_apdp_reg(&mut self, index: u8, ap_n_dp: bool, value: u32) -> i32 {
        // SAFETY: plain value arguments.
        unsafe { JLINKARM_CORESIGHT_WriteAPDPReg(index, u8::from(ap_n_dp), value) }
    }

    fn has_apdp_reg_multiple(&mut self) -> bool {
        self.multi_access.is_some()
    }

    fn apdp_reg_multiple(&mut self, descriptors: &mut [RegDescriptor]) -> i32 {
        let Some(function) = self.multi_access else {
            return -1;
        };
        let Ok(count) = c_int::try_from(descriptors.len()) else {
            return -1;
        };
        // SAFETY: the descriptors are `repr(C)` and live for the duration of the call.
        unsafe { function(descriptors.as_mut_ptr(), count) }
    }

    fn swd_store_get_raw(
        &mut self,
        direction: &[u8],
        data: &[u8],
        num_bits: usize,
    ) -> Result<Vec<u8>, JlinkError> {
        let bytes = num_bits.div_ceil(8);
        if direction.len() < bytes || data.len() < bytes {
            return Err(JlinkError::Call {
                call: "JLINK_SWD_StoreGetRaw",
                code: -1,
            });
        }

        let mut input = vec![0u8; bytes];
        // SAFETY: all buffers hold at least `num_bits` bits.
        unsafe {
            JLINK_SWD_StoreGetRaw(
                direction.as_ptr(),
                data.as_ptr(),
                input.as_mut_ptr(),
                num_bits as u32,
            )
        };
        Ok(input)
    }

    fn jtag_store_inst(&mut self, tdi: &[u8], num_bits: usize) -> Result<(), JlinkError> {
        if tdi.len() * 8 < num_bits {
            return Err(JlinkError::Call {
                call: "JLINKARM_JTAG_StoreInst",
                code: -1,
            });
        }
        // SAFETY: `tdi` holds at least `num_bits` bits.
        let code = unsafe { JLINKARM_JTAG_StoreInst(tdi.as_ptr(), num_bits as u32) };
        check("JLINKARM_JTAG_StoreInst", code)
    }

    fn jtag_store_get_data(
        &mut self,
        tdi: &[u8],
        num_bits: usize,
    ) -> Result<Vec<u8>, JlinkError> {
        let bytes = num_bits.div_ceil(8);
        if tdi.len() < bytes {
            return Err(JlinkError::Call {
                call: "JLINKARM_JTAG_StoreGetData",
                code: -1,
            });
        }

        let mut tdo = vec![0u8; bytes];
        // SAFETY: both buffers hold at least `num_bits` bits.
        unsafe { JLINKARM_JTAG_StoreGetData(tdi.as_ptr(), tdo.as_mut_ptr(), num_bits as u32) };
        Ok(tdo)
    }
}
