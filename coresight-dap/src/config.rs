//! Backend selection.
//!
//! A [`TransportConfig`] names the wire protocol, the clock speed and the probe to use.
//! It is usually loaded from YAML:
//!
//! ```yaml
//! protocol: swd
//! speed_khz: 1000
//! probe: 600111234
//! target_select:
//!   targetid: 0x01002927
//!   instance: 1
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::Error;

fn hex_u32<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    if serializer.is_human_readable() {
        serializer.serialize_str(&format!("{value:#x}"))
    } else {
        serializer.serialize_u32(*value)
    }
}

/// The wire protocol between probe and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Serial Wire Debug.
    #[default]
    Swd,
    /// JTAG, with the DAP behind a JTAG-DP.
    Jtag,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireProtocol::Swd => f.write_str("SWD"),
            WireProtocol::Jtag => f.write_str("JTAG"),
        }
    }
}

impl FromStr for WireProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "swd" => Ok(WireProtocol::Swd),
            "jtag" => Ok(WireProtocol::Jtag),
            _ => Err(format!(
                "'{s}' is not a valid protocol. Choose from [swd, jtag]."
            )),
        }
    }
}

/// Selects one probe if several are connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeSelector {
    /// The USB serial number of the probe.
    Serial(u32),
    /// Host name or IP address of a networked probe.
    Ip(String),
}

impl FromStr for ProbeSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<u32>() {
            Ok(serial) => ProbeSelector::Serial(serial),
            Err(_) => ProbeSelector::Ip(s.to_owned()),
        })
    }
}

impl fmt::Display for ProbeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeSelector::Serial(serial) => write!(f, "serial {serial}"),
            ProbeSelector::Ip(address) => write!(f, "ip {address}"),
        }
    }
}

/// Position of the DAP's TAP on a JTAG scan chain.
///
/// The `pre` counts are the bits of the devices between the DAP and TDO, the `post`
/// counts those between TDI and the DAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanChain {
    /// Total IR length of the devices before the DAP.
    pub ir_pre: u16,
    /// Total IR length of the devices after the DAP.
    pub ir_post: u16,
    /// Number of devices before the DAP, one bypass bit each.
    pub dr_pre: u16,
    /// Number of devices after the DAP, one bypass bit each.
    pub dr_post: u16,
    /// IR length of the DAP itself.
    pub ir_len: u8,
}

impl Default for ScanChain {
    fn default() -> Self {
        ScanChain {
            ir_pre: 0,
            ir_post: 0,
            dr_pre: 0,
            dr_post: 0,
            ir_len: 4,
        }
    }
}

impl ScanChain {
    /// Render the chain in the `key=value;` form the J-Link library expects.
    pub fn settings_string(&self) -> String {
        format!(
            "IRPre={};DRPre={};IRPost={};DRPost={};IRLenDevice={}",
            self.ir_pre, self.dr_pre, self.ir_post, self.dr_post, self.ir_len
        )
    }

    /// Returns `true` if the DAP is the only device on the chain.
    pub fn is_single_device(&self) -> bool {
        self.ir_pre == 0 && self.ir_post == 0 && self.dr_pre == 0 && self.dr_post == 0
    }
}

/// A target on a multi-drop SWD bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSelect {
    /// TARGETID of the target, without the revision field.
    #[serde(serialize_with = "hex_u32")]
    pub targetid: u32,
    /// Instance number, compared against DLPIDR.TINSTANCE.
    #[serde(default)]
    pub instance: u8,
}

impl TargetSelect {
    /// The value written to DP.TARGETSEL.
    pub fn targetsel_value(&self) -> u32 {
        self.targetid
            .wrapping_add(u32::from(self.instance) << 28)
    }
}

/// Configuration of a transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Wire protocol to the target.
    pub protocol: WireProtocol,
    /// Clock speed in kHz.
    pub speed_khz: u32,
    /// The probe to open. The first probe found is used if not set.
    pub probe: Option<ProbeSelector>,
    /// Scan chain layout, only used for JTAG.
    pub scan_chain: ScanChain,
    /// Multi-drop target, only used for SWD.
    pub target_select: Option<TargetSelect>,
    /// Set CTRL/STAT.ORUNDETECT and clear STICKYORUN along with the other sticky flags.
    pub overrun_detection: bool,
    /// Drive the vendor probe bit by bit instead of using its native DP/AP calls.
    pub raw_driver: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            protocol: WireProtocol::Swd,
            speed_khz: 4000,
            probe: None,
            scan_chain: ScanChain::default(),
            target_select: None,
            overrun_detection: false,
            raw_driver: false,
        }
    }
}

impl TransportConfig {
    /// Parse a configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: TransportConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check for settings which contradict each other.
    pub fn validate(&self) -> Result<(), Error> {
        if self.protocol == WireProtocol::Jtag && self.target_select.is_some() {
            return Err(Error::Unsupported("target selection over JTAG"));
        }
        if self.speed_khz == 0 {
            return Err(Error::Unsupported("a clock speed of 0 kHz"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test]
    fn defaults() {
        let config = TransportConfig::from_yaml("{}").unwrap();
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.speed_khz, 4000);
        assert_eq!(config.scan_chain.ir_len, 4);
        assert!(!config.overrun_detection);
    }

    #[test]
    fn swd_multidrop() {
        let config = TransportConfig::from_yaml(
            "protocol: swd\n\
             speed_khz: 1000\n\
             probe: 600111234\n\
             target_select:\n  targetid: 0x01002927\n  instance: 1\n",
        )
        .unwrap();

        assert_eq!(config.protocol, WireProtocol::Swd);
        assert_eq!(config.speed_khz, 1000);
        assert_eq!(config.probe, Some(ProbeSelector::Serial(600111234)));
        let target = config.target_select.unwrap();
        assert_eq!(target.targetsel_value(), 0x1100_2927);
    }

    #[test]
    fn jtag_chain() {
        let config = TransportConfig::from_yaml(
            "protocol: jtag\n\
             probe: 192.168.1.20\n\
             scan_chain:\n  ir_pre: 5\n  dr_pre: 1\n",
        )
        .unwrap();

        assert_eq!(config.probe, Some(ProbeSelector::Ip("192.168.1.20".into())));
        assert_eq!(
            config.scan_chain.settings_string(),
            "IRPre=5;DRPre=1;IRPost=0;DRPost=0;IRLenDevice=4"
        );
        assert!(!config.scan_chain.is_single_device());
    }

    #[test]
    fn target_select_over_jtag_is_rejected() {
        let result = TransportConfig::from_yaml(
            "protocol: jtag\ntarget_select:\n  targetid: 0x01002927\n",
        );
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = TransportConfig::from_yaml("speed: 100\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test_case("swd" => WireProtocol::Swd; "lowercase")]
    #[test_case("JTAG" => WireProtocol::Jtag; "uppercase")]
    fn protocol_from_str(s: &str) -> WireProtocol {
        s.parse().unwrap()
    }

    #[test_case("600111234" => ProbeSelector::Serial(600111234); "serial")]
    #[test_case("jlink.local" => ProbeSelector::Ip("jlink.local".into()); "host")]
    fn probe_selector_from_str(s: &str) -> ProbeSelector {
        s.parse().unwrap()
    }
}
