//! An emulated debug port for tests.
//!
//! [`MockDap`] models a DP with SELECT banking, sticky flags and the power handshake,
//! plus a set of MEM-APs over one flat byte memory. Clones share their state, so a test
//! can hand one clone to the code under test and inspect the recorded accesses through
//! another.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{PortType, RawDapAccess, DRW_INDEX, TAR_INDEX};
use crate::error::DapError;
use crate::memory::BusyCheck;

pub(crate) const DPIDR_V1: u32 = 0x2ba0_1477;
pub(crate) const DPIDR_V2: u32 = 0x6ba0_2477;
pub(crate) const DPIDR_V3: u32 = 0x4c01_3477;

/// AHB3 MEM-AP designed by Arm.
pub(crate) const IDR_AHB3: u32 = 0x2477_0011;
/// APB2/3 MEM-AP designed by Arm.
pub(crate) const IDR_APB: u32 = 0x4477_0002;

const CSW_DEFAULT: u32 = 0x2300_0052;
const CSW_READ_ONLY: u32 = (1 << 23) | (1 << 7) | (1 << 6);

const CTRL_WRITABLE: u32 = 0x55ff_ff0d;
const CTRL_STICKY: u32 = 0xb2;
const STICKYERR: u32 = 1 << 5;

#[derive(Debug)]
struct MockAp {
    idr: u32,
    csw: u32,
    tar: u32,
    tar_writes: Vec<u32>,
    csw_writes: usize,
}

#[derive(Debug, Default)]
struct State {
    dpidr: u32,
    ctrl: u32,
    select: u32,
    target_id: u32,
    dlpidr: u32,
    rdbuff: u32,

    no_subword: bool,
    power_stuck: bool,
    power_retry: bool,
    block_access: bool,
    failing_dp_reads: usize,
    transient_sticky: usize,
    latch_on_drw: usize,

    dp_reads: usize,
    select_writes: Vec<u32>,
    abort_writes: Vec<u32>,
    block_calls: usize,

    aps: BTreeMap<u8, MockAp>,
    memory: HashMap<u32, u8>,
    faults: HashSet<u32>,
}

/// An emulated debug port with MEM-APs.
#[derive(Debug, Clone)]
pub(crate) struct MockDap {
    state: Arc<Mutex<State>>,
}

impl MockDap {
    pub(crate) fn new(dpidr: u32) -> Self {
        MockDap {
            state: Arc::new(Mutex::new(State {
                dpidr,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn with_ap(self, index: u8, idr: u32) -> Self {
        self.lock().aps.insert(
            index,
            MockAp {
                idr,
                csw: CSW_DEFAULT,
                tar: 0,
                tar_writes: Vec::new(),
                csw_writes: 0,
            },
        );
        self
    }

    pub(crate) fn with_mem_ap(self, index: u8) -> Self {
        self.with_ap(index, IDR_AHB3)
    }

    pub(crate) fn with_apb_ap(self, index: u8) -> Self {
        self.with_ap(index, IDR_APB)
    }

    /// CSW.Size reads back as word whatever is written.
    pub(crate) fn without_subword(self) -> Self {
        self.lock().no_subword = true;
        self
    }

    pub(crate) fn with_block_access(self) -> Self {
        self.lock().block_access = true;
        self
    }

    pub(crate) fn with_power_retry(self) -> Self {
        self.lock().power_retry = true;
        self
    }

    pub(crate) fn with_target_id(self, target_id: u32, instance: u8) -> Self {
        {
            let mut state = self.lock();
            state.target_id = target_id;
            state.dlpidr = (u32::from(instance) << 28) | 0x1;
        }
        self
    }

    pub(crate) fn set_csw(&self, ap: u8, csw: u32) {
        if let Some(ap) = self.lock().aps.get_mut(&ap) {
            ap.csw = csw;
        }
    }

    pub(crate) fn csw(&self, ap: u8) -> u32 {
        self.lock().aps[&ap].csw
    }

    pub(crate) fn csw_writes(&self, ap: u8) -> usize {
        self.lock().aps[&ap].csw_writes
    }

    pub(crate) fn tar_writes(&self, ap: u8) -> Vec<u32> {
        self.lock().aps[&ap].tar_writes.clone()
    }

    pub(crate) fn load_memory(&self, address: u32, data: &[u8]) {
        let mut state = self.lock();
        for (i, byte) in data.iter().enumerate() {
            state.memory.insert(address + i as u32, *byte);
        }
    }

    pub(crate) fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        (0..len as u32)
            .map(|i| state.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    /// DRW accesses with TAR at `address` fail.
    pub(crate) fn fault_address(&self, address: u32) {
        self.lock().faults.insert(address);
    }

    pub(crate) fn set_sticky_error(&self) {
        self.lock().ctrl |= STICKYERR;
    }

    /// The next `reads` reads of CTRL/STAT show STICKYERR without it being latched.
    pub(crate) fn inject_transient_sticky(&self, reads: usize) {
        self.lock().transient_sticky = reads;
    }

    /// The next `accesses` DRW accesses complete but latch STICKYERR.
    pub(crate) fn latch_sticky_on_drw(&self, accesses: usize) {
        self.lock().latch_on_drw = accesses;
    }

    pub(crate) fn power_up(&self) {
        self.lock().ctrl |= 0xf000_0000;
    }

    pub(crate) fn set_power_acks_stuck(&self) {
        self.lock().power_stuck = true;
    }

    pub(crate) fn fail_next_dp_reads(&self, reads: usize) {
        self.lock().failing_dp_reads = reads;
    }

    pub(crate) fn dp_reads(&self) -> usize {
        self.lock().dp_reads
    }

    pub(crate) fn select_writes(&self) -> Vec<u32> {
        self.lock().select_writes.clone()
    }

    pub(crate) fn abort_writes(&self) -> Vec<u32> {
        self.lock().abort_writes.clone()
    }

    pub(crate) fn block_calls(&self) -> usize {
        self.lock().block_calls
    }
}

impl State {
    fn dp_bank(&self) -> u32 {
        self.select & 0xf
    }

    fn is_dpv3(&self) -> bool {
        (self.dpidr >> 12) & 0xf == 3
    }

    fn read_dp(&mut self, address: u8) -> Result<u32, DapError> {
        self.dp_reads += 1;
        if self.failing_dp_reads > 0 {
            self.failing_dp_reads -= 1;
            return Err(DapError::NoAcknowledge);
        }

        Ok(match address & 0xc {
            0x0 if self.is_dpv3() && self.dp_bank() != 0 => 0,
            0x0 => self.dpidr,
            0x4 => match self.dp_bank() {
                0 => {
                    let mut ctrl = self.ctrl;
                    if self.transient_sticky > 0 {
                        self.transient_sticky -= 1;
                        ctrl |= STICKYERR;
                    }
                    ctrl
                }
                2 => self.target_id,
                3 => self.dlpidr,
                _ => 0,
            },
            0x8 => 0,
            _ => self.rdbuff,
        })
    }

    fn write_dp(&mut self, address: u8, value: u32) {
        match address & 0xc {
            0x0 => {
                self.abort_writes.push(value);
                let clears = [(1, 1 << 4), (2, 1 << 5), (3, 1 << 7), (4, 1 << 1)];
                for (bit, flag) in clears {
                    if value & (1 << bit) != 0 {
                        self.ctrl &= !flag;
                    }
                }
            }
            0x4 if self.dp_bank() == 0 => {
                let mut ctrl = (value & CTRL_WRITABLE) | (self.ctrl & CTRL_STICKY);
                if !self.power_stuck {
                    // Acknowledges follow their requests
                    ctrl |= (ctrl & 0x5000_0000) << 1;
                }
                ctrl |= (ctrl & (1 << 26)) << 1;
                self.ctrl = ctrl;
            }
            0x8 => {
                self.select = value;
                self.select_writes.push(value);
            }
            _ => {}
        }
    }

    fn ap_register(&self, address: u8) -> (u8, u32) {
        let ap = (self.select >> 24) as u8;
        let full = (self.select & 0xff0) | u32::from(address & 0xc);
        (ap, full & 0xff)
    }

    fn read_ap(&mut self, address: u8) -> Result<u32, DapError> {
        let (index, register) = self.ap_register(address);
        let Some((csw, tar, idr)) = self.aps.get(&index).map(|ap| (ap.csw, ap.tar, ap.idr)) else {
            return Ok(0);
        };

        let value = match register {
            0x00 => csw,
            0x04 => tar,
            0x0c => self.access_drw(index, None)?,
            0x10..=0x1c => self.read_word((tar & !0xf) + (register - 0x10)),
            0xfc => idr,
            _ => 0,
        };
        self.rdbuff = value;
        Ok(value)
    }

    fn write_ap(&mut self, address: u8, value: u32) -> Result<(), DapError> {
        let (index, register) = self.ap_register(address);
        let no_subword = self.no_subword;
        let Some(tar) = self.aps.get(&index).map(|ap| ap.tar) else {
            return Ok(());
        };

        match register {
            0x0c => {
                self.access_drw(index, Some(value))?;
            }
            0x10..=0x1c => self.write_word((tar & !0xf) + (register - 0x10), value),
            _ => {
                if let Some(ap) = self.aps.get_mut(&index) {
                    match register {
                        0x00 => {
                            let mut csw = (value & !CSW_READ_ONLY) | (ap.csw & CSW_READ_ONLY);
                            if no_subword {
                                csw = (csw & !0x7) | 0x2;
                            }
                            ap.csw = csw;
                            ap.csw_writes += 1;
                        }
                        0x04 => {
                            ap.tar = value;
                            ap.tar_writes.push(value);
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn access_drw(&mut self, index: u8, write: Option<u32>) -> Result<u32, DapError> {
        let ap = &self.aps[&index];
        let (csw, tar) = (ap.csw, ap.tar);

        if csw & (1 << 6) == 0 || self.faults.contains(&tar) {
            return Err(DapError::AccessFailed {
                port: PortType::AccessPort,
                address: DRW_INDEX << 2,
            });
        }
        if self.latch_on_drw > 0 {
            self.latch_on_drw -= 1;
            self.ctrl |= STICKYERR;
        }

        let size = csw & 0x7;
        let value = match write {
            None => self.read_word(tar & !0x3),
            Some(value) => {
                let lane = (tar & 0x3) * 8;
                match size {
                    0 => {
                        self.memory.insert(tar, (value >> lane) as u8);
                    }
                    1 => {
                        self.memory.insert(tar, (value >> lane) as u8);
                        self.memory.insert(tar + 1, (value >> (lane + 8)) as u8);
                    }
                    _ => self.write_word(tar & !0x3, value),
                }
                value
            }
        };

        if (csw >> 4) & 0x3 == 1 {
            let bytes = 1 << size;
            if let Some(ap) = self.aps.get_mut(&index) {
                // Only the lowest 10 bits increment
                ap.tar = (tar & !0x3ff) | (tar.wrapping_add(bytes) & 0x3ff);
            }
        }
        Ok(value)
    }

    fn read_word(&self, address: u32) -> u32 {
        let byte = |offset: u32| {
            u32::from(self.memory.get(&(address + offset)).copied().unwrap_or(0))
        };
        byte(0) | (byte(1) << 8) | (byte(2) << 16) | (byte(3) << 24)
    }

    fn write_word(&mut self, address: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.memory.insert(address + i as u32, byte);
        }
    }
}

impl RawDapAccess for MockDap {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
        let mut state = self.lock();
        match port {
            PortType::DebugPort => state.read_dp(address),
            PortType::AccessPort => state.read_ap(address),
        }
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError> {
        let mut state = self.lock();
        match port {
            PortType::DebugPort => {
                state.write_dp(address, value);
                Ok(())
            }
            PortType::AccessPort => state.write_ap(address, value),
        }
    }

    fn reasserts_power_on_dp_failure(&self) -> bool {
        self.lock().power_retry
    }

    fn supports_block_access(&self) -> bool {
        self.lock().block_access
    }

    fn read_drw_block(
        &mut self,
        start: u32,
        count: usize,
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<Vec<u32>, DapError> {
        self.lock().block_calls += 1;
        if autoinc && busy_check.is_some() {
            return Err(DapError::NotImplemented("busy check with address increment"));
        }

        let tar = TAR_INDEX << 2;
        let drw = DRW_INDEX << 2;
        let mut words = Vec::with_capacity(count);
        let mut state = self.lock();
        for i in 0..count {
            let address = start.wrapping_add(if autoinc { 4 * i as u32 } else { 0 });
            if let Some(check) = busy_check {
                state.write_ap(tar, check.address)?;
                if !check.is_ready(state.read_ap(drw)?) {
                    return Err(DapError::WaitResponse);
                }
            }
            if i == 0 || busy_check.is_some() || (autoinc && address & 0x3ff == 0) {
                state.write_ap(tar, address)?;
            }
            words.push(state.read_ap(drw)?);
        }
        Ok(words)
    }

    fn write_drw_block(
        &mut self,
        start: u32,
        data: &[u32],
        autoinc: bool,
        busy_check: Option<BusyCheck>,
    ) -> Result<(), DapError> {
        self.lock().block_calls += 1;
        if autoinc && busy_check.is_some() {
            return Err(DapError::NotImplemented("busy check with address increment"));
        }

        let tar = TAR_INDEX << 2;
        let drw = DRW_INDEX << 2;
        let mut state = self.lock();
        for (i, value) in data.iter().enumerate() {
            let address = start.wrapping_add(if autoinc { 4 * i as u32 } else { 0 });
            if let Some(check) = busy_check {
                state.write_ap(tar, check.address)?;
                if !check.is_ready(state.read_ap(drw)?) {
                    return Err(DapError::WaitResponse);
                }
            }
            if i == 0 || busy_check.is_some() || (autoinc && address & 0x3ff == 0) {
                state.write_ap(tar, address)?;
            }
            state.write_ap(drw, *value)?;
        }
        Ok(())
    }
}
