//! The MEM-AP engine: memory access through TAR and DRW.
//!
//! Auto-increment of TAR is only guaranteed inside a 1 KiB block, so every access
//! crossing a 1 KiB boundary rewrites TAR. Runs of TAR/DRW accesses are issued with
//! the SELECT value frozen to the TAR/DRW bank.

use scroll::{Pread, LE};

use crate::ap::{AddressIncrement, ApLayout, ApType, Csw, DataSize, Drw, Idr, Tar};
use crate::dp::DebugPort;
use crate::error::{DapError, Error};

/// Poll attempts of a busy check before giving up.
const MAX_BUSY_POLLS: usize = 100;

/// A status register polled before every keyhole access.
///
/// The access proceeds once `(value & mask) == expected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyCheck {
    /// Bus address of the status register.
    pub address: u32,
    /// Bits of the status register to compare.
    pub mask: u32,
    /// Expected value of the masked bits.
    pub expected: u32,
}

impl BusyCheck {
    /// Create a new busy check.
    pub fn new(address: u32, mask: u32, expected: u32) -> Self {
        BusyCheck {
            address,
            mask,
            expected,
        }
    }

    /// Returns `true` if `value` signals that the target is ready.
    pub fn is_ready(&self, value: u32) -> bool {
        value & self.mask == self.expected
    }
}

/// Cached state of a present MEM-AP.
#[derive(Debug, Clone)]
pub(crate) struct MemApState {
    pub(crate) index: u8,
    pub(crate) layout: ApLayout,
    pub(crate) idr: Idr,
    /// The address increment CSW holds between operations.
    pub(crate) autoinc: bool,
    /// Last CSW value read from or written to the AP.
    csw: Csw,
    subword: Option<bool>,
}

impl MemApState {
    /// Probe the access port at `index`.
    ///
    /// Returns `None` if IDR reads as zero. If `autoinc` is `None`, address increment
    /// defaults to on for AHB access ports. CSW.AddrInc is set accordingly and
    /// CSW.Size is forced to 32 bit.
    pub(crate) fn connect(
        dp: &mut DebugPort,
        index: u8,
        autoinc: Option<bool>,
    ) -> Result<Option<Self>, Error> {
        let layout = ApLayout::for_debug_port(dp.version());
        let idr = Idr(dp.read_ap_register(index, layout.register_address::<Idr>())?);
        if !idr.is_present() {
            tracing::debug!("AP {} is not present", index);
            return Ok(None);
        }

        let autoinc = autoinc.unwrap_or_else(|| idr.ap_type().is_some_and(|ty| ty.is_ahb()));
        let csw_address = layout.register_address::<Csw>();
        let csw = Csw(dp.read_ap_register(index, csw_address)?);

        let mut state = MemApState {
            index,
            layout,
            idr,
            autoinc,
            csw,
            subword: None,
        };

        let mut wanted = csw;
        wanted.set_addr_inc(increment(autoinc));
        if csw.size() != Some(DataSize::U32) {
            tracing::debug!("AP {}: CSW.Size is {:?}, forcing word accesses", index, csw.size());
            wanted.set_size(DataSize::U32);
        }
        if wanted != csw {
            dp.write_ap_register(index, csw_address, wanted.0)?;
            state.csw = wanted;
        }

        tracing::debug!("Connected to AP {}: {:?}", index, idr);
        Ok(Some(state))
    }

    /// CSW.DeviceEn as last read.
    pub(crate) fn is_enabled(&self) -> bool {
        self.csw.device_en()
    }

    /// The bus type from IDR.
    pub(crate) fn ap_type(&self) -> Option<ApType> {
        self.idr.ap_type()
    }
}

fn increment(enabled: bool) -> AddressIncrement {
    if enabled {
        AddressIncrement::Single
    } else {
        AddressIncrement::Off
    }
}

/// A MEM-AP bound to its debug port for the duration of a transport operation.
#[derive(Debug)]
pub struct MemAp<'a> {
    dp: &'a mut DebugPort,
    state: &'a mut MemApState,
}

impl<'a> MemAp<'a> {
    pub(crate) fn new(dp: &'a mut DebugPort, state: &'a mut MemApState) -> Self {
        MemAp { dp, state }
    }

    /// Index of the access port.
    pub fn index(&self) -> u8 {
        self.state.index
    }

    /// Register layout of the access port.
    pub fn layout(&self) -> ApLayout {
        self.state.layout
    }

    /// The identification register read when the connection was created.
    pub fn idr(&self) -> Idr {
        self.state.idr
    }

    /// The debug port the access port sits behind.
    pub fn debug_port(&mut self) -> &mut DebugPort {
        self.dp
    }

    /// Read a typed AP register.
    pub fn read_register<R: crate::ap::ApRegister>(&mut self) -> Result<R, Error> {
        let address = self.state.layout.register_address::<R>();
        let value = self.dp.read_ap_register(self.state.index, address)?;
        tracing::trace!("AP {}: read {} = {:#010x}", self.state.index, R::NAME, value);
        Ok(value.into())
    }

    /// Write a typed AP register.
    pub fn write_register<R: crate::ap::ApRegister>(&mut self, register: R) -> Result<(), Error> {
        let address = self.state.layout.register_address::<R>();
        let value: u32 = register.into();
        tracing::trace!("AP {}: write {} = {:#010x}", self.state.index, R::NAME, value);
        self.dp.write_ap_register(self.state.index, address, value)
    }

    fn write_csw(&mut self, csw: Csw) -> Result<(), Error> {
        self.write_register(csw)?;
        self.state.csw = csw;
        Ok(())
    }

    /// Set the address increment CSW holds between operations.
    pub fn set_default_autoinc(&mut self, enabled: bool) -> Result<(), Error> {
        self.state.autoinc = enabled;
        self.ensure_autoinc(enabled).map(|_| ())
    }

    /// Make sure CSW.AddrInc matches `enabled`.
    ///
    /// Returns the previous setting. CSW is only written if it changes.
    pub fn ensure_autoinc(&mut self, enabled: bool) -> Result<bool, Error> {
        let current = self.state.csw.addr_inc() == Some(AddressIncrement::Single);
        if current != enabled {
            let mut csw = self.state.csw;
            csw.set_addr_inc(increment(enabled));
            self.write_csw(csw)?;
        }
        Ok(current)
    }

    /// Run `f` with CSW.AddrInc set to `enabled`, restoring the previous setting after.
    fn with_autoinc<T>(
        &mut self,
        enabled: bool,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let previous = self.ensure_autoinc(enabled)?;
        let result = f(self);
        if previous != enabled {
            let restored = self.ensure_autoinc(previous);
            if result.is_ok() {
                restored?;
            }
        }
        result
    }

    /// Run `f` with SELECT pointing at the TAR/DRW bank and frozen.
    ///
    /// On every exit path the enclosing caller's frozen selection is put back, or
    /// dropped if this run moved SELECT to another bank.
    fn preselected<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        let outer = self.dp.frozen_selection();
        let drw = self.state.layout.register_address::<Drw>();
        self.dp.select_ap(self.state.index, drw)?;
        self.dp.freeze_select();

        let result = f(self);

        self.dp.restore_frozen_selection(outer);
        result
    }

    /// Check whether the AP implements byte and halfword accesses.
    ///
    /// CSW.Size is set to byte and read back, the result is cached.
    pub fn supports_subword_access(&mut self) -> Result<bool, Error> {
        if let Some(supported) = self.state.subword {
            return Ok(supported);
        }

        let original = self.state.csw;
        let mut probe = original;
        probe.set_size(DataSize::U8);
        self.write_register(probe)?;
        let readback: Csw = self.read_register()?;
        self.write_register(original)?;

        let supported = readback.size() == Some(DataSize::U8);
        tracing::debug!("AP {}: sub-word access supported: {}", self.state.index, supported);
        self.state.subword = Some(supported);
        Ok(supported)
    }

    fn write_tar(&mut self, address: u32) -> Result<(), Error> {
        let result = self.write_register(Tar(address));
        self.classify(result, address)
    }

    fn read_drw_fast(&mut self, address: u32) -> Result<u32, Error> {
        let result = self.read_register::<Drw>().map(|drw| drw.0);
        self.classify(result, address)
    }

    fn write_drw_fast(&mut self, address: u32, value: u32) -> Result<(), Error> {
        let result = self.write_register(Drw(value));
        self.classify(result, address)
    }

    /// Turn a failed transaction into the more specific disabled-AP or bus error by
    /// looking at CSW.DeviceEn.
    fn classify<T>(&mut self, result: Result<T, Error>, address: u32) -> Result<T, Error> {
        match result {
            Err(Error::Dap(source)) if source.is_access_error() => {
                Err(self.access_error(source, address))
            }
            result => result,
        }
    }

    fn access_error(&mut self, source: DapError, address: u32) -> Error {
        let ap = self.state.index;
        match self.read_register::<Csw>() {
            Ok(csw) if !csw.device_en() => {
                tracing::debug!("AP {} is disabled", ap);
                Error::ApAccessDisabled { ap, address }
            }
            _ => Error::ApBusAccess {
                ap,
                address,
                source,
            },
        }
    }

    fn block_error(&mut self, error: DapError, address: u32) -> Error {
        if error.is_access_error() {
            self.access_error(error, address)
        } else {
            error.into()
        }
    }

    /// Read a single word: one TAR write and one DRW read.
    pub fn read_word(&mut self, address: u32) -> Result<u32, Error> {
        self.preselected(|ap| {
            ap.write_tar(address)?;
            ap.read_drw_fast(address)
        })
    }

    /// Write a single word: one TAR write and one DRW write.
    pub fn write_word(&mut self, address: u32, value: u32) -> Result<(), Error> {
        self.preselected(|ap| {
            ap.write_tar(address)?;
            ap.write_drw_fast(address, value)
        })
    }

    /// Read the bytes `start..end`.
    ///
    /// The range is widened to whole words and the result cut back to the request.
    #[tracing::instrument(level = "debug", skip(self), fields(ap = self.state.index))]
    pub fn read_memory(&mut self, start: u32, end: u32) -> Result<Vec<u8>, Error> {
        if end <= start {
            return Ok(Vec::new());
        }

        let aligned_start = start & !0x3;
        let aligned_end = (u64::from(end) + 3) & !0x3;
        let count = ((aligned_end - u64::from(aligned_start)) / 4) as usize;

        let words = self.with_autoinc(true, |ap| {
            ap.preselected(|ap| ap.read_words(aligned_start, count))
        })?;
        self.dp.check_for_sticky_errors()?;

        let skip = (start - aligned_start) as usize;
        let len = (end - start) as usize;
        Ok(words
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .skip(skip)
            .take(len)
            .collect())
    }

    /// Read `count` words with auto-increment, rewriting TAR at every 1 KiB boundary.
    fn read_words(&mut self, start: u32, count: usize) -> Result<Vec<u32>, Error> {
        if self.dp.probe_mut().supports_block_access() {
            tracing::debug!("Block read of {} words from {:#010x}", count, start);
            return match self.dp.probe_mut().read_drw_block(start, count, true, None) {
                Ok(words) => Ok(words),
                Err(e) => Err(self.block_error(e, start)),
            };
        }

        let mut words = Vec::with_capacity(count);
        self.write_tar(start)?;
        for i in 0..count {
            let address = start.wrapping_add(4 * i as u32);
            if i > 0 && address & 0x3ff == 0 {
                tracing::debug!("Crossing 1 KiB boundary, rewriting TAR = {:#010x}", address);
                self.write_tar(address)?;
            }
            words.push(self.read_drw_fast(address)?);
        }
        Ok(words)
    }

    /// Write words with auto-increment, rewriting TAR at every 1 KiB boundary.
    fn write_words(&mut self, start: u32, words: &[u32]) -> Result<(), Error> {
        if self.dp.probe_mut().supports_block_access() {
            tracing::debug!("Block write of {} words to {:#010x}", words.len(), start);
            return match self.dp.probe_mut().write_drw_block(start, words, true, None) {
                Ok(()) => Ok(()),
                Err(e) => Err(self.block_error(e, start)),
            };
        }

        self.write_tar(start)?;
        for (i, word) in words.iter().enumerate() {
            let address = start.wrapping_add(4 * i as u32);
            if i > 0 && address & 0x3ff == 0 {
                tracing::debug!("Crossing 1 KiB boundary, rewriting TAR = {:#010x}", address);
                self.write_tar(address)?;
            }
            self.write_drw_fast(address, *word)?;
        }
        Ok(())
    }

    /// Write `data` starting at `start`.
    ///
    /// Partial words at either end are written with byte accesses if the AP supports
    /// them. Otherwise the surrounding word is read back from the target and merged,
    /// so neighbouring bytes keep their contents.
    #[tracing::instrument(level = "debug", skip(self, data), fields(ap = self.state.index, len = data.len()))]
    pub fn write_memory(&mut self, start: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let head_len = ((4 - (start & 0x3)) & 0x3) as usize;
        let (head, rest) = data.split_at(head_len.min(data.len()));
        let body_len = rest.len() & !0x3;
        let (body, tail) = rest.split_at(body_len);

        let body_start = start.wrapping_add(head.len() as u32);
        let tail_start = body_start.wrapping_add(body.len() as u32);
        let words = body
            .chunks_exact(4)
            .map(|chunk| chunk.pread_with::<u32>(0, LE))
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::from)?;

        self.with_autoinc(true, |ap| {
            ap.preselected(|ap| {
                if !head.is_empty() {
                    ap.write_partial(start, head)?;
                }
                if !words.is_empty() {
                    ap.write_words(body_start, &words)?;
                }
                if !tail.is_empty() {
                    ap.write_partial(tail_start, tail)?;
                }
                Ok(())
            })
        })?;

        self.dp.check_for_sticky_errors()
    }

    /// Write bytes which all lie inside one word.
    fn write_partial(&mut self, address: u32, bytes: &[u8]) -> Result<(), Error> {
        if self.supports_subword_access()? {
            let mut csw = self.state.csw;
            csw.set_size(DataSize::U8);
            self.write_csw(csw)?;

            let result = bytes.iter().enumerate().try_for_each(|(i, byte)| {
                let byte_address = address + i as u32;
                let lane = (byte_address & 0x3) * 8;
                self.write_tar(byte_address)?;
                self.write_drw_fast(byte_address, u32::from(*byte) << lane)
            });

            csw.set_size(DataSize::U32);
            let restored = self.write_csw(csw);
            result.and(restored)
        } else {
            let word_address = address & !0x3;
            let offset = (address & 0x3) as usize;

            self.write_tar(word_address)?;
            let mut word = self.read_drw_fast(word_address)?.to_le_bytes();
            word[offset..offset + bytes.len()].copy_from_slice(bytes);

            self.write_tar(word_address)?;
            self.write_drw_fast(word_address, u32::from_le_bytes(word))
        }
    }

    fn wait_until_ready(&mut self, check: &BusyCheck) -> Result<(), Error> {
        self.write_tar(check.address)?;
        for _ in 0..MAX_BUSY_POLLS {
            if check.is_ready(self.read_drw_fast(check.address)?) {
                return Ok(());
            }
        }
        tracing::error!("Busy check at {:#010x} never reported ready", check.address);
        Err(Error::BusyTimeout {
            address: check.address,
        })
    }

    /// Read `count` words from a keyhole register at `address`.
    ///
    /// Address increment is off for the duration. With a busy check, every access
    /// polls the status register first, costing four transactions per word.
    #[tracing::instrument(level = "debug", skip(self), fields(ap = self.state.index))]
    pub fn poll_read(
        &mut self,
        address: u32,
        count: usize,
        busy_check: Option<BusyCheck>,
    ) -> Result<Vec<u32>, Error> {
        let words = self.with_autoinc(false, |ap| {
            ap.preselected(|ap| {
                if ap.dp.probe_mut().supports_block_access() {
                    return match ap
                        .dp
                        .probe_mut()
                        .read_drw_block(address, count, false, busy_check)
                    {
                        Ok(words) => Ok(words),
                        Err(e) => Err(ap.block_error(e, address)),
                    };
                }

                let mut words = Vec::with_capacity(count);
                match busy_check {
                    None => {
                        ap.write_tar(address)?;
                        for _ in 0..count {
                            words.push(ap.read_drw_fast(address)?);
                        }
                    }
                    Some(check) => {
                        for _ in 0..count {
                            ap.wait_until_ready(&check)?;
                            ap.write_tar(address)?;
                            words.push(ap.read_drw_fast(address)?);
                        }
                    }
                }
                Ok(words)
            })
        })?;

        self.dp.check_for_sticky_errors()?;
        Ok(words)
    }

    /// Write `values` to a keyhole register at `address`.
    ///
    /// Same access pattern as [`poll_read`](Self::poll_read). While the debug port is
    /// in reset mode the trailing sticky error check is skipped, since the write is
    /// expected to reset the target.
    #[tracing::instrument(level = "debug", skip(self, values), fields(ap = self.state.index, count = values.len()))]
    pub fn poll_write(
        &mut self,
        address: u32,
        values: &[u32],
        busy_check: Option<BusyCheck>,
    ) -> Result<(), Error> {
        self.with_autoinc(false, |ap| {
            ap.preselected(|ap| {
                if ap.dp.probe_mut().supports_block_access() {
                    return match ap
                        .dp
                        .probe_mut()
                        .write_drw_block(address, values, false, busy_check)
                    {
                        Ok(()) => Ok(()),
                        Err(e) => Err(ap.block_error(e, address)),
                    };
                }

                match busy_check {
                    None => {
                        ap.write_tar(address)?;
                        for value in values {
                            ap.write_drw_fast(address, *value)?;
                        }
                    }
                    Some(check) => {
                        for value in values {
                            ap.wait_until_ready(&check)?;
                            ap.write_tar(address)?;
                            ap.write_drw_fast(address, *value)?;
                        }
                    }
                }
                Ok(())
            })
        })?;

        if self.dp.reset_in_progress() {
            return Ok(());
        }
        self.dp.check_for_sticky_errors()
    }

    /// View the AP as a word addressed register space starting at `base`.
    pub fn apb_data(&mut self, base: u32) -> ApbData<'_, 'a> {
        ApbData { ap: self, base }
    }
}

/// A MEM-AP seen as an array of 32-bit registers, as used by debug modules behind an
/// APB-AP. Register `n` lives at `base + 4 * n`.
#[derive(Debug)]
pub struct ApbData<'m, 'a> {
    ap: &'m mut MemAp<'a>,
    base: u32,
}

impl ApbData<'_, '_> {
    fn address(&self, register: u32) -> u32 {
        self.base.wrapping_add(register.wrapping_mul(4))
    }

    /// Read register `register`.
    pub fn read_word(&mut self, register: u32) -> Result<u32, Error> {
        let address = self.address(register);
        self.ap.read_word(address)
    }

    /// Write `value` to register `register`.
    pub fn write_word(&mut self, register: u32, value: u32) -> Result<(), Error> {
        let address = self.address(register);
        self.ap.write_word(address, value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::mock::{MockDap, DPIDR_V1, DPIDR_V3};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn connect(mock: &MockDap, index: u8) -> (DebugPort, MemApState) {
        let mut dp = DebugPort::connect(Box::new(mock.clone()), false).unwrap();
        let state = MemApState::connect(&mut dp, index, None)
            .unwrap()
            .expect("AP is present");
        (dp, state)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn absent_ap() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        let mut dp = DebugPort::connect(Box::new(mock.clone()), false).unwrap();
        assert!(MemApState::connect(&mut dp, 3, None).unwrap().is_none());
    }

    #[test]
    fn connect_configures_csw() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        mock.set_csw(0, 0x2300_0040);
        let (_, state) = connect(&mock, 0);

        assert!(state.autoinc);
        assert!(state.is_enabled());
        assert_eq!(mock.csw(0), 0x2300_0052);
    }

    #[test]
    fn apb_defaults_to_no_increment() {
        let mock = MockDap::new(DPIDR_V1).with_apb_ap(1);
        let (_, state) = connect(&mock, 1);
        assert!(!state.autoinc);
        assert_eq!(state.ap_type(), Some(ApType::AmbaApb2Apb3));
    }

    #[test_case(0x2000_0000, 0x2000_0010; "inside one block")]
    #[test_case(0x2000_0000, 0x2000_0400; "exactly one block")]
    #[test_case(0x2000_03f0, 0x2000_0410; "one boundary")]
    #[test_case(0x2000_0100, 0x2000_1100; "four boundaries")]
    #[test_case(0x2000_0ffc, 0x2000_1004; "word either side")]
    fn tar_rewritten_at_every_boundary(start: u32, end: u32) {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        let contents = pattern((end - start) as usize);
        mock.load_memory(start, &contents);
        let (mut dp, mut state) = connect(&mock, 0);

        let data = MemAp::new(&mut dp, &mut state).read_memory(start, end).unwrap();
        assert_eq!(data, contents);

        let expected = 1 + ((end - 1) / 1024 - start / 1024) as usize;
        assert_eq!(mock.tar_writes(0).len(), expected);
    }

    #[test]
    fn write_crossing_boundaries() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        let (mut dp, mut state) = connect(&mock, 0);
        let data = pattern(0x900);

        MemAp::new(&mut dp, &mut state)
            .write_memory(0x2000_0200, &data)
            .unwrap();

        assert_eq!(mock.memory(0x2000_0200, data.len()), data);
        assert_eq!(
            mock.tar_writes(0),
            vec![0x2000_0200, 0x2000_0400, 0x2000_0800]
        );
    }

    #[test]
    fn select_written_once_for_a_run() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(1);
        let (mut dp, mut state) = connect(&mock, 1);
        assert_eq!(mock.select_writes(), vec![0x0100_00f0, 0x0100_0000]);

        let mut ap = MemAp::new(&mut dp, &mut state);
        ap.read_memory(0x2000_0000, 0x2000_0100).unwrap();
        ap.read_memory(0x2000_0100, 0x2000_0200).unwrap();

        // DP bank 0 for the sticky checks keeps the AP part of SELECT
        assert_eq!(mock.select_writes().len(), 2);
        assert!(!dp.select_is_frozen());
    }

    #[test]
    fn run_inside_frozen_selection_of_same_bank_keeps_it() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(1);
        let (mut dp, mut state) = connect(&mock, 1);

        dp.select_ap(1, 0x0c).unwrap();
        dp.freeze_select();
        MemAp::new(&mut dp, &mut state).read_word(0x2000_0000).unwrap();

        assert!(dp.select_is_frozen());
    }

    #[test]
    fn run_inside_frozen_selection_of_other_bank_drops_it() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(1);
        let (mut dp, mut state) = connect(&mock, 1);

        dp.select_ap(1, 0xfc).unwrap();
        dp.freeze_select();
        MemAp::new(&mut dp, &mut state).read_word(0x2000_0000).unwrap();
        assert!(!dp.select_is_frozen());

        // The IDR bank has to be selected again
        dp.select_ap(1, 0xfc).unwrap();
        assert_eq!(mock.select_writes().last(), Some(&0x0100_00f0));
    }

    #[test_case(0x2000_0001, 2; "inside one word")]
    #[test_case(0x2000_0003, 6; "head and tail")]
    #[test_case(0x2000_0002, 13; "head body tail")]
    #[test_case(0x2000_0004, 5; "aligned start")]
    #[test_case(0x2000_03fd, 9; "across a boundary")]
    fn unaligned_round_trip_without_subword(start: u32, len: usize) {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0).without_subword();
        let background = vec![0xa5; 0x800];
        mock.load_memory(0x2000_0000, &background);
        let (mut dp, mut state) = connect(&mock, 0);
        let data = pattern(len);

        let mut ap = MemAp::new(&mut dp, &mut state);
        ap.write_memory(start, &data).unwrap();
        assert_eq!(ap.read_memory(start, start + len as u32).unwrap(), data);

        // Neighbouring bytes are preserved
        let offset = (start - 0x2000_0000) as usize;
        let mut expected = background.clone();
        expected[offset..offset + len].copy_from_slice(&data);
        assert_eq!(mock.memory(0x2000_0000, 0x800), expected);
    }

    #[test]
    fn unaligned_write_with_subword_uses_byte_accesses() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        mock.load_memory(0x2000_0000, &[0x11; 8]);
        let (mut dp, mut state) = connect(&mock, 0);

        let mut ap = MemAp::new(&mut dp, &mut state);
        assert!(ap.supports_subword_access().unwrap());
        ap.write_memory(0x2000_0003, &[1, 2, 3, 4, 5]).unwrap();

        assert_eq!(
            mock.memory(0x2000_0000, 8),
            vec![0x11, 0x11, 0x11, 1, 2, 3, 4, 5]
        );
        // Head byte at 3, the body word at 4
        assert_eq!(mock.tar_writes(0), vec![0x2000_0003, 0x2000_0004]);
        assert_eq!(mock.csw(0) & 0x7, 2);
    }

    #[test]
    fn subword_support_is_cached() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0).without_subword();
        let (mut dp, mut state) = connect(&mock, 0);
        let mut ap = MemAp::new(&mut dp, &mut state);

        assert!(!ap.supports_subword_access().unwrap());
        let csw_writes = mock.csw_writes(0);
        assert!(!ap.supports_subword_access().unwrap());
        assert_eq!(mock.csw_writes(0), csw_writes);
    }

    #[test]
    fn autoinc_restored_after_read() {
        let mock = MockDap::new(DPIDR_V1).with_apb_ap(1);
        let (mut dp, mut state) = connect(&mock, 1);

        MemAp::new(&mut dp, &mut state)
            .read_memory(0x8000_0000, 0x8000_0010)
            .unwrap();
        assert_eq!((mock.csw(1) >> 4) & 0x3, 0);
    }

    #[test]
    fn poll_read_keeps_tar() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        mock.load_memory(0x4000_0010, &0x1234_5678u32.to_le_bytes());
        let (mut dp, mut state) = connect(&mock, 0);

        let words = MemAp::new(&mut dp, &mut state)
            .poll_read(0x4000_0010, 3, None)
            .unwrap();
        assert_eq!(words, vec![0x1234_5678; 3]);
        assert_eq!(mock.tar_writes(0), vec![0x4000_0010]);
        // Address increment is restored
        assert_eq!((mock.csw(0) >> 4) & 0x3, 1);
    }

    #[test]
    fn poll_write_with_busy_check() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        mock.load_memory(0x4000_0000, &0x0000_0001u32.to_le_bytes());
        let (mut dp, mut state) = connect(&mock, 0);
        let check = BusyCheck::new(0x4000_0000, 0x1, 0x1);

        MemAp::new(&mut dp, &mut state)
            .poll_write(0x4000_0004, &[7, 8], Some(check))
            .unwrap();

        assert_eq!(
            mock.tar_writes(0),
            vec![0x4000_0000, 0x4000_0004, 0x4000_0000, 0x4000_0004]
        );
        assert_eq!(mock.memory(0x4000_0004, 4), 8u32.to_le_bytes().to_vec());
    }

    #[test]
    fn busy_check_gives_up() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        let (mut dp, mut state) = connect(&mock, 0);
        let check = BusyCheck::new(0x4000_0000, 0x1, 0x1);

        let result = MemAp::new(&mut dp, &mut state).poll_read(0x4000_0004, 1, Some(check));
        assert!(matches!(
            result,
            Err(Error::BusyTimeout {
                address: 0x4000_0000
            })
        ));
    }

    #[test]
    fn poll_write_in_reset_skips_sticky_check() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        let (mut dp, mut state) = connect(&mock, 0);
        mock.set_sticky_error();

        dp.begin_reset();
        MemAp::new(&mut dp, &mut state)
            .poll_write(0x4000_0000, &[1], None)
            .unwrap();
        dp.end_reset();

        let result = MemAp::new(&mut dp, &mut state).poll_write(0x4000_0000, &[1], None);
        assert!(matches!(result, Err(Error::StickyError { .. })));
    }

    #[test]
    fn sticky_error_after_read() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        let (mut dp, mut state) = connect(&mock, 0);
        mock.latch_sticky_on_drw(1);

        let result = MemAp::new(&mut dp, &mut state).read_memory(0x2000_0000, 0x2000_0008);
        assert!(matches!(result, Err(Error::StickyError { .. })));
    }

    #[test]
    fn bus_error_on_enabled_ap() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        mock.fault_address(0x2000_0004);
        let (mut dp, mut state) = connect(&mock, 0);

        let result = MemAp::new(&mut dp, &mut state).read_word(0x2000_0004);
        match result {
            Err(Error::ApBusAccess { ap, address, .. }) => {
                assert_eq!((ap, address), (0, 0x2000_0004));
            }
            other => panic!("Expected a bus error, got {:?}", other),
        }
    }

    #[test]
    fn access_error_on_disabled_ap() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0);
        mock.set_csw(0, 0x2300_0012);
        let (mut dp, mut state) = connect(&mock, 0);

        let result = MemAp::new(&mut dp, &mut state).read_word(0x2000_0000);
        assert!(matches!(
            result,
            Err(Error::ApAccessDisabled {
                ap: 0,
                address: 0x2000_0000
            })
        ));
    }

    #[test]
    fn adiv6_registers() {
        let mock = MockDap::new(DPIDR_V3).with_mem_ap(0);
        mock.load_memory(0x1000, &[1, 2, 3, 4]);
        let (mut dp, mut state) = connect(&mock, 0);
        assert_eq!(state.layout, ApLayout::V6);

        assert_eq!(MemAp::new(&mut dp, &mut state).read_word(0x1000).unwrap(), 0x0403_0201);
        assert!(mock.select_writes().contains(&0x0000_0d00));
    }

    #[test]
    fn block_access_path() {
        let mock = MockDap::new(DPIDR_V1).with_mem_ap(0).with_block_access();
        let contents = pattern(0x600);
        mock.load_memory(0x2000_0200, &contents);
        let (mut dp, mut state) = connect(&mock, 0);

        let data = MemAp::new(&mut dp, &mut state)
            .read_memory(0x2000_0200, 0x2000_0800)
            .unwrap();
        assert_eq!(data, contents);
        assert_eq!(mock.block_calls(), 1);
        assert_eq!(mock.tar_writes(0), vec![0x2000_0200, 0x2000_0400]);
    }

    #[test]
    fn apb_data_word_space() {
        let mock = MockDap::new(DPIDR_V1).with_apb_ap(1);
        let (mut dp, mut state) = connect(&mock, 1);
        let mut ap = MemAp::new(&mut dp, &mut state);
        let mut dm = ap.apb_data(0x400);

        dm.write_word(0x10, 0x8000_0001).unwrap();
        assert_eq!(dm.read_word(0x10).unwrap(), 0x8000_0001);
        assert_eq!(mock.memory(0x440, 4), 0x8000_0001u32.to_le_bytes().to_vec());
    }
}
