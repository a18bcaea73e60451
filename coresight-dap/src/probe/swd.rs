//! The SWD driver.
//!
//! Every register access is one SWD packet: an 8 bit request, a 3 bit acknowledge and
//! a 33 bit data phase. The bit sequences are built here and handed to an
//! [`SwdAccess`] line driver.

use std::iter;

use super::{PortType, RawDapAccess};
use crate::config::TargetSelect;
use crate::dp::verify_target_selection;
use crate::error::{DapError, Error};

/// Attempts of the multi-drop target selection sequence.
pub const TARGET_SELECT_ATTEMPTS: usize = 3;

/// Clock cycles with SWDIO high which make up a line reset.
const LINE_RESET_BITS: usize = 50;

/// Length of one transfer sequence, including the leading idle cycles.
const TRANSFER_LEN: usize = 2 + 8 + 1 + 3 + 32 + 1 + 1;

/// Offset of the acknowledge inside a transfer sequence.
const ACK_OFFSET: usize = 2 + 8 + 1;

/// A sequence of SWDIO values together with the drive direction of each bit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoSequence {
    io: Vec<bool>,
    direction: Vec<bool>,
}

impl IoSequence {
    const INPUT: bool = false;
    const OUTPUT: bool = true;

    /// An empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_output(&mut self, bit: bool) {
        self.io.push(bit);
        self.direction.push(Self::OUTPUT);
    }

    fn add_output_sequence(&mut self, bits: impl IntoIterator<Item = bool>) {
        for bit in bits {
            self.add_output(bit);
        }
    }

    fn add_input(&mut self) {
        self.add_input_sequence(1);
    }

    fn add_input_sequence(&mut self, length: usize) {
        self.io.extend(iter::repeat(false).take(length));
        self.direction
            .extend(iter::repeat(Self::INPUT).take(length));
    }

    fn extend(&mut self, other: &IoSequence) {
        self.io.extend_from_slice(&other.io);
        self.direction.extend_from_slice(&other.direction);
    }

    /// The SWDIO values, ignored for input bits.
    pub fn io_bits(&self) -> &[bool] {
        &self.io
    }

    /// The drive direction of every bit, `true` for bits driven by the probe.
    pub fn direction_bits(&self) -> &[bool] {
        &self.direction
    }

    /// Number of clock cycles in the sequence.
    pub fn len(&self) -> usize {
        self.io.len()
    }

    /// Returns `true` if the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.io.is_empty()
    }
}

/// Raw access to the SWD line.
pub trait SwdAccess: std::fmt::Debug {
    /// Clock out `sequence` and return the SWDIO value sampled in every cycle.
    ///
    /// The returned vector has one entry per bit of the sequence, aligned so that
    /// entry `i` is the value the target drove during cycle `i`.
    fn drive_line(&mut self, sequence: &IoSequence) -> Result<Vec<bool>, DapError>;
}

impl<T: SwdAccess + ?Sized> SwdAccess for Box<T> {
    fn drive_line(&mut self, sequence: &IoSequence) -> Result<Vec<bool>, DapError> {
        (**self).drive_line(sequence)
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum TransferType {
    Read,
    Write(u32),
}

fn build_swd_transfer(port: PortType, transfer: TransferType, address: u8) -> IoSequence {
    let ap_n_dp = port.ap_n_dp();
    let read = transfer == TransferType::Read;
    let a2 = (address >> 2) & 0x01 == 1;
    let a3 = (address >> 3) & 0x01 == 1;

    let mut sequence = IoSequence::new();

    // Idle
    sequence.add_output_sequence([false, false]);

    // Start, APnDP, RnW, A[2:3], parity, stop, park
    sequence.add_output(true);
    sequence.add_output(ap_n_dp);
    sequence.add_output(read);
    sequence.add_output(a2);
    sequence.add_output(a3);
    sequence.add_output(ap_n_dp ^ read ^ a2 ^ a3);
    sequence.add_output(false);
    sequence.add_output(true);

    // Turnaround and acknowledge
    sequence.add_input();
    sequence.add_input_sequence(3);

    match transfer {
        TransferType::Write(value) => {
            sequence.add_input();
            sequence.add_output_sequence((0..32).map(|bit| value >> bit & 1 == 1));
            sequence.add_output(value.count_ones() % 2 == 1);
        }
        TransferType::Read => {
            sequence.add_input_sequence(32);
            // Parity and turnaround
            sequence.add_input();
            sequence.add_input();
        }
    }

    sequence
}

fn parse_swd_response(response: &[bool], read: bool) -> Result<u32, DapError> {
    if response.len() < TRANSFER_LEN {
        return Err(DapError::ProbeSpecific(
            anyhow::anyhow!("Short SWD capture of {} bits", response.len()).into(),
        ));
    }

    let ack = &response[ACK_OFFSET..ACK_OFFSET + 3];
    let ack_value = ack
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, bit)| acc | (u8::from(*bit) << i));

    match ack_value {
        0b001 => {}
        0b010 => return Err(DapError::WaitResponse),
        0b100 => return Err(DapError::FaultResponse),
        // Nobody drove the line
        0b111 => return Err(DapError::NoAcknowledge),
        ack => {
            tracing::debug!("Acknowledge {:#05b} does not conform to SWD", ack);
            return Err(DapError::UnexpectedAck { ack });
        }
    }

    if !read {
        return Ok(0);
    }

    let data = &response[ACK_OFFSET + 3..ACK_OFFSET + 3 + 32];
    let value = data
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, bit)| acc | (u32::from(*bit) << i));
    let parity = response[ACK_OFFSET + 3 + 32];

    if (value.count_ones() % 2 == 1) == parity {
        Ok(value)
    } else {
        Err(DapError::IncorrectParity)
    }
}

/// Perform a line reset and write `value` to the DP register at `address` without
/// checking the acknowledge.
///
/// Used for TARGETSEL, which no target acknowledges.
pub fn line_reset_and_write<L: SwdAccess + ?Sized>(
    line: &mut L,
    address: u8,
    value: u32,
) -> Result<(), DapError> {
    tracing::debug!("Line reset, then DP write {:#x} = {:#010x}", address, value);

    let mut sequence = IoSequence::new();
    sequence.add_output_sequence(iter::repeat(true).take(LINE_RESET_BITS));
    sequence.extend(&build_swd_transfer(
        PortType::DebugPort,
        TransferType::Write(value),
        address,
    ));

    line.drive_line(&sequence)?;
    Ok(())
}

/// Select one target on a multi-drop SWD bus.
///
/// Each attempt is a line reset followed by a TARGETSEL write, then the selection is
/// verified through DPIDR, TARGETID and DLPIDR.
#[tracing::instrument(level = "debug", skip(port))]
pub fn select_target<P>(port: &mut P, target: &TargetSelect) -> Result<(), Error>
where
    P: SwdAccess + RawDapAccess + ?Sized,
{
    for attempt in 1..=TARGET_SELECT_ATTEMPTS {
        line_reset_and_write(port, 0xc, target.targetsel_value())?;
        match verify_target_selection(port, target) {
            Ok(true) => return Ok(()),
            Ok(false) => tracing::debug!("Wrong target selected, attempt {}", attempt),
            Err(e) => tracing::debug!("Target selection failed on attempt {}: {}", attempt, e),
        }
    }

    tracing::error!("Giving up on selecting target {:?}", target);
    Err(Error::TargetSelectionFailed {
        targetid: target.targetid,
        instance: target.instance,
        attempts: TARGET_SELECT_ATTEMPTS,
    })
}

/// A DAP driven through SWD.
#[derive(Debug)]
pub struct SwdDp<S> {
    driver: S,
}

impl<S: SwdAccess> SwdDp<S> {
    /// Wrap a line driver.
    pub fn new(driver: S) -> Self {
        SwdDp { driver }
    }

    /// Give up the line driver.
    pub fn into_inner(self) -> S {
        self.driver
    }

    fn transfer(&mut self, port: PortType, transfer: TransferType, address: u8) -> Result<u32, DapError> {
        let sequence = build_swd_transfer(port, transfer, address);
        let response = self.driver.drive_line(&sequence)?;
        let result = parse_swd_response(&response, transfer == TransferType::Read);
        tracing::trace!("SWD {:?} {:?} {:#x}: {:?}", port, transfer, address, result);
        result
    }
}

impl<S: SwdAccess> SwdAccess for SwdDp<S> {
    fn drive_line(&mut self, sequence: &IoSequence) -> Result<Vec<bool>, DapError> {
        self.driver.drive_line(sequence)
    }
}

impl<S: SwdAccess> RawDapAccess for SwdDp<S> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, DapError> {
        match port {
            PortType::DebugPort => self.transfer(port, TransferType::Read, address),
            PortType::AccessPort => {
                // AP reads are posted, the result arrives with the next read
                self.transfer(port, TransferType::Read, address)?;
                self.transfer(PortType::DebugPort, TransferType::Read, 0xc)
            }
        }
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), DapError> {
        self.transfer(port, TransferType::Write(value), address)
            .map(|_| ())
    }

    fn raw_read_block(
        &mut self,
        port: PortType,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), DapError> {
        if port == PortType::DebugPort || values.is_empty() {
            for value in values.iter_mut() {
                *value = self.transfer(port, TransferType::Read, address)?;
            }
            return Ok(());
        }

        self.transfer(port, TransferType::Read, address)?;
        let count = values.len();
        for value in values.iter_mut().take(count - 1) {
            *value = self.transfer(port, TransferType::Read, address)?;
        }
        values[count - 1] = self.transfer(PortType::DebugPort, TransferType::Read, 0xc)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    /// A line driver answering the transfer at the end of each sequence from a script.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedSwd {
        pub(crate) sequences: Vec<IoSequence>,
        responses: VecDeque<(u8, u32)>,
    }

    impl ScriptedSwd {
        pub(crate) fn respond(&mut self, ack: u8, data: u32) {
            self.responses.push_back((ack, data));
        }

        pub(crate) fn respond_ok(&mut self, data: u32) {
            self.respond(0b001, data);
        }

        /// Decode the request of the transfer at the end of a sequence.
        pub(crate) fn request(sequence: &IoSequence) -> (bool, bool, u8) {
            let bits = &sequence.io_bits()[sequence.len() - TRANSFER_LEN..];
            let address = (u8::from(bits[5]) << 2) | (u8::from(bits[6]) << 3);
            (bits[3], bits[4], address)
        }
    }

    impl SwdAccess for ScriptedSwd {
        fn drive_line(&mut self, sequence: &IoSequence) -> Result<Vec<bool>, DapError> {
            self.sequences.push(sequence.clone());
            let (ack, data) = self.responses.pop_front().unwrap_or((0b001, 0));

            let mut response = vec![false; sequence.len()];
            let start = sequence.len() - TRANSFER_LEN + ACK_OFFSET;
            for i in 0..3 {
                response[start + i] = ack >> i & 1 == 1;
            }
            for i in 0..32 {
                response[start + 3 + i] = data >> i & 1 == 1;
            }
            response[start + 35] = data.count_ones() % 2 == 1;
            Ok(response)
        }
    }

    #[test]
    fn dpidr_read_request() {
        let sequence = build_swd_transfer(PortType::DebugPort, TransferType::Read, 0x0);
        assert_eq!(sequence.len(), TRANSFER_LEN);
        assert_eq!(
            &sequence.io_bits()[..10],
            &[false, false, true, false, true, false, false, true, false, true]
        );
        assert!(sequence.direction_bits()[10..].iter().all(|driven| !driven));
    }

    #[test]
    fn write_request_carries_data_and_parity() {
        let sequence =
            build_swd_transfer(PortType::AccessPort, TransferType::Write(0x0000_0007), 0xc);
        assert_eq!(sequence.len(), TRANSFER_LEN);
        // APnDP, RnW, A2, A3 and parity
        assert_eq!(&sequence.io_bits()[3..8], &[true, false, true, true, true]);
        assert_eq!(&sequence.io_bits()[15..18], &[true, true, true]);
        assert!(sequence.io_bits()[47]);
    }

    #[test]
    fn ack_decoding() {
        let mut driver = ScriptedSwd::default();
        driver.respond(0b010, 0);
        driver.respond(0b100, 0);
        driver.respond(0b111, 0);
        driver.respond(0b011, 0);
        let mut dp = SwdDp::new(driver);

        let mut read = || dp.raw_read_register(PortType::DebugPort, 0x4);
        assert!(matches!(read(), Err(DapError::WaitResponse)));
        assert!(matches!(read(), Err(DapError::FaultResponse)));
        assert!(matches!(read(), Err(DapError::NoAcknowledge)));
        assert!(matches!(read(), Err(DapError::UnexpectedAck { ack: 0b011 })));
        assert_eq!(read().unwrap(), 0);
    }

    #[test]
    fn parity_error() {
        let mut response = vec![false; TRANSFER_LEN];
        response[ACK_OFFSET] = true;
        response[ACK_OFFSET + 3] = true;
        assert!(matches!(
            parse_swd_response(&response, true),
            Err(DapError::IncorrectParity)
        ));
        // Parity is not checked on writes
        assert_eq!(parse_swd_response(&response, false).unwrap(), 0);
    }

    #[test]
    fn ap_read_collects_result_from_rdbuff() {
        let mut driver = ScriptedSwd::default();
        driver.respond_ok(0xdead_beef);
        driver.respond_ok(0x1234_5678);
        let mut dp = SwdDp::new(driver);

        assert_eq!(dp.raw_read_register(PortType::AccessPort, 0xc).unwrap(), 0x1234_5678);
        let requests: Vec<_> = dp
            .driver
            .sequences
            .iter()
            .map(ScriptedSwd::request)
            .collect();
        assert_eq!(requests, vec![(true, true, 0xc), (false, true, 0xc)]);
    }

    #[test]
    fn ap_block_read_is_pipelined() {
        let mut driver = ScriptedSwd::default();
        for value in [0, 1, 2, 3] {
            driver.respond_ok(value);
        }
        let mut dp = SwdDp::new(driver);

        let mut values = [0; 3];
        dp.raw_read_block(PortType::AccessPort, 0xc, &mut values).unwrap();
        assert_eq!(values, [1, 2, 3]);
        assert_eq!(dp.driver.sequences.len(), 4);
    }

    #[test]
    fn targetsel_write_follows_line_reset() {
        let mut driver = ScriptedSwd::default();
        // The acknowledge is not driven
        driver.respond(0b111, 0);
        line_reset_and_write(&mut driver, 0xc, 0x1100_2927).unwrap();

        let sequence = &driver.sequences[0];
        assert_eq!(sequence.len(), LINE_RESET_BITS + TRANSFER_LEN);
        assert!(sequence.io_bits()[..LINE_RESET_BITS].iter().all(|bit| *bit));
        assert_eq!(ScriptedSwd::request(sequence), (false, false, 0xc));
    }

    fn target() -> TargetSelect {
        TargetSelect {
            targetid: 0x0100_2927,
            instance: 1,
        }
    }

    #[test]
    fn target_selection_succeeds() {
        let mut driver = ScriptedSwd::default();
        // TARGETSEL, DPIDR, SELECT, TARGETID, SELECT, DLPIDR, SELECT
        driver.respond(0b111, 0);
        driver.respond_ok(0x0bc1_2477);
        driver.respond_ok(0);
        driver.respond_ok(0x0100_2927);
        driver.respond_ok(0);
        driver.respond_ok(0x1000_0001);
        let mut dp = SwdDp::new(driver);

        select_target(&mut dp, &target()).unwrap();
        assert_eq!(dp.driver.sequences.len(), 7);
    }

    #[test]
    fn target_selection_gives_up() {
        let mut dp = SwdDp::new(ScriptedSwd::default());

        let result = select_target(&mut dp, &target());
        assert!(matches!(
            result,
            Err(Error::TargetSelectionFailed { attempts: 3, .. })
        ));
        let line_resets = dp
            .driver
            .sequences
            .iter()
            .filter(|sequence| sequence.len() > TRANSFER_LEN)
            .count();
        assert_eq!(line_resets, TARGET_SELECT_ATTEMPTS);
    }
}
