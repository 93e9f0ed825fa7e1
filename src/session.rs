//! iSCSI session management
//!
//! A [`Session`] owns exactly one logged-in [`Connection`] and exposes the
//! LUN-level operations: discovery, LUN listing, capacity, block read/write
//! and raw CDB passthrough. Dropping a session logs it out.
//!
//! Session-wide identifiers and counters live in [`SessionState`], which the
//! connection borrows for every exchange.

use crate::auth::Authenticator;
use crate::connection::Connection;
use crate::disk::DiskStream;
use crate::error::{IscsiError, ScsiResult};
use crate::params::{ConnectionParams, Negotiated, SessionParams, SessionType, SESSION_KEYS};
use crate::pdu::LogoutReason;
use crate::scsi::{
    InquiryData, LunCapacity, LunClass, LunInfo, ReportLunsData, ScsiCommand,
};
use crate::target::{TargetAddress, TargetInfo};
use once_cell::sync::Lazy;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide source of initiator session ids, seeded randomly
static NEXT_INITIATOR_SESSION_ID: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::random::<u32>()));

/// Identifiers, counters and negotiated values shared by a session's connections
#[derive(Debug)]
pub struct SessionState {
    pub(crate) initiator_session_id: u32,
    /// TSIH assigned by the target during login
    pub(crate) target_session_id: u16,
    pub(crate) command_sequence_number: u32,
    pub(crate) current_task_tag: u32,
    pub(crate) params: Negotiated<SessionParams>,
    next_connection_id: u16,
}

impl SessionState {
    pub fn new(params: SessionParams) -> Self {
        let initiator_session_id = NEXT_INITIATOR_SESSION_ID
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);

        SessionState {
            initiator_session_id,
            target_session_id: 0,
            command_sequence_number: 1,
            current_task_tag: 1,
            params: Negotiated::new(params, SESSION_KEYS),
            next_connection_id: 0,
        }
    }

    pub fn initiator_session_id(&self) -> u32 {
        self.initiator_session_id
    }

    pub fn target_session_id(&self) -> u16 {
        self.target_session_id
    }

    pub fn command_sequence_number(&self) -> u32 {
        self.command_sequence_number
    }

    pub fn current_task_tag(&self) -> u32 {
        self.current_task_tag
    }

    /// Negotiated session-wide values
    pub fn params(&self) -> &SessionParams {
        &self.params.values
    }

    pub fn is_discovery(&self) -> bool {
        self.params.values.session_type == SessionType::Discovery
    }

    /// ISID: random-qualifier format (type 0b10) carrying the session id
    pub fn isid(&self) -> [u8; 6] {
        let id = self.initiator_session_id.to_be_bytes();
        [0x80, id[1], id[2], id[3], 0, 0]
    }

    pub(crate) fn next_command_sequence_number(&mut self) -> u32 {
        self.command_sequence_number = self.command_sequence_number.wrapping_add(1);
        self.command_sequence_number
    }

    pub(crate) fn next_task_tag(&mut self) -> u32 {
        self.current_task_tag = self.current_task_tag.wrapping_add(1);
        self.current_task_tag
    }

    pub(crate) fn next_connection_id(&mut self) -> u16 {
        self.next_connection_id = self.next_connection_id.wrapping_add(1);
        self.next_connection_id
    }
}

/// A logged-in session with one connection
pub struct Session<S: Read + Write> {
    state: SessionState,
    connection: Option<Connection<S>>,
    addresses: Vec<TargetAddress>,
}

impl<S: Read + Write> Session<S> {
    /// Log in over `stream`
    ///
    /// # Arguments
    ///
    /// * `stream` - Connected byte stream to one of `addresses`
    /// * `params` - Session type, names and initial operational values
    /// * `authenticators` - Methods offered to the target, in preference order
    /// * `connection_params` - Initial per-connection values
    /// * `addresses` - Portals of the target, reported back in [`LunInfo`]
    ///
    /// # Errors
    ///
    /// Returns an error if the login handshake fails.
    pub fn open(
        stream: S,
        params: SessionParams,
        authenticators: Vec<Box<dyn Authenticator>>,
        connection_params: ConnectionParams,
        addresses: Vec<TargetAddress>,
    ) -> ScsiResult<Self> {
        let mut state = SessionState::new(params);
        let connection = Connection::connect(stream, &mut state, authenticators, connection_params)?;

        Ok(Session {
            state,
            connection: Some(connection),
            addresses,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The active connection, if the session is still open
    pub fn connection(&self) -> Option<&Connection<S>> {
        self.connection.as_ref()
    }

    pub fn target_name(&self) -> Option<&str> {
        self.state.params.values.target_name.as_deref()
    }

    /// Targets reachable through this portal (SendTargets)
    pub fn enumerate_targets(&mut self) -> ScsiResult<Vec<TargetInfo>> {
        let conn = active(&mut self.connection)?;
        conn.enumerate_targets(&mut self.state)
    }

    /// Execute a SCSI command, returning the number of bytes read
    fn send(&mut self, cmd: &ScsiCommand, out: &[u8], input: &mut [u8]) -> ScsiResult<usize> {
        let conn = active(&mut self.connection)?;
        let len = conn.send_command(&mut self.state, cmd, out, input)?;
        Ok(len.min(input.len()))
    }

    fn report_luns(&mut self, allocation_length: u32) -> ScsiResult<ReportLunsData> {
        let mut buf = vec![0u8; allocation_length as usize];
        let len = self.send(&ScsiCommand::report_luns(allocation_length), &[], &mut buf)?;
        ReportLunsData::parse(&buf[..len])
    }

    /// Every LUN on the target, described by a standard INQUIRY
    pub fn get_luns(&mut self) -> ScsiResult<Vec<LunInfo>> {
        let mut resp = self.report_luns(ReportLunsData::INITIAL_RESPONSE_LENGTH)?;
        if resp.truncated {
            resp = self.report_luns(resp.needed_data_length)?;
        }
        if resp.truncated {
            return Err(IscsiError::Protocol("Truncated REPORT LUNS response".to_string()));
        }

        resp.luns.iter().map(|&lun| self.get_info(lun)).collect()
    }

    /// LUNs whose peripheral device type is direct-access block storage
    pub fn get_block_device_luns(&mut self) -> ScsiResult<Vec<u64>> {
        Ok(self
            .get_luns()?
            .into_iter()
            .filter(|info| info.device_type == LunClass::BlockStorage)
            .map(|info| info.lun)
            .collect())
    }

    pub fn get_info(&mut self, lun: u64) -> ScsiResult<LunInfo> {
        let mut buf = vec![0u8; InquiryData::RESPONSE_LENGTH as usize];
        let len = self.send(
            &ScsiCommand::inquiry(lun, InquiryData::RESPONSE_LENGTH),
            &[],
            &mut buf,
        )?;
        let inquiry = InquiryData::parse(&buf[..len])?;

        Ok(LunInfo {
            target: TargetInfo::new(self.target_name().unwrap_or_default(), self.addresses.clone()),
            lun,
            device_type: inquiry.device_type,
            removable: inquiry.removable,
            vendor_id: inquiry.vendor_id,
            product_id: inquiry.product_id,
            product_revision: inquiry.product_revision,
        })
    }

    pub fn get_capacity(&mut self, lun: u64) -> ScsiResult<LunCapacity> {
        let mut buf = [0u8; LunCapacity::READ_CAPACITY10_LENGTH];
        let len = self.send(&ScsiCommand::read_capacity10(lun), &[], &mut buf)?;
        LunCapacity::parse_read_capacity10(&buf[..len])
    }

    /// Read `block_count` blocks starting at `start_block` into `buffer`
    ///
    /// Returns the number of bytes the target delivered.
    pub fn read(
        &mut self,
        lun: u64,
        start_block: u64,
        block_count: u16,
        buffer: &mut [u8],
    ) -> ScsiResult<usize> {
        let lba = block_address(start_block)?;
        self.send(&ScsiCommand::read10(lun, lba, block_count), &[], buffer)
    }

    /// Write `block_count` blocks of `block_size` bytes from `buffer`
    pub fn write(
        &mut self,
        lun: u64,
        start_block: u64,
        block_count: u16,
        block_size: u32,
        buffer: &[u8],
    ) -> ScsiResult<()> {
        let lba = block_address(start_block)?;
        let length = block_count as usize * block_size as usize;
        if buffer.len() < length {
            return Err(IscsiError::Config(format!(
                "Write of {} blocks needs {} bytes, buffer holds {}",
                block_count,
                length,
                buffer.len()
            )));
        }

        self.send(
            &ScsiCommand::write10(lun, lba, block_count),
            &buffer[..length],
            &mut [],
        )?;
        Ok(())
    }

    /// Send an arbitrary CDB
    ///
    /// `out` is written to the target, `input` receives any returned data;
    /// either may be empty. Returns the number of bytes read.
    pub fn raw_command(
        &mut self,
        lun: u64,
        cdb: &[u8],
        out: &[u8],
        input: &mut [u8],
    ) -> ScsiResult<usize> {
        let cmd = ScsiCommand::raw(lun, cdb)?;
        self.send(&cmd, out, input)
    }

    /// Open a seekable byte stream over one LUN
    pub fn open_disk(&mut self, lun: u64) -> ScsiResult<DiskStream<'_, S>> {
        DiskStream::new(self, lun)
    }

    /// Log out (reason: close session)
    pub fn close(mut self) -> ScsiResult<()> {
        self.logout()
    }

    fn logout(&mut self) -> ScsiResult<()> {
        match self.connection.take() {
            Some(conn) => conn.logout(&mut self.state, LogoutReason::CloseSession),
            None => Ok(()),
        }
    }
}

impl<S: Read + Write> Drop for Session<S> {
    fn drop(&mut self) {
        if let Err(e) = self.logout() {
            log::warn!("Logout on drop failed: {}", e);
        }
    }
}

fn active<S: Read + Write>(connection: &mut Option<Connection<S>>) -> ScsiResult<&mut Connection<S>> {
    connection
        .as_mut()
        .ok_or_else(|| IscsiError::Protocol("Session has been logged out".to_string()))
}

fn block_address(start_block: u64) -> ScsiResult<u32> {
    u32::try_from(start_block).map_err(|_| {
        IscsiError::Config(format!(
            "Block {} is beyond the READ(10)/WRITE(10) address range",
            start_block
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(SessionParams::new(
            SessionType::Normal,
            "iqn.2025-12.local:initiator",
            Some("iqn.2025-12.local:storage.disk1"),
        ))
    }

    #[test]
    fn test_initial_counters() {
        let s = state();
        assert_eq!(s.command_sequence_number(), 1);
        assert_eq!(s.current_task_tag(), 1);
        assert_eq!(s.target_session_id(), 0);
        assert!(!s.is_discovery());
    }

    #[test]
    fn test_counters_advance_by_one() {
        let mut s = state();
        assert_eq!(s.next_command_sequence_number(), 2);
        assert_eq!(s.next_command_sequence_number(), 3);
        assert_eq!(s.next_task_tag(), 2);
        assert_eq!(s.next_connection_id(), 1);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = state();
        let b = state();
        assert_ne!(a.initiator_session_id(), b.initiator_session_id());
    }

    #[test]
    fn test_isid_layout() {
        let mut s = state();
        s.initiator_session_id = 0x00AB_CDEF;
        assert_eq!(s.isid(), [0x80, 0xAB, 0xCD, 0xEF, 0, 0]);
    }

    #[test]
    fn test_block_address_range() {
        assert_eq!(block_address(7).unwrap(), 7);
        assert!(matches!(
            block_address(u32::MAX as u64 + 1),
            Err(IscsiError::Config(_))
        ));
    }
}
