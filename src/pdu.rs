//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! Requests are built with the `IscsiPdu::*_request` constructors. Everything
//! the target sends is decoded into the [`TargetPdu`] sum type, one variant per
//! response kind.

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::error::{IscsiError, LoginStatus, ScsiResult};
use crate::login::LoginStage;
use crate::scsi::ScsiStatus;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::io::{Read, Write};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Header and data digests are CRC32C values
pub const DIGEST_SIZE: usize = 4;

/// Largest value the 24-bit DataSegmentLength field can hold
pub const MAX_DATA_SEGMENT_LENGTH: u32 = 0x00FF_FFFF;

/// Reserved tag value (ITT/TTT "not used")
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    // Initiator opcodes (initiator → target)
    NopOut = 0x00,
    ScsiCommand = 0x01,
    TaskManagementRequest = 0x02,
    LoginRequest = 0x03,
    TextRequest = 0x04,
    ScsiDataOut = 0x05,
    LogoutRequest = 0x06,
    SnackRequest = 0x10,

    // Target opcodes (target → initiator)
    NopIn = 0x20,
    ScsiResponse = 0x21,
    TaskManagementResponse = 0x22,
    LoginResponse = 0x23,
    TextResponse = 0x24,
    ScsiDataIn = 0x25,
    LogoutResponse = 0x26,
    ReadyToTransfer = 0x31,
    AsyncMessage = 0x32,
    Reject = 0x3F,
}

impl OpCode {
    pub fn from_u8(val: u8) -> ScsiResult<Self> {
        Ok(match val {
            0x00 => OpCode::NopOut,
            0x01 => OpCode::ScsiCommand,
            0x02 => OpCode::TaskManagementRequest,
            0x03 => OpCode::LoginRequest,
            0x04 => OpCode::TextRequest,
            0x05 => OpCode::ScsiDataOut,
            0x06 => OpCode::LogoutRequest,
            0x10 => OpCode::SnackRequest,
            0x20 => OpCode::NopIn,
            0x21 => OpCode::ScsiResponse,
            0x22 => OpCode::TaskManagementResponse,
            0x23 => OpCode::LoginResponse,
            0x24 => OpCode::TextResponse,
            0x25 => OpCode::ScsiDataIn,
            0x26 => OpCode::LogoutResponse,
            0x31 => OpCode::ReadyToTransfer,
            0x32 => OpCode::AsyncMessage,
            0x3F => OpCode::Reject,
            other => {
                return Err(IscsiError::Protocol(format!(
                    "Unrecognized opcode 0x{:02x}",
                    other
                )))
            }
        })
    }

    /// Get the opcode name for debugging
    pub fn name(self) -> &'static str {
        match self {
            OpCode::NopOut => "NOP-Out",
            OpCode::ScsiCommand => "SCSI Command",
            OpCode::TaskManagementRequest => "Task Management Request",
            OpCode::LoginRequest => "Login Request",
            OpCode::TextRequest => "Text Request",
            OpCode::ScsiDataOut => "SCSI Data-Out",
            OpCode::LogoutRequest => "Logout Request",
            OpCode::SnackRequest => "SNACK Request",
            OpCode::NopIn => "NOP-In",
            OpCode::ScsiResponse => "SCSI Response",
            OpCode::TaskManagementResponse => "Task Management Response",
            OpCode::LoginResponse => "Login Response",
            OpCode::TextResponse => "Text Response",
            OpCode::ScsiDataIn => "SCSI Data-In",
            OpCode::LogoutResponse => "Logout Response",
            OpCode::ReadyToTransfer => "Ready To Transfer",
            OpCode::AsyncMessage => "Async Message",
            OpCode::Reject => "Reject",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// iSCSI PDU flags (byte 1)
pub mod flags {
    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTR_SIMPLE: u8 = 0x01;

    // Login flags
    pub const TRANSIT: u8 = 0x80;

    // SCSI Data-In flags
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const RESIDUAL_OVERFLOW: u8 = 0x04;
    pub const RESIDUAL_UNDERFLOW: u8 = 0x02;
    pub const STATUS_PRESENT: u8 = 0x01;
}

/// Logout reason codes (RFC 3720 Section 10.14.1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    CloseSession = 0,
    CloseConnection = 1,
    RemoveConnectionForRecovery = 2,
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// Reject reasons (RFC 3720 Section 10.17.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DataDigestError,
    SnackReject,
    ProtocolError,
    CommandNotSupported,
    ImmediateCommandReject,
    TaskInProgress,
    InvalidDataAck,
    InvalidPduField,
    LongOperationReject,
    NegotiationReset,
    WaitingForLogout,
    Other(u8),
}

impl RejectReason {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0x02 => RejectReason::DataDigestError,
            0x03 => RejectReason::SnackReject,
            0x04 => RejectReason::ProtocolError,
            0x05 => RejectReason::CommandNotSupported,
            0x06 => RejectReason::ImmediateCommandReject,
            0x07 => RejectReason::TaskInProgress,
            0x08 => RejectReason::InvalidDataAck,
            0x09 => RejectReason::InvalidPduField,
            0x0A => RejectReason::LongOperationReject,
            0x0B => RejectReason::NegotiationReset,
            0x0C => RejectReason::WaitingForLogout,
            other => RejectReason::Other(other),
        }
    }
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
///
/// Only the fields common to every PDU live here; opcode-specific fields are
/// read and written directly in the raw header by the typed PDU helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeaderSegment {
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode (lower 6 bits of byte 0)
    pub opcode: OpCode,
    /// Final flag (bit 7 of byte 1)
    pub final_pdu: bool,
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub total_ahs_length: u8,
    /// Data segment length (bytes, 24 bits)
    pub data_segment_length: u32,
    /// Initiator Task Tag (bytes 16-19)
    pub initiator_task_tag: u32,
}

impl BasicHeaderSegment {
    pub fn read_from(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::Protocol(format!(
                "BHS too short: {} bytes, need {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        Ok(BasicHeaderSegment {
            immediate: (buf[0] & 0x40) != 0,
            opcode: OpCode::from_u8(buf[0] & 0x3F)?,
            final_pdu: (buf[1] & flags::FINAL) != 0,
            total_ahs_length: buf[4],
            data_segment_length: BigEndian::read_u24(&buf[5..8]),
            initiator_task_tag: BigEndian::read_u32(&buf[16..20]),
        })
    }

    /// Write the common fields, leaving opcode-specific bits of byte 1 untouched
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(self.data_segment_length <= MAX_DATA_SEGMENT_LENGTH);

        buf[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode as u8 & 0x3F);
        if self.final_pdu {
            buf[1] |= flags::FINAL;
        } else {
            buf[1] &= !flags::FINAL;
        }
        BigEndian::write_u32(&mut buf[4..8], self.data_segment_length & MAX_DATA_SEGMENT_LENGTH);
        buf[4] = self.total_ahs_length;
        BigEndian::write_u32(&mut buf[16..20], self.initiator_task_tag);
    }
}

/// One framed PDU: the raw 48-byte header plus its data segment
#[derive(Debug, Clone)]
pub struct IscsiPdu {
    pub header: [u8; BHS_SIZE],
    pub data: Vec<u8>,
}

impl IscsiPdu {
    /// Create an empty PDU with the given opcode
    pub fn new(opcode: OpCode, immediate: bool) -> Self {
        let mut header = [0u8; BHS_SIZE];
        header[0] = (if immediate { 0x40 } else { 0 }) | opcode as u8;
        IscsiPdu {
            header,
            data: Vec::new(),
        }
    }

    pub fn bhs(&self) -> ScsiResult<BasicHeaderSegment> {
        BasicHeaderSegment::read_from(&self.header)
    }

    pub fn opcode(&self) -> ScsiResult<OpCode> {
        OpCode::from_u8(self.header[0] & 0x3F)
    }

    /// Byte 1 of the header (final bit plus opcode-specific flags)
    pub fn flags(&self) -> u8 {
        self.header[1]
    }

    pub fn itt(&self) -> u32 {
        BigEndian::read_u32(&self.header[16..20])
    }

    pub fn lun(&self) -> u64 {
        BigEndian::read_u64(&self.header[8..16])
    }

    fn set_lun(&mut self, lun: u64) {
        BigEndian::write_u64(&mut self.header[8..16], lun);
    }

    fn set_itt(&mut self, itt: u32) {
        BigEndian::write_u32(&mut self.header[16..20], itt);
    }

    fn field_u32(&self, offset: usize) -> u32 {
        BigEndian::read_u32(&self.header[offset..offset + 4])
    }

    fn set_field_u32(&mut self, offset: usize, value: u32) {
        BigEndian::write_u32(&mut self.header[offset..offset + 4], value);
    }

    /// Read one PDU from the stream
    ///
    /// Digests, when enabled, are consumed but not verified. Any short read
    /// surfaces as an I/O error.
    pub fn read_from<R: Read>(
        reader: &mut R,
        header_digest: bool,
        data_digest: bool,
    ) -> ScsiResult<Self> {
        let mut header = [0u8; BHS_SIZE];
        reader.read_exact(&mut header)?;

        let ahs_len = header[4] as usize * 4;
        if ahs_len > 0 {
            let mut ahs = vec![0u8; ahs_len];
            reader.read_exact(&mut ahs)?;
        }

        if header_digest {
            let mut digest = [0u8; DIGEST_SIZE];
            reader.read_exact(&mut digest)?;
        }

        let data_len = BigEndian::read_u24(&header[5..8]) as usize;
        let mut data = vec![0u8; data_len];
        if data_len > 0 {
            reader.read_exact(&mut data)?;

            let padding = (4 - data_len % 4) % 4;
            if padding > 0 {
                let mut pad = [0u8; 3];
                reader.read_exact(&mut pad[..padding])?;
            }

            if data_digest {
                let mut digest = [0u8; DIGEST_SIZE];
                reader.read_exact(&mut digest)?;
            }
        }

        Ok(IscsiPdu { header, data })
    }

    /// Serialize PDU to bytes (header, data segment, zero padding)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_length());
        buf.extend_from_slice(&self.header);
        BigEndian::write_u24(&mut buf[5..8], self.data.len() as u32 & MAX_DATA_SEGMENT_LENGTH);
        buf.extend_from_slice(&self.data);
        buf.resize(self.total_length(), 0);
        buf
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> ScsiResult<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Get the total PDU length including header and padded data
    pub fn total_length(&self) -> usize {
        BHS_SIZE + self.data.len().div_ceil(4) * 4
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        self.opcode().map(OpCode::name).unwrap_or("Unknown")
    }
}

// ============================================================================
// Initiator requests
// ============================================================================

impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: LoginStage,
        nsg: LoginStage,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new(OpCode::LoginRequest, true);

        // Flags: Transit | Continue | CSG | NSG
        pdu.header[1] = (if transit { flags::TRANSIT } else { 0 })
            | ((csg as u8 & 0x03) << 2)
            | (nsg as u8 & 0x03);
        // Version-max / version-min both 0x00
        pdu.header[2] = 0;
        pdu.header[3] = 0;

        // ISID + TSIH in the LUN field
        pdu.header[8..14].copy_from_slice(&isid);
        BigEndian::write_u16(&mut pdu.header[14..16], tsih);
        pdu.set_itt(itt);

        BigEndian::write_u16(&mut pdu.header[20..22], cid);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);

        pdu.data = data;
        pdu
    }

    /// Create a Text Request PDU
    pub fn text_request(
        itt: u32,
        ttt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new(OpCode::TextRequest, false);
        pdu.header[1] = if final_flag { flags::FINAL } else { 0 };
        pdu.set_itt(itt);
        pdu.set_field_u32(20, ttt);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.data = data;
        pdu
    }

    /// Create a SCSI Command PDU carrying `immediate_data`
    ///
    /// The F bit is always set: no unsolicited Data-Out PDUs follow.
    pub fn scsi_command(
        lun: u64,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        cdb: [u8; 16],
        read: bool,
        write: bool,
        expected_data_length: u32,
        immediate_data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new(OpCode::ScsiCommand, false);
        pdu.header[1] = flags::FINAL
            | (if read { flags::READ } else { 0 })
            | (if write { flags::WRITE } else { 0 })
            | flags::ATTR_SIMPLE;
        pdu.set_lun(lun);
        pdu.set_itt(itt);
        pdu.set_field_u32(20, expected_data_length);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.header[32..48].copy_from_slice(&cdb);
        pdu.data = immediate_data;
        pdu
    }

    /// Create a SCSI Data-Out PDU (solicited by an R2T)
    pub fn scsi_data_out(
        lun: u64,
        itt: u32,
        ttt: u32,
        exp_stat_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new(OpCode::ScsiDataOut, false);
        pdu.header[1] = if final_flag { flags::FINAL } else { 0 };
        pdu.set_lun(lun);
        pdu.set_itt(itt);
        pdu.set_field_u32(20, ttt);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.set_field_u32(36, data_sn);
        pdu.set_field_u32(40, buffer_offset);
        pdu.data = data;
        pdu
    }

    /// Create a Logout Request PDU
    pub fn logout_request(
        itt: u32,
        cid: u16,
        cmd_sn: u32,
        exp_stat_sn: u32,
        reason: LogoutReason,
    ) -> Self {
        let mut pdu = IscsiPdu::new(OpCode::LogoutRequest, true);
        pdu.header[1] = flags::FINAL | (reason as u8 & 0x7F);
        pdu.set_itt(itt);
        BigEndian::write_u16(&mut pdu.header[20..22], cid);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu
    }
}

// ============================================================================
// Target responses
// ============================================================================

/// Parsed Login Response
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub transit: bool,
    pub cont: bool,
    pub current_stage: LoginStage,
    pub next_stage: LoginStage,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status: LoginStatus,
    pub data: Vec<u8>,
}

/// Parsed Logout Response
#[derive(Debug, Clone)]
pub struct LogoutResponse {
    pub response: u8,
    pub itt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub time2wait: u16,
    pub time2retain: u16,
}

/// Parsed Ready To Transfer (R2T)
#[derive(Debug, Clone)]
pub struct ReadyToTransfer {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_transfer_length: u32,
}

/// Parsed Reject
#[derive(Debug, Clone)]
pub struct Reject {
    pub reason: RejectReason,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    /// Header of the rejected PDU
    pub rejected_header: Vec<u8>,
}

/// Parsed SCSI Data-In
#[derive(Debug, Clone)]
pub struct DataIn {
    pub final_pdu: bool,
    pub acknowledge: bool,
    pub residual_overflow: bool,
    pub residual_underflow: bool,
    /// SCSI status, present only when the S bit is set
    pub status: Option<ScsiStatus>,
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
    pub data: Vec<u8>,
}

/// Parsed SCSI Response
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    pub final_pdu: bool,
    /// iSCSI response code (0 = command completed at target)
    pub response: u8,
    pub status: ScsiStatus,
    pub itt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub residual_count: u32,
    pub data: Vec<u8>,
}

impl ScsiResponse {
    /// Sense bytes from the data segment: 2-byte big-endian length, then sense
    pub fn sense_data(&self) -> Option<Vec<u8>> {
        if self.data.len() < 2 {
            return None;
        }
        let sense_len = BigEndian::read_u16(&self.data[0..2]) as usize;
        let end = (2 + sense_len).min(self.data.len());
        Some(self.data[2..end].to_vec())
    }
}

/// Parsed Text Response
#[derive(Debug, Clone)]
pub struct TextResponse {
    pub final_pdu: bool,
    pub cont: bool,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data: Vec<u8>,
}

/// Parsed NOP-In
#[derive(Debug, Clone)]
pub struct NopIn {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data: Vec<u8>,
}

/// Any PDU a target may send to the initiator
#[derive(Debug, Clone)]
pub enum TargetPdu {
    LoginResponse(LoginResponse),
    LogoutResponse(LogoutResponse),
    ReadyToTransfer(ReadyToTransfer),
    Reject(Reject),
    DataIn(DataIn),
    ScsiResponse(ScsiResponse),
    TextResponse(TextResponse),
    NopIn(NopIn),
}

impl TargetPdu {
    /// Decode a received PDU into its typed form
    pub fn decode(pdu: IscsiPdu) -> ScsiResult<Self> {
        let bhs = pdu.bhs()?;
        let f = pdu.flags();

        Ok(match bhs.opcode {
            OpCode::LoginResponse => {
                let mut isid = [0u8; 6];
                isid.copy_from_slice(&pdu.header[8..14]);
                TargetPdu::LoginResponse(LoginResponse {
                    transit: (f & flags::TRANSIT) != 0,
                    cont: (f & flags::CONTINUE) != 0,
                    current_stage: LoginStage::from_u8((f >> 2) & 0x03)?,
                    next_stage: LoginStage::from_u8(f & 0x03)?,
                    isid,
                    tsih: BigEndian::read_u16(&pdu.header[14..16]),
                    itt: bhs.initiator_task_tag,
                    stat_sn: pdu.field_u32(24),
                    exp_cmd_sn: pdu.field_u32(28),
                    max_cmd_sn: pdu.field_u32(32),
                    status: LoginStatus::new(pdu.header[36], pdu.header[37]),
                    data: pdu.data,
                })
            }
            OpCode::LogoutResponse => TargetPdu::LogoutResponse(LogoutResponse {
                response: pdu.header[2],
                itt: bhs.initiator_task_tag,
                stat_sn: pdu.field_u32(24),
                exp_cmd_sn: pdu.field_u32(28),
                max_cmd_sn: pdu.field_u32(32),
                time2wait: BigEndian::read_u16(&pdu.header[40..42]),
                time2retain: BigEndian::read_u16(&pdu.header[42..44]),
            }),
            OpCode::ReadyToTransfer => TargetPdu::ReadyToTransfer(ReadyToTransfer {
                lun: pdu.lun(),
                itt: bhs.initiator_task_tag,
                ttt: pdu.field_u32(20),
                stat_sn: pdu.field_u32(24),
                exp_cmd_sn: pdu.field_u32(28),
                max_cmd_sn: pdu.field_u32(32),
                r2t_sn: pdu.field_u32(36),
                buffer_offset: pdu.field_u32(40),
                desired_transfer_length: pdu.field_u32(44),
            }),
            OpCode::Reject => TargetPdu::Reject(Reject {
                reason: RejectReason::from_u8(pdu.header[2]),
                stat_sn: pdu.field_u32(24),
                exp_cmd_sn: pdu.field_u32(28),
                max_cmd_sn: pdu.field_u32(32),
                data_sn: pdu.field_u32(36),
                rejected_header: pdu.data,
            }),
            OpCode::ScsiDataIn => {
                let status_present = (f & flags::STATUS_PRESENT) != 0;
                TargetPdu::DataIn(DataIn {
                    final_pdu: bhs.final_pdu,
                    acknowledge: (f & flags::ACKNOWLEDGE) != 0,
                    residual_overflow: (f & flags::RESIDUAL_OVERFLOW) != 0,
                    residual_underflow: (f & flags::RESIDUAL_UNDERFLOW) != 0,
                    status: status_present.then(|| ScsiStatus::from_u8(pdu.header[3])),
                    lun: pdu.lun(),
                    itt: bhs.initiator_task_tag,
                    ttt: pdu.field_u32(20),
                    stat_sn: pdu.field_u32(24),
                    exp_cmd_sn: pdu.field_u32(28),
                    max_cmd_sn: pdu.field_u32(32),
                    data_sn: pdu.field_u32(36),
                    buffer_offset: pdu.field_u32(40),
                    residual_count: pdu.field_u32(44),
                    data: pdu.data,
                })
            }
            OpCode::ScsiResponse => TargetPdu::ScsiResponse(ScsiResponse {
                final_pdu: bhs.final_pdu,
                response: pdu.header[2],
                status: ScsiStatus::from_u8(pdu.header[3]),
                itt: bhs.initiator_task_tag,
                stat_sn: pdu.field_u32(24),
                exp_cmd_sn: pdu.field_u32(28),
                max_cmd_sn: pdu.field_u32(32),
                exp_data_sn: pdu.field_u32(36),
                residual_count: pdu.field_u32(44),
                data: pdu.data,
            }),
            OpCode::TextResponse => TargetPdu::TextResponse(TextResponse {
                final_pdu: bhs.final_pdu,
                cont: (f & flags::CONTINUE) != 0,
                itt: bhs.initiator_task_tag,
                ttt: pdu.field_u32(20),
                stat_sn: pdu.field_u32(24),
                exp_cmd_sn: pdu.field_u32(28),
                max_cmd_sn: pdu.field_u32(32),
                data: pdu.data,
            }),
            OpCode::NopIn => TargetPdu::NopIn(NopIn {
                lun: pdu.lun(),
                itt: bhs.initiator_task_tag,
                ttt: pdu.field_u32(20),
                stat_sn: pdu.field_u32(24),
                exp_cmd_sn: pdu.field_u32(28),
                max_cmd_sn: pdu.field_u32(32),
                data: pdu.data,
            }),
            other => {
                return Err(IscsiError::Protocol(format!(
                    "Unrecognized response opcode: {} (0x{:02x})",
                    other, other as u8
                )))
            }
        })
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            TargetPdu::LoginResponse(_) => OpCode::LoginResponse,
            TargetPdu::LogoutResponse(_) => OpCode::LogoutResponse,
            TargetPdu::ReadyToTransfer(_) => OpCode::ReadyToTransfer,
            TargetPdu::Reject(_) => OpCode::Reject,
            TargetPdu::DataIn(_) => OpCode::ScsiDataIn,
            TargetPdu::ScsiResponse(_) => OpCode::ScsiResponse,
            TargetPdu::TextResponse(_) => OpCode::TextResponse,
            TargetPdu::NopIn(_) => OpCode::NopIn,
        }
    }

    /// StatSN, for PDUs that carry status
    pub fn status_sequence_number(&self) -> Option<u32> {
        match self {
            TargetPdu::LoginResponse(r) => Some(r.stat_sn),
            TargetPdu::LogoutResponse(r) => Some(r.stat_sn),
            TargetPdu::ReadyToTransfer(_) => None,
            TargetPdu::Reject(r) => Some(r.stat_sn),
            TargetPdu::DataIn(r) => r.status.map(|_| r.stat_sn),
            TargetPdu::ScsiResponse(r) => Some(r.stat_sn),
            TargetPdu::TextResponse(r) => Some(r.stat_sn),
            // Unsolicited NOP-In does not advance StatSN
            TargetPdu::NopIn(r) => (r.itt != RESERVED_TAG).then_some(r.stat_sn),
        }
    }

    /// Unwrap the variant the caller expects, or fail with a protocol error
    pub fn expect<T: Response>(self) -> ScsiResult<T> {
        let got = self.opcode();
        T::from_target_pdu(self).ok_or_else(|| {
            IscsiError::Protocol(format!(
                "Unexpected response, expected {}, got {}",
                T::OPCODE,
                got
            ))
        })
    }
}

/// A typed response that can be extracted from a [`TargetPdu`]
pub trait Response: Sized {
    const OPCODE: OpCode;

    fn from_target_pdu(pdu: TargetPdu) -> Option<Self>;
}

macro_rules! impl_response {
    ($ty:ident, $opcode:expr, $variant:ident) => {
        impl Response for $ty {
            const OPCODE: OpCode = $opcode;

            fn from_target_pdu(pdu: TargetPdu) -> Option<Self> {
                match pdu {
                    TargetPdu::$variant(r) => Some(r),
                    _ => None,
                }
            }
        }
    };
}

impl_response!(LoginResponse, OpCode::LoginResponse, LoginResponse);
impl_response!(LogoutResponse, OpCode::LogoutResponse, LogoutResponse);
impl_response!(ReadyToTransfer, OpCode::ReadyToTransfer, ReadyToTransfer);
impl_response!(Reject, OpCode::Reject, Reject);
impl_response!(DataIn, OpCode::ScsiDataIn, DataIn);
impl_response!(ScsiResponse, OpCode::ScsiResponse, ScsiResponse);
impl_response!(TextResponse, OpCode::TextResponse, TextResponse);
impl_response!(NopIn, OpCode::NopIn, NopIn);

// ============================================================================
// Unit Tests
// ============================================================================
