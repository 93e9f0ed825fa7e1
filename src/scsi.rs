//! SCSI command descriptor blocks and response data
//!
//! This module builds the CDBs the session layer issues (INQUIRY, REPORT LUNS,
//! READ CAPACITY, READ/WRITE) and decodes the data the target returns for them,
//! per the SCSI Primary Commands (SPC) and Block Commands (SBC) specifications.
//! The iSCSI layer only sees a CDB plus an expected response length.

use crate::error::{IscsiError, ScsiResult};
use crate::target::TargetInfo;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Maximum CDB length carried in the SCSI Command BHS
pub const MAX_CDB_LENGTH: usize = 16;

/// SCSI command opcodes used by the initiator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    SynchronizeCache10 = 0x35,
    ReportLuns = 0xA0,
}

/// SCSI status byte (SAM-5 Section 5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiStatus {
    Good,
    CheckCondition,
    ConditionMet,
    Busy,
    ReservationConflict,
    TaskSetFull,
    AcaActive,
    TaskAborted,
    Other(u8),
}

impl ScsiStatus {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0x00 => ScsiStatus::Good,
            0x02 => ScsiStatus::CheckCondition,
            0x04 => ScsiStatus::ConditionMet,
            0x08 => ScsiStatus::Busy,
            0x18 => ScsiStatus::ReservationConflict,
            0x28 => ScsiStatus::TaskSetFull,
            0x30 => ScsiStatus::AcaActive,
            0x40 => ScsiStatus::TaskAborted,
            other => ScsiStatus::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ScsiStatus::Good => 0x00,
            ScsiStatus::CheckCondition => 0x02,
            ScsiStatus::ConditionMet => 0x04,
            ScsiStatus::Busy => 0x08,
            ScsiStatus::ReservationConflict => 0x18,
            ScsiStatus::TaskSetFull => 0x28,
            ScsiStatus::AcaActive => 0x30,
            ScsiStatus::TaskAborted => 0x40,
            ScsiStatus::Other(val) => val,
        }
    }
}

impl fmt::Display for ScsiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScsiStatus::Other(val) => write!(f, "0x{:02x}", val),
            known => write!(f, "{:?}", known),
        }
    }
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Key fields decoded from sense data returned with CHECK CONDITION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
}

impl SenseData {
    /// Decode fixed (0x70/0x71) or descriptor (0x72/0x73) format sense data
    pub fn parse(data: &[u8]) -> Option<Self> {
        let response_code = data.first()? & 0x7F;
        match response_code {
            0x70 | 0x71 if data.len() >= 14 => Some(SenseData {
                sense_key: data[2] & 0x0F,
                asc: data[12],
                ascq: data[13],
            }),
            0x72 | 0x73 if data.len() >= 4 => Some(SenseData {
                sense_key: data[1] & 0x0F,
                asc: data[2],
                ascq: data[3],
            }),
            _ => None,
        }
    }
}

/// A SCSI command addressed to one LUN
///
/// `lun` is the 8-byte LUN structure in wire order (as returned by REPORT LUNS).
#[derive(Debug, Clone)]
pub struct ScsiCommand {
    pub lun: u64,
    cdb: Vec<u8>,
}

impl ScsiCommand {
    /// Wrap an arbitrary CDB
    pub fn raw(lun: u64, cdb: &[u8]) -> ScsiResult<Self> {
        if cdb.is_empty() || cdb.len() > MAX_CDB_LENGTH {
            return Err(IscsiError::Config(format!(
                "CDB must be 1-{} bytes, got {}",
                MAX_CDB_LENGTH,
                cdb.len()
            )));
        }
        Ok(ScsiCommand {
            lun,
            cdb: cdb.to_vec(),
        })
    }

    /// Standard INQUIRY (EVPD=0)
    pub fn inquiry(lun: u64, allocation_length: u16) -> Self {
        let mut cdb = vec![0u8; 6];
        cdb[0] = ScsiOpcode::Inquiry as u8;
        BigEndian::write_u16(&mut cdb[3..5], allocation_length);
        ScsiCommand { lun, cdb }
    }

    /// REPORT LUNS, always addressed to LUN 0
    pub fn report_luns(allocation_length: u32) -> Self {
        let mut cdb = vec![0u8; 12];
        cdb[0] = ScsiOpcode::ReportLuns as u8;
        BigEndian::write_u32(&mut cdb[6..10], allocation_length);
        ScsiCommand { lun: 0, cdb }
    }

    pub fn read_capacity10(lun: u64) -> Self {
        let mut cdb = vec![0u8; 10];
        cdb[0] = ScsiOpcode::ReadCapacity10 as u8;
        ScsiCommand { lun, cdb }
    }

    pub fn read10(lun: u64, lba: u32, blocks: u16) -> Self {
        ScsiCommand {
            lun,
            cdb: rw10_cdb(ScsiOpcode::Read10, lba, blocks),
        }
    }

    pub fn write10(lun: u64, lba: u32, blocks: u16) -> Self {
        ScsiCommand {
            lun,
            cdb: rw10_cdb(ScsiOpcode::Write10, lba, blocks),
        }
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    /// CDB zero-padded to the 16 bytes the Command BHS carries
    pub fn cdb_bytes(&self) -> [u8; MAX_CDB_LENGTH] {
        let mut buf = [0u8; MAX_CDB_LENGTH];
        buf[..self.cdb.len()].copy_from_slice(&self.cdb);
        buf
    }
}

fn rw10_cdb(op: ScsiOpcode, lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = op as u8;
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u16(&mut cdb[7..9], blocks);
    cdb
}

/// Peripheral device type reported by INQUIRY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LunClass {
    BlockStorage,
    TapeStorage,
    Printer,
    Processor,
    WriteOnceStorage,
    OpticalDisc,
    Scanner,
    OpticalMemory,
    Jukebox,
    Communications,
    StorageArray,
    EnclosureServices,
    SimplifiedDirectAccess,
    OpticalCard,
    BridgingExpander,
    ObjectBasedStorage,
    Unknown,
}

impl LunClass {
    pub fn from_device_type(val: u8) -> Self {
        match val & 0x1F {
            0x00 => LunClass::BlockStorage,
            0x01 => LunClass::TapeStorage,
            0x02 => LunClass::Printer,
            0x03 => LunClass::Processor,
            0x04 => LunClass::WriteOnceStorage,
            0x05 => LunClass::OpticalDisc,
            0x06 => LunClass::Scanner,
            0x07 => LunClass::OpticalMemory,
            0x08 => LunClass::Jukebox,
            0x09 => LunClass::Communications,
            0x0C => LunClass::StorageArray,
            0x0D => LunClass::EnclosureServices,
            0x0E => LunClass::SimplifiedDirectAccess,
            0x0F => LunClass::OpticalCard,
            0x10 => LunClass::BridgingExpander,
            0x11 => LunClass::ObjectBasedStorage,
            _ => LunClass::Unknown,
        }
    }
}

/// Standard INQUIRY data (first 36 bytes)
#[derive(Debug, Clone)]
pub struct InquiryData {
    pub device_type: LunClass,
    pub removable: bool,
    pub vendor_id: String,
    pub product_id: String,
    pub product_revision: String,
}

impl InquiryData {
    pub const RESPONSE_LENGTH: u16 = 36;

    pub fn parse(data: &[u8]) -> ScsiResult<Self> {
        if data.len() < Self::RESPONSE_LENGTH as usize {
            return Err(IscsiError::Protocol(format!(
                "Truncated INQUIRY response: {} bytes",
                data.len()
            )));
        }
        Ok(InquiryData {
            device_type: LunClass::from_device_type(data[0]),
            removable: (data[1] & 0x80) != 0,
            vendor_id: ascii_field(&data[8..16]),
            product_id: ascii_field(&data[16..32]),
            product_revision: ascii_field(&data[32..36]),
        })
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// REPORT LUNS parameter data
#[derive(Debug, Clone)]
pub struct ReportLunsData {
    pub luns: Vec<u64>,
    /// Bytes the target wanted to return (header included)
    pub needed_data_length: u32,
    pub truncated: bool,
}

impl ReportLunsData {
    pub const INITIAL_RESPONSE_LENGTH: u32 = 20;

    pub fn parse(data: &[u8]) -> ScsiResult<Self> {
        if data.len() < 8 {
            return Err(IscsiError::Protocol(format!(
                "Truncated REPORT LUNS header: {} bytes",
                data.len()
            )));
        }
        let list_length = BigEndian::read_u32(&data[0..4]);
        let needed_data_length = list_length.saturating_add(8);
        let available = (data.len() - 8).min(list_length as usize);
        let luns = data[8..8 + available]
            .chunks_exact(8)
            .map(BigEndian::read_u64)
            .collect();

        Ok(ReportLunsData {
            luns,
            needed_data_length,
            truncated: (data.len() as u64) < needed_data_length as u64,
        })
    }
}

/// Size and geometry of a LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LunCapacity {
    pub logical_block_count: u64,
    pub block_size: u32,
}

impl LunCapacity {
    pub const READ_CAPACITY10_LENGTH: usize = 8;

    /// Decode READ CAPACITY(10) data (last LBA + block length)
    pub fn parse_read_capacity10(data: &[u8]) -> ScsiResult<Self> {
        if data.len() < Self::READ_CAPACITY10_LENGTH {
            return Err(IscsiError::Protocol(format!(
                "Truncated READ CAPACITY response: {} bytes",
                data.len()
            )));
        }
        let last_lba = BigEndian::read_u32(&data[0..4]) as u64;
        Ok(LunCapacity {
            logical_block_count: last_lba + 1,
            block_size: BigEndian::read_u32(&data[4..8]),
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.logical_block_count * self.block_size as u64
    }
}

/// Description of one LUN on a target
#[derive(Debug, Clone)]
pub struct LunInfo {
    pub target: TargetInfo,
    pub lun: u64,
    pub device_type: LunClass,
    pub removable: bool,
    pub vendor_id: String,
    pub product_id: String,
    pub product_revision: String,
}

impl fmt::Display for LunInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Single-level peripheral addressing keeps the LUN in the top two bytes
        if self.lun & 0xFF00_0000_0000_0000 == 0 {
            write!(f, "{}", self.lun >> 48)
        } else {
            write!(f, "{}", self.lun)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetAddress;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ScsiStatus::from_u8(0x02), ScsiStatus::CheckCondition);
        assert_eq!(ScsiStatus::from_u8(0x99), ScsiStatus::Other(0x99));
        assert_eq!(ScsiStatus::Busy.as_u8(), 0x08);
        assert_eq!(ScsiStatus::Other(0x99).to_string(), "0x99");
        assert_eq!(ScsiStatus::TaskSetFull.to_string(), "TaskSetFull");
    }

    #[test]
    fn test_read10_cdb() {
        let cmd = ScsiCommand::read10(0, 0x01020304, 8);
        assert_eq!(cmd.cdb()[0], 0x28);
        assert_eq!(&cmd.cdb()[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&cmd.cdb()[7..9], &[0, 8]);
        let padded = cmd.cdb_bytes();
        assert_eq!(&padded[..10], cmd.cdb());
        assert!(padded[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_raw_cdb_length_checked() {
        assert!(ScsiCommand::raw(0, &[0u8; 17]).is_err());
        assert!(ScsiCommand::raw(0, &[]).is_err());
        assert_eq!(ScsiCommand::raw(0, &[0x00; 6]).unwrap().cdb().len(), 6);
    }

    #[test]
    fn test_inquiry_parse() {
        let mut data = vec![0u8; 36];
        data[0] = 0x00;
        data[1] = 0x80;
        data[8..16].copy_from_slice(b"LIO-ORG ");
        data[16..32].copy_from_slice(b"disk1           ");
        data[32..36].copy_from_slice(b"4.0 ");
        let inq = InquiryData::parse(&data).unwrap();
        assert_eq!(inq.device_type, LunClass::BlockStorage);
        assert!(inq.removable);
        assert_eq!(inq.vendor_id, "LIO-ORG");
        assert_eq!(inq.product_id, "disk1");
        assert_eq!(inq.product_revision, "4.0");

        assert!(InquiryData::parse(&data[..20]).is_err());
    }

    #[test]
    fn test_report_luns_truncated() {
        // Three LUNs reported, room for only one in the 20-byte initial response
        let mut data = vec![0u8; 16];
        BigEndian::write_u32(&mut data[0..4], 24);
        data[8] = 0x00;
        data[9] = 0x01;
        let resp = ReportLunsData::parse(&data).unwrap();
        assert!(resp.truncated);
        assert_eq!(resp.needed_data_length, 32);
        assert_eq!(resp.luns, vec![0x0001_0000_0000_0000]);
    }

    #[test]
    fn test_read_capacity_parse() {
        let data = [0x00, 0x00, 0x07, 0xFF, 0x00, 0x00, 0x02, 0x00];
        let cap = LunCapacity::parse_read_capacity10(&data).unwrap();
        assert_eq!(cap.logical_block_count, 2048);
        assert_eq!(cap.block_size, 512);
        assert_eq!(cap.size_bytes(), 1024 * 1024);
    }

    #[test]
    fn test_sense_parse() {
        let mut fixed = vec![0u8; 18];
        fixed[0] = 0x70;
        fixed[2] = sense_key::ILLEGAL_REQUEST;
        fixed[12] = 0x24;
        let sense = SenseData::parse(&fixed).unwrap();
        assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, 0x24);

        let desc = [0x72, sense_key::UNIT_ATTENTION, 0x29, 0x00];
        assert_eq!(SenseData::parse(&desc).unwrap().asc, 0x29);
        assert!(SenseData::parse(&[0x01, 0x02]).is_none());
    }

    #[test]
    fn test_lun_info_display() {
        let info = LunInfo {
            target: TargetInfo::new("iqn.2025-12.local:disk", vec![TargetAddress::new("10.0.0.1", 3260)]),
            lun: 0x0002_0000_0000_0000,
            device_type: LunClass::BlockStorage,
            removable: false,
            vendor_id: String::new(),
            product_id: String::new(),
            product_revision: String::new(),
        };
        assert_eq!(info.to_string(), "2");
    }
}
