//! Scripted in-memory target shared by the integration tests
//!
//! A [`Script`] queues target PDUs in the order the initiator will read them,
//! assigning StatSNs as a real target would. The resulting [`FakeTarget`]
//! replays those bytes and records everything the initiator writes.

#![allow(dead_code)]

use byteorder::{BigEndian, ByteOrder};
use iscsi_initiator::pdu::{flags, IscsiPdu, OpCode, RESERVED_TAG};
use iscsi_initiator::text::TextBuffer;
use iscsi_initiator::{Initiator, ScsiResult, Session};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;

pub const TARGET_NAME: &str = "iqn.2025-12.local:storage.disk1";
pub const INITIATOR_NAME: &str = "iqn.2025-12.local:initiator";
pub const TSIH: u16 = 0x0102;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn init_logging() {
    Lazy::force(&LOGGER);
}

// ============================================================================
// Duplex stream double
// ============================================================================

/// Replays scripted target bytes; captures initiator bytes
pub struct FakeTarget {
    replies: Cursor<Vec<u8>>,
    sent: Rc<RefCell<Vec<u8>>>,
}

impl Read for FakeTarget {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.replies.read(buf)
    }
}

impl Write for FakeTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Handle on what the initiator wrote, readable after the stream is moved
#[derive(Clone)]
pub struct Captured(Rc<RefCell<Vec<u8>>>);

impl Captured {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    /// Every PDU sent so far, in order
    pub fn pdus(&self) -> Vec<IscsiPdu> {
        let bytes = self.bytes();
        let mut cursor = Cursor::new(bytes.as_slice());
        let mut pdus = Vec::new();
        while (cursor.position() as usize) < bytes.len() {
            pdus.push(IscsiPdu::read_from(&mut cursor, false, false).unwrap());
        }
        pdus
    }

    pub fn pdus_with_opcode(&self, opcode: OpCode) -> Vec<IscsiPdu> {
        self.pdus()
            .into_iter()
            .filter(|p| p.opcode().ok() == Some(opcode))
            .collect()
    }
}

// ============================================================================
// Target PDU script
// ============================================================================

/// Builder for the sequence of PDUs the fake target sends
pub struct Script {
    pdus: Vec<IscsiPdu>,
    stat_sn: u32,
}

impl Script {
    pub fn new() -> Self {
        Script {
            pdus: Vec::new(),
            stat_sn: 1,
        }
    }

    /// Override the StatSN the next status-bearing PDU carries
    pub fn with_stat_sn(mut self, stat_sn: u32) -> Self {
        self.stat_sn = stat_sn;
        self
    }

    fn next_stat_sn(&mut self) -> u32 {
        let sn = self.stat_sn;
        self.stat_sn = self.stat_sn.wrapping_add(1);
        sn
    }

    pub fn push(mut self, pdu: IscsiPdu) -> Self {
        self.pdus.push(pdu);
        self
    }

    /// Plain login: no authentication, then accept our operational keys
    pub fn normal_login(self) -> Self {
        self.login(0, 1, true, b"AuthMethod=None\0TargetPortalGroupTag=1\0")
            .login(
                1,
                3,
                true,
                b"MaxRecvDataSegmentLength=65536\0DefaultTime2Wait=0\0DefaultTime2Retain=60\0",
            )
    }

    pub fn login(mut self, csg: u8, nsg: u8, transit: bool, data: &[u8]) -> Self {
        let sn = self.next_stat_sn();
        self.push(login_response(csg, nsg, transit, false, sn, 0, 0, data))
    }

    /// First part of a Login Response split with the Continue bit
    pub fn login_continue(mut self, csg: u8, nsg: u8, data: &[u8]) -> Self {
        let sn = self.next_stat_sn();
        self.push(login_response(csg, nsg, false, true, sn, 0, 0, data))
    }

    pub fn login_failure(mut self, class: u8, detail: u8) -> Self {
        let sn = self.next_stat_sn();
        self.push(login_response(0, 0, false, false, sn, class, detail, b""))
    }

    pub fn text(mut self, itt: u32, final_pdu: bool, cont: bool, ttt: u32, data: &[u8]) -> Self {
        let sn = self.next_stat_sn();
        self.push(text_response(itt, final_pdu, cont, ttt, sn, data))
    }

    /// Data-In without status
    pub fn data_in(self, itt: u32, data_sn: u32, offset: u32, final_pdu: bool, data: &[u8]) -> Self {
        let sn = self.stat_sn;
        self.push(data_in(itt, data_sn, offset, final_pdu, None, sn, data))
    }

    /// Final Data-In carrying SCSI status
    pub fn data_in_status(mut self, itt: u32, data_sn: u32, offset: u32, status: u8, data: &[u8]) -> Self {
        let sn = self.next_stat_sn();
        self.push(data_in(itt, data_sn, offset, true, Some(status), sn, data))
    }

    pub fn r2t(self, itt: u32, ttt: u32, r2t_sn: u32, offset: u32, length: u32) -> Self {
        let sn = self.stat_sn;
        self.push(ready_to_transfer(itt, ttt, r2t_sn, sn, offset, length))
    }

    pub fn scsi_response(mut self, itt: u32, response: u8, status: u8, data: &[u8]) -> Self {
        let sn = self.next_stat_sn();
        self.push(scsi_response(itt, response, status, sn, data))
    }

    pub fn logout(mut self, itt: u32, response: u8) -> Self {
        let sn = self.next_stat_sn();
        self.push(logout_response(itt, response, sn))
    }

    pub fn reject(mut self, reason: u8) -> Self {
        let sn = self.next_stat_sn();
        self.push(reject(reason, sn))
    }

    /// Encoded target byte stream
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for pdu in &self.pdus {
            bytes.extend_from_slice(&pdu.to_bytes());
        }
        bytes
    }

    pub fn build(self) -> (FakeTarget, Captured) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        (
            FakeTarget {
                replies: Cursor::new(self.to_bytes()),
                sent: Rc::clone(&sent),
            },
            Captured(sent),
        )
    }
}

// ============================================================================
// Target-side encoders
// ============================================================================

fn response_header(opcode: OpCode, byte1: u8, itt: u32, stat_sn: u32) -> IscsiPdu {
    let mut pdu = IscsiPdu::new(opcode, false);
    pdu.header[1] = byte1;
    BigEndian::write_u32(&mut pdu.header[16..20], itt);
    BigEndian::write_u32(&mut pdu.header[24..28], stat_sn);
    // ExpCmdSN / MaxCmdSN: leave a wide window open
    BigEndian::write_u32(&mut pdu.header[28..32], 1);
    BigEndian::write_u32(&mut pdu.header[32..36], 64);
    pdu
}

#[allow(clippy::too_many_arguments)]
pub fn login_response(
    csg: u8,
    nsg: u8,
    transit: bool,
    cont: bool,
    stat_sn: u32,
    class: u8,
    detail: u8,
    data: &[u8],
) -> IscsiPdu {
    let byte1 = (if transit { flags::TRANSIT } else { 0 })
        | (if cont { flags::CONTINUE } else { 0 })
        | ((csg & 0x03) << 2)
        | (nsg & 0x03);
    let mut pdu = response_header(OpCode::LoginResponse, byte1, 1, stat_sn);
    pdu.header[8] = 0x80;
    BigEndian::write_u16(&mut pdu.header[14..16], TSIH);
    pdu.header[36] = class;
    pdu.header[37] = detail;
    pdu.data = data.to_vec();
    pdu
}

pub fn text_response(itt: u32, final_pdu: bool, cont: bool, ttt: u32, stat_sn: u32, data: &[u8]) -> IscsiPdu {
    let byte1 = (if final_pdu { flags::FINAL } else { 0 }) | (if cont { flags::CONTINUE } else { 0 });
    let mut pdu = response_header(OpCode::TextResponse, byte1, itt, stat_sn);
    BigEndian::write_u32(&mut pdu.header[20..24], ttt);
    pdu.data = data.to_vec();
    pdu
}

pub fn data_in(
    itt: u32,
    data_sn: u32,
    offset: u32,
    final_pdu: bool,
    status: Option<u8>,
    stat_sn: u32,
    data: &[u8],
) -> IscsiPdu {
    let byte1 = (if final_pdu { flags::FINAL } else { 0 })
        | (if status.is_some() { flags::STATUS_PRESENT } else { 0 });
    let mut pdu = response_header(OpCode::ScsiDataIn, byte1, itt, stat_sn);
    pdu.header[3] = status.unwrap_or(0);
    BigEndian::write_u32(&mut pdu.header[20..24], RESERVED_TAG);
    BigEndian::write_u32(&mut pdu.header[36..40], data_sn);
    BigEndian::write_u32(&mut pdu.header[40..44], offset);
    pdu.data = data.to_vec();
    pdu
}

pub fn ready_to_transfer(itt: u32, ttt: u32, r2t_sn: u32, stat_sn: u32, offset: u32, length: u32) -> IscsiPdu {
    let mut pdu = response_header(OpCode::ReadyToTransfer, flags::FINAL, itt, stat_sn);
    BigEndian::write_u32(&mut pdu.header[20..24], ttt);
    BigEndian::write_u32(&mut pdu.header[36..40], r2t_sn);
    BigEndian::write_u32(&mut pdu.header[40..44], offset);
    BigEndian::write_u32(&mut pdu.header[44..48], length);
    pdu
}

pub fn scsi_response(itt: u32, response: u8, status: u8, stat_sn: u32, data: &[u8]) -> IscsiPdu {
    let mut pdu = response_header(OpCode::ScsiResponse, flags::FINAL, itt, stat_sn);
    pdu.header[2] = response;
    pdu.header[3] = status;
    pdu.data = data.to_vec();
    pdu
}

pub fn logout_response(itt: u32, response: u8, stat_sn: u32) -> IscsiPdu {
    let mut pdu = response_header(OpCode::LogoutResponse, flags::FINAL, itt, stat_sn);
    pdu.header[2] = response;
    pdu
}

pub fn reject(reason: u8, stat_sn: u32) -> IscsiPdu {
    let mut pdu = response_header(OpCode::Reject, flags::FINAL, RESERVED_TAG, stat_sn);
    pdu.header[2] = reason;
    pdu.data = vec![0u8; 48];
    pdu
}

// ============================================================================
// Helpers
// ============================================================================

pub fn initiator() -> Initiator {
    Initiator::builder()
        .initiator_name(INITIATOR_NAME)
        .build()
        .unwrap()
}

pub fn open_normal(target: FakeTarget) -> ScsiResult<Session<FakeTarget>> {
    init_logging();
    initiator().open_session(target, Some(TARGET_NAME), Vec::new())
}

pub fn open_discovery(target: FakeTarget) -> ScsiResult<Session<FakeTarget>> {
    init_logging();
    initiator().open_session(target, None, Vec::new())
}

/// Key/value pairs carried by a captured request
pub fn text_of(pdu: &IscsiPdu) -> TextBuffer {
    TextBuffer::parse(&pdu.data).unwrap()
}

pub fn field_u32(pdu: &IscsiPdu, offset: usize) -> u32 {
    BigEndian::read_u32(&pdu.header[offset..offset + 4])
}

/// Opcode, LBA and transfer length of the READ(10)/WRITE(10) CDB a captured
/// SCSI Command carries
pub fn rw10_fields(pdu: &IscsiPdu) -> (u8, u32, u16) {
    let cdb = &pdu.header[32..48];
    (
        cdb[0],
        BigEndian::read_u32(&cdb[2..6]),
        BigEndian::read_u16(&cdb[7..9]),
    )
}

/// SCSI Data-In / Data-Out payload with a recognisable pattern
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
