//! A single logged-in iSCSI connection
//!
//! The connection owns the byte stream to the target. It runs the login
//! handshake once when created (see [`crate::login`]), then carries SCSI
//! commands (see [`crate::command`]), SendTargets discovery and logout.
//!
//! Session-wide counters (CmdSN, task tags, TSIH) live in [`SessionState`] and
//! are passed in by the owning session for every exchange.

use crate::auth::Authenticator;
use crate::error::{IscsiError, ScsiResult};
use crate::login::LoginStage;
use crate::params::{ConnectionParams, Digest, Negotiated, CONNECTION_KEYS};
use crate::pdu::{
    logout_response, IscsiPdu, LogoutReason, LogoutResponse, Response, TargetPdu, TextResponse,
    RESERVED_TAG,
};
use crate::session::SessionState;
use crate::target::{TargetAddress, TargetInfo};
use crate::text::TextBuffer;
use std::io::{Read, Write};

const SEND_TARGETS_PARAMETER: &str = "SendTargets";
const TARGET_NAME_PARAMETER: &str = "TargetName";
const TARGET_ADDRESS_PARAMETER: &str = "TargetAddress";

/// One connection of a session, generic over the transport
pub struct Connection<S: Read + Write> {
    stream: S,
    pub(crate) id: u16,
    pub(crate) login_stage: LoginStage,
    pub(crate) expected_stat_sn: u32,
    pub(crate) params: Negotiated<ConnectionParams>,
    pub(crate) authenticators: Vec<Box<dyn Authenticator>>,
}

impl<S: Read + Write> Connection<S> {
    /// Open a connection over `stream` and log in
    ///
    /// # Arguments
    ///
    /// * `stream` - Connected, ordered byte stream to the target portal
    /// * `session` - Counters and negotiated values of the owning session
    /// * `authenticators` - Methods offered in `AuthMethod`, in preference order
    /// * `params` - Initial connection values (our MaxRecvDataSegmentLength)
    ///
    /// # Errors
    ///
    /// Returns an error if any login phase fails; the stream is dropped.
    /// Digests other than `None` in `params` are refused up front.
    pub(crate) fn connect(
        stream: S,
        session: &mut SessionState,
        authenticators: Vec<Box<dyn Authenticator>>,
        params: ConnectionParams,
    ) -> ScsiResult<Self> {
        if authenticators.is_empty() {
            return Err(IscsiError::Config(
                "At least one authentication method is required".to_string(),
            ));
        }
        if params.header_digest != Digest::None || params.data_digest != Digest::None {
            return Err(IscsiError::Config(
                "CRC32C digests are not supported".to_string(),
            ));
        }

        let mut conn = Connection {
            stream,
            id: session.next_connection_id(),
            login_stage: LoginStage::SecurityNegotiation,
            expected_stat_sn: 1,
            params: Negotiated::new(params, CONNECTION_KEYS),
            authenticators,
        };
        conn.login(session)?;
        Ok(conn)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// The first connection of a session negotiates its session-wide keys
    pub fn is_leading(&self) -> bool {
        self.id == 1
    }

    pub fn login_stage(&self) -> LoginStage {
        self.login_stage
    }

    pub fn expected_status_sequence_number(&self) -> u32 {
        self.expected_stat_sn
    }

    /// Negotiated per-connection values
    pub fn params(&self) -> &ConnectionParams {
        &self.params.values
    }

    /// Write one PDU to the target
    ///
    /// Fails without writing if the data segment exceeds what the target
    /// declared it will accept.
    pub fn send_pdu(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        let limit = self.params.values.max_target_recv_data_segment_length as usize;
        if pdu.data.len() > limit {
            return Err(IscsiError::Protocol(format!(
                "{} data segment of {} bytes exceeds target limit of {} bytes",
                pdu.opcode_name(),
                pdu.data.len(),
                limit
            )));
        }

        log::debug!(
            "Sending {} (ITT=0x{:08x}, {} data bytes)",
            pdu.opcode_name(),
            pdu.itt(),
            pdu.data.len()
        );
        pdu.write_to(&mut self.stream)
    }

    /// Read and decode the next PDU
    ///
    /// A Reject from the target fails immediately with a protocol error.
    pub fn read_pdu(&mut self) -> ScsiResult<TargetPdu> {
        let raw = IscsiPdu::read_from(
            &mut self.stream,
            self.params.values.header_digest != Digest::None,
            self.params.values.data_digest != Digest::None,
        )?;

        log::debug!(
            "Received {} (ITT=0x{:08x}, {} data bytes)",
            raw.opcode_name(),
            raw.itt(),
            raw.data.len()
        );

        match TargetPdu::decode(raw)? {
            TargetPdu::Reject(reject) => Err(IscsiError::Protocol(format!(
                "Target sent reject packet, reason {:?}",
                reject.reason
            ))),
            pdu => Ok(pdu),
        }
    }

    /// Apply StatSN tracking to a decoded PDU and return it
    pub(crate) fn check_status(&mut self, pdu: TargetPdu) -> ScsiResult<TargetPdu> {
        if let Some(stat_sn) = pdu.status_sequence_number() {
            self.seen_status_sequence_number(stat_sn)?;
        }
        Ok(pdu)
    }

    /// Read the next PDU, check its StatSN, and require it to be a `T`
    pub fn read_response<T: Response>(&mut self) -> ScsiResult<T> {
        let pdu = self.read_pdu()?;
        self.check_status(pdu)?.expect::<T>()
    }

    /// Track the target's StatSN
    ///
    /// Zero means "not applicable" and is accepted without changing the
    /// expected value; anything else must match exactly.
    pub fn seen_status_sequence_number(&mut self, number: u32) -> ScsiResult<()> {
        if number == 0 {
            return Ok(());
        }
        if number != self.expected_stat_sn {
            return Err(IscsiError::Protocol(format!(
                "Unexpected status sequence number {}, expected {}",
                number, self.expected_stat_sn
            )));
        }
        self.expected_stat_sn = number.wrapping_add(1);
        Ok(())
    }

    /// Ask the target for every target it exposes (`SendTargets=All`)
    ///
    /// Responses split with the Continue bit are followed up with empty Text
    /// Requests until the final part arrives.
    pub fn enumerate_targets(&mut self, session: &mut SessionState) -> ScsiResult<Vec<TargetInfo>> {
        let mut parameters = TextBuffer::new();
        parameters.add(SEND_TARGETS_PARAMETER, "All");

        let itt = session.current_task_tag;
        let mut cmd_sn = session.command_sequence_number;
        let mut ttt = RESERVED_TAG;
        let mut request = parameters.to_bytes();
        let mut data = Vec::new();

        loop {
            let pdu = IscsiPdu::text_request(
                itt,
                ttt,
                cmd_sn,
                self.expected_stat_sn,
                true,
                std::mem::take(&mut request),
            );
            self.send_pdu(&pdu)?;
            cmd_sn = cmd_sn.wrapping_add(1);

            let resp: TextResponse = self.read_response()?;
            data.extend_from_slice(&resp.data);
            if resp.final_pdu && !resp.cont {
                break;
            }
            ttt = resp.ttt;
        }

        let buffer = TextBuffer::parse(&data)?;
        let targets = parse_send_targets(&buffer)?;
        log::debug!("SendTargets returned {} target(s)", targets.len());

        session.command_sequence_number = cmd_sn;
        session.next_task_tag();
        Ok(targets)
    }

    /// Log out and release the stream
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the target reports anything but success.
    pub fn logout(mut self, session: &mut SessionState, reason: LogoutReason) -> ScsiResult<()> {
        let pdu = IscsiPdu::logout_request(
            session.current_task_tag,
            self.id,
            session.command_sequence_number,
            self.expected_stat_sn,
            reason,
        );
        self.send_pdu(&pdu)?;

        let resp: LogoutResponse = self.read_response()?;
        if resp.response != logout_response::SUCCESS {
            return Err(IscsiError::Protocol(format!(
                "Target indicated failure during logout: {}",
                resp.response
            )));
        }

        log::info!("Logged out connection {} ({:?})", self.id, reason);
        Ok(())
    }
}

/// Group `TargetName=` / `TargetAddress=` lines into targets
fn parse_send_targets(buffer: &TextBuffer) -> ScsiResult<Vec<TargetInfo>> {
    let mut targets = Vec::new();
    let mut current: Option<TargetInfo> = None;

    for (key, value) in buffer.lines() {
        if key == TARGET_NAME_PARAMETER {
            targets.extend(current.take());
            current = Some(TargetInfo::new(value, Vec::new()));
            continue;
        }

        match current.as_mut() {
            None => {
                return Err(IscsiError::Protocol(format!(
                    "Unexpected response parameter {} expected {}",
                    key, TARGET_NAME_PARAMETER
                )));
            }
            Some(target) if key == TARGET_ADDRESS_PARAMETER => {
                target.addresses.push(TargetAddress::parse(value)?);
            }
            Some(_) => {}
        }
    }

    targets.extend(current);
    Ok(targets)
}
