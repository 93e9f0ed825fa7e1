//! Login phase handling (RFC 3720 Section 5.3)
//!
//! A connection walks SecurityNegotiation → LoginOperationalNegotiation →
//! FullFeaturePhase. Each phase sends our keys, reads the (possibly
//! multi-PDU) Login Response and keeps exchanging Login Requests until the
//! target sets the Transit bit. The target's declared next stage must match
//! ours.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{IscsiPdu, LoginResponse};
use crate::connection::Connection;
use crate::params::KeyUsagePhase;
use crate::session::SessionState;
use crate::text::TextBuffer;
use std::fmt;
use std::io::{Read, Write};

/// Upper bound on Login Request round trips within one phase
pub const MAX_NEGOTIATION_ROUNDS: usize = 16;

const AUTH_METHOD_PARAMETER: &str = "AuthMethod";
const TARGET_PORTAL_GROUP_TAG_PARAMETER: &str = "TargetPortalGroupTag";

/// Login stages (CSG / NSG field values)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStage {
    SecurityNegotiation = 0,
    LoginOperationalNegotiation = 1,
    FullFeaturePhase = 3,
}

impl LoginStage {
    pub fn from_u8(val: u8) -> ScsiResult<Self> {
        match val {
            0 => Ok(LoginStage::SecurityNegotiation),
            1 => Ok(LoginStage::LoginOperationalNegotiation),
            3 => Ok(LoginStage::FullFeaturePhase),
            other => Err(IscsiError::Protocol(format!(
                "Reserved login stage value: {}",
                other
            ))),
        }
    }

    /// Stage that follows this one; FullFeaturePhase is terminal
    pub fn next(self) -> Self {
        match self {
            LoginStage::SecurityNegotiation => LoginStage::LoginOperationalNegotiation,
            LoginStage::LoginOperationalNegotiation => LoginStage::FullFeaturePhase,
            LoginStage::FullFeaturePhase => LoginStage::FullFeaturePhase,
        }
    }
}

impl fmt::Display for LoginStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginStage::SecurityNegotiation => "SecurityNegotiation",
            LoginStage::LoginOperationalNegotiation => "LoginOperationalNegotiation",
            LoginStage::FullFeaturePhase => "FullFeaturePhase",
        };
        f.write_str(name)
    }
}

impl<S: Read + Write> Connection<S> {
    /// Run the full login handshake
    pub(crate) fn login(&mut self, session: &mut SessionState) -> ScsiResult<()> {
        let carried = self.negotiate_security(session)?;
        self.negotiate_features(session, carried)?;

        log::info!(
            "Login complete: {} (TSIH=0x{:04x}, MaxRecvDataSegmentLength={})",
            session
                .params
                .values
                .target_name
                .as_deref()
                .unwrap_or("discovery session"),
            session.target_session_id,
            self.params.values.max_target_recv_data_segment_length
        );
        Ok(())
    }

    /// Returns replies still owed to the target when it left the phase early
    fn negotiate_security(&mut self, session: &mut SessionState) -> ScsiResult<TextBuffer> {
        self.login_stage = LoginStage::SecurityNegotiation;
        let discovery = session.is_discovery();
        let leading = self.is_leading();

        let mut parameters = TextBuffer::new();
        self.params
            .emit(KeyUsagePhase::SECURITY_NEGOTIATION, discovery, leading, &mut parameters);
        session
            .params
            .emit(KeyUsagePhase::SECURITY_NEGOTIATION, discovery, leading, &mut parameters);

        let methods: Vec<&str> = self.authenticators.iter().map(|a| a.identifier()).collect();
        parameters.add(AUTH_METHOD_PARAMETER, &methods.join(","));

        self.send_login_request(session, &parameters)?;
        let (mut resp, mut settings) = self.read_login_response(session)?;

        let selected = settings.get(AUTH_METHOD_PARAMETER).map(str::to_string);
        let index = self
            .authenticators
            .iter()
            .position(|a| Some(a.identifier()) == selected.as_deref())
            .ok_or_else(|| {
                IscsiError::login(format!(
                    "iSCSI Target specified an unsupported authentication method: {}",
                    selected.as_deref().unwrap_or("<none>")
                ))
            })?;
        log::debug!("Target selected AuthMethod={}", self.authenticators[index].identifier());

        if let Some(tag) = settings.get(TARGET_PORTAL_GROUP_TAG_PARAMETER) {
            session.params.values.target_portal_group_tag = tag.parse().ok();
        }
        settings.remove(AUTH_METHOD_PARAMETER);
        settings.remove(TARGET_PORTAL_GROUP_TAG_PARAMETER);

        let mut pending = TextBuffer::new();
        self.consume_parameters(session, &mut settings, &mut pending)?;

        let mut rounds = 0;
        while !resp.transit {
            rounds += 1;
            if rounds > MAX_NEGOTIATION_ROUNDS {
                return Err(IscsiError::login(
                    "Security negotiation did not complete".to_string(),
                ));
            }

            let mut parameters = std::mem::take(&mut pending);
            self.authenticators[index].get_parameters(&mut parameters);
            self.send_login_request(session, &parameters)?;

            let (next, settings) = self.read_login_response(session)?;
            resp = next;
            if !settings.is_empty() {
                self.authenticators[index].set_parameters(&settings)?;
            }
        }

        if !self.authenticators[index].is_complete() {
            return Err(IscsiError::login(format!(
                "iSCSI Target ended security negotiation before {} authentication completed",
                self.authenticators[index].identifier()
            )));
        }

        self.finish_stage(&resp)?;
        Ok(pending)
    }

    fn negotiate_features(&mut self, session: &mut SessionState, carried: TextBuffer) -> ScsiResult<()> {
        let discovery = session.is_discovery();
        let leading = self.is_leading();

        let mut parameters = carried;
        self.params
            .emit(KeyUsagePhase::OPERATIONAL_NEGOTIATION, discovery, leading, &mut parameters);
        session
            .params
            .emit(KeyUsagePhase::OPERATIONAL_NEGOTIATION, discovery, leading, &mut parameters);

        self.send_login_request(session, &parameters)?;
        let (mut resp, mut settings) = self.read_login_response(session)?;

        let mut outgoing = TextBuffer::new();
        self.consume_parameters(session, &mut settings, &mut outgoing)?;

        let mut rounds = 0;
        while !resp.transit || !outgoing.is_empty() {
            rounds += 1;
            if rounds > MAX_NEGOTIATION_ROUNDS {
                log::warn!(
                    "Operational negotiation gave up after {} rounds",
                    MAX_NEGOTIATION_ROUNDS
                );
                return Err(IscsiError::login(
                    "Operational negotiation did not converge".to_string(),
                ));
            }

            self.send_login_request(session, &outgoing)?;
            let (next, mut settings) = self.read_login_response(session)?;
            resp = next;

            outgoing = TextBuffer::new();
            self.consume_parameters(session, &mut settings, &mut outgoing)?;
        }

        self.finish_stage(&resp)
    }

    fn finish_stage(&mut self, resp: &LoginResponse) -> ScsiResult<()> {
        let expected = self.login_stage.next();
        if resp.next_stage != expected {
            return Err(IscsiError::login(format!(
                "iSCSI Target wants to transition to a different login stage: {} (expected: {})",
                resp.next_stage, expected
            )));
        }

        log::debug!("Login stage {} -> {}", self.login_stage, resp.next_stage);
        self.login_stage = resp.next_stage;
        Ok(())
    }

    fn send_login_request(&mut self, session: &SessionState, parameters: &TextBuffer) -> ScsiResult<()> {
        let pdu = IscsiPdu::login_request(
            session.isid(),
            session.target_session_id,
            self.id,
            session.current_task_tag,
            session.command_sequence_number,
            self.expected_stat_sn,
            self.login_stage,
            self.login_stage.next(),
            true,
            parameters.to_bytes(),
        );
        self.send_pdu(&pdu)
    }

    /// Read one logical Login Response, joining Continue parts before parsing
    fn read_login_response(&mut self, session: &mut SessionState) -> ScsiResult<(LoginResponse, TextBuffer)> {
        let mut resp: LoginResponse = self.read_response()?;
        check_login_status(&resp)?;

        let mut data = std::mem::take(&mut resp.data);
        while resp.cont {
            resp = self.read_response()?;
            check_login_status(&resp)?;
            data.extend_from_slice(&resp.data);
        }

        if resp.tsih != 0 {
            session.target_session_id = resp.tsih;
        }

        let settings = TextBuffer::parse(&data)?;
        log::debug!(
            "Login response: CSG={}, NSG={}, Transit={}, {} parameter(s)",
            resp.current_stage,
            resp.next_stage,
            resp.transit,
            settings.len()
        );
        Ok((resp, settings))
    }

    /// Apply target keys to connection then session values; answer the rest
    /// with `NotUnderstood`
    fn consume_parameters(
        &mut self,
        session: &mut SessionState,
        incoming: &mut TextBuffer,
        outgoing: &mut TextBuffer,
    ) -> ScsiResult<()> {
        self.params.consume(incoming, outgoing)?;
        session.params.consume(incoming, outgoing)?;

        for (key, value) in incoming.lines() {
            log::warn!("Target sent unrecognized key {}={}", key, value);
            outgoing.add(key, "NotUnderstood");
        }
        Ok(())
    }
}

fn check_login_status(resp: &LoginResponse) -> ScsiResult<()> {
    if resp.status.is_success() {
        return Ok(());
    }
    Err(IscsiError::Login {
        status: Some(resp.status),
        message: format!("iSCSI Target indicated login failure: {}", resp.status),
    })
}
