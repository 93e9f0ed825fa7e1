//! Login parameter registry
//!
//! Every key the initiator knows about is described once, in a static table
//! binding the wire name to accessor functions on a parameter struct. Session
//! and connection parameters each get their own table; negotiation (emit and
//! consume) runs purely over those tables.

use crate::error::{IscsiError, ScsiResult};
use crate::text::TextBuffer;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Login phases a key may be exchanged in (bit set)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsagePhase(u8);

impl KeyUsagePhase {
    pub const SECURITY_NEGOTIATION: Self = Self(0x01);
    pub const OPERATIONAL_NEGOTIATION: Self = Self(0x02);
    pub const FULL_FEATURE_PHASE: Self = Self(0x04);
    pub const ALL: Self = Self(0x07);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

/// Which side may originate a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySender {
    Initiator,
    Target,
    Both,
}

impl KeySender {
    pub fn includes_initiator(self) -> bool {
        matches!(self, KeySender::Initiator | KeySender::Both)
    }

    pub fn includes_target(self) -> bool {
        matches!(self, KeySender::Target | KeySender::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Stated once, no reply expected
    Declarative,
    /// The receiver must answer with its own value
    Negotiated,
}

/// Static description of one text key bound to a field of `T`
pub struct ProtocolKey<T: 'static> {
    pub name: &'static str,
    pub default: Option<&'static str>,
    pub phase: KeyUsagePhase,
    pub sender: KeySender,
    pub kind: KeyType,
    pub used_for_discovery: bool,
    pub leading_connection_only: bool,
    pub get: fn(&T) -> Option<String>,
    pub set: fn(&mut T, &str) -> ScsiResult<()>,
}

impl<T: 'static> ProtocolKey<T> {
    fn should_transmit(
        &self,
        value: Option<&str>,
        phase: KeyUsagePhase,
        discovery: bool,
        leading: bool,
    ) -> bool {
        self.phase.contains(phase)
            && (!discovery || self.used_for_discovery)
            && (leading || !self.leading_connection_only)
            && self.sender.includes_initiator()
            && value.is_some()
            && value != self.default
    }
}

impl<T: 'static> fmt::Debug for ProtocolKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolKey")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("sender", &self.sender)
            .field("kind", &self.kind)
            .finish()
    }
}

// ============================================================================
// Value coercion
// ============================================================================

pub fn bool_value(value: bool) -> String {
    let text = if value { "Yes" } else { "No" };
    text.to_string()
}

pub fn parse_bool(name: &str, value: &str) -> ScsiResult<bool> {
    match value {
        "Yes" => Ok(true),
        "No" => Ok(false),
        _ => Err(IscsiError::Protocol(format!(
            "Invalid boolean value for {}: {}",
            name, value
        ))),
    }
}

pub fn parse_number<N: FromStr>(name: &str, value: &str) -> ScsiResult<N> {
    value.parse().map_err(|_| {
        IscsiError::Protocol(format!("Invalid numeric value for {}: {}", name, value))
    })
}

/// Digest algorithm for header or data segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    None,
    Crc32c,
}

impl Digest {
    pub fn as_str(self) -> &'static str {
        match self {
            Digest::None => "None",
            Digest::Crc32c => "CRC32C",
        }
    }

    /// Accepts a single value or an offer list; only `None` is ever selected
    ///
    /// Outbound PDUs are never digested, so a target that will only accept
    /// CRC32C cannot be served.
    pub fn parse(name: &str, value: &str) -> ScsiResult<Self> {
        let offered: Vec<&str> = value.split(',').map(str::trim).collect();
        if offered.contains(&Digest::None.as_str()) {
            return Ok(Digest::None);
        }
        if offered.contains(&Digest::Crc32c.as_str()) {
            return Err(IscsiError::Protocol(format!(
                "Target requires {}={}, only None is supported",
                name, value
            )));
        }
        Err(IscsiError::Protocol(format!(
            "Unsupported digest for {}: {}",
            name, value
        )))
    }
}

/// Discovery sessions may only issue SendTargets; Normal sessions reach LUNs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Discovery,
    Normal,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Discovery => "Discovery",
            SessionType::Normal => "Normal",
        }
    }

    pub fn parse(value: &str) -> ScsiResult<Self> {
        match value {
            "Discovery" => Ok(SessionType::Discovery),
            "Normal" => Ok(SessionType::Normal),
            other => Err(IscsiError::Protocol(format!("Unknown SessionType: {}", other))),
        }
    }
}

// ============================================================================
// Session-wide parameters
// ============================================================================

/// Session-wide parameters (RFC 3720 Section 12)
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub target_name: Option<String>,
    pub initiator_name: String,
    pub target_alias: Option<String>,
    pub initiator_alias: Option<String>,
    pub session_type: SessionType,
    pub target_portal_group_tag: Option<u16>,
    pub max_connections: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time2wait: u32,
    pub default_time2retain: u32,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u8,
}

impl SessionParams {
    pub fn new(session_type: SessionType, initiator_name: &str, target_name: Option<&str>) -> Self {
        SessionParams {
            target_name: target_name.map(str::to_string),
            initiator_name: initiator_name.to_string(),
            target_alias: None,
            initiator_alias: None,
            session_type,
            target_portal_group_tag: None,
            max_connections: 1,
            initial_r2t: true,
            immediate_data: true,
            max_burst_length: 262144,
            first_burst_length: 65536,
            default_time2wait: 0,
            default_time2retain: 60,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
        }
    }
}

/// Keys bound to [`SessionParams`]
pub static SESSION_KEYS: &[ProtocolKey<SessionParams>] = &[
    ProtocolKey {
        name: "TargetName",
        default: None,
        phase: KeyUsagePhase::SECURITY_NEGOTIATION,
        sender: KeySender::Initiator,
        kind: KeyType::Declarative,
        used_for_discovery: true,
        leading_connection_only: false,
        get: |p| p.target_name.clone(),
        set: |p, v| {
            p.target_name = Some(v.to_string());
            Ok(())
        },
    },
    ProtocolKey {
        name: "InitiatorName",
        default: None,
        phase: KeyUsagePhase::SECURITY_NEGOTIATION,
        sender: KeySender::Initiator,
        kind: KeyType::Declarative,
        used_for_discovery: true,
        leading_connection_only: false,
        get: |p| Some(p.initiator_name.clone()),
        set: |p, v| {
            p.initiator_name = v.to_string();
            Ok(())
        },
    },
    ProtocolKey {
        name: "TargetAlias",
        default: Some(""),
        phase: KeyUsagePhase::ALL,
        sender: KeySender::Target,
        kind: KeyType::Declarative,
        used_for_discovery: false,
        leading_connection_only: false,
        get: |p| p.target_alias.clone(),
        set: |p, v| {
            p.target_alias = Some(v.to_string());
            Ok(())
        },
    },
    ProtocolKey {
        name: "SessionType",
        default: None,
        phase: KeyUsagePhase::SECURITY_NEGOTIATION,
        sender: KeySender::Initiator,
        kind: KeyType::Declarative,
        used_for_discovery: true,
        leading_connection_only: false,
        get: |p| Some(p.session_type.as_str().to_string()),
        set: |p, v| {
            p.session_type = SessionType::parse(v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "MaxConnections",
        default: Some("1"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(p.max_connections.to_string()),
        set: |p, v| {
            p.max_connections = parse_number("MaxConnections", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "InitiatorAlias",
        default: Some(""),
        phase: KeyUsagePhase::ALL,
        sender: KeySender::Initiator,
        kind: KeyType::Declarative,
        used_for_discovery: false,
        leading_connection_only: false,
        get: |p| p.initiator_alias.clone(),
        set: |p, v| {
            p.initiator_alias = Some(v.to_string());
            Ok(())
        },
    },
    ProtocolKey {
        name: "TargetPortalGroupTag",
        default: None,
        phase: KeyUsagePhase::SECURITY_NEGOTIATION,
        sender: KeySender::Target,
        kind: KeyType::Declarative,
        used_for_discovery: false,
        leading_connection_only: false,
        get: |p| p.target_portal_group_tag.map(|t| t.to_string()),
        set: |p, v| {
            p.target_portal_group_tag = Some(parse_number("TargetPortalGroupTag", v)?);
            Ok(())
        },
    },
    ProtocolKey {
        name: "InitialR2T",
        default: Some("Yes"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(bool_value(p.initial_r2t)),
        set: |p, v| {
            p.initial_r2t = parse_bool("InitialR2T", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "ImmediateData",
        default: Some("Yes"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(bool_value(p.immediate_data)),
        set: |p, v| {
            p.immediate_data = parse_bool("ImmediateData", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "MaxBurstLength",
        default: Some("262144"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(p.max_burst_length.to_string()),
        set: |p, v| {
            p.max_burst_length = parse_number("MaxBurstLength", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "FirstBurstLength",
        default: Some("65536"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(p.first_burst_length.to_string()),
        set: |p, v| {
            p.first_burst_length = parse_number("FirstBurstLength", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "DefaultTime2Wait",
        default: Some("2"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(p.default_time2wait.to_string()),
        set: |p, v| {
            p.default_time2wait = parse_number("DefaultTime2Wait", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "DefaultTime2Retain",
        default: Some("20"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(p.default_time2retain.to_string()),
        set: |p, v| {
            p.default_time2retain = parse_number("DefaultTime2Retain", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "MaxOutstandingR2T",
        default: Some("1"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(p.max_outstanding_r2t.to_string()),
        set: |p, v| {
            p.max_outstanding_r2t = parse_number("MaxOutstandingR2T", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "DataPDUInOrder",
        default: Some("Yes"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(bool_value(p.data_pdu_in_order)),
        set: |p, v| {
            p.data_pdu_in_order = parse_bool("DataPDUInOrder", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "DataSequenceInOrder",
        default: Some("Yes"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(bool_value(p.data_sequence_in_order)),
        set: |p, v| {
            p.data_sequence_in_order = parse_bool("DataSequenceInOrder", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "ErrorRecoveryLevel",
        default: Some("0"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: false,
        leading_connection_only: true,
        get: |p| Some(p.error_recovery_level.to_string()),
        set: |p, v| {
            p.error_recovery_level = parse_number("ErrorRecoveryLevel", v)?;
            Ok(())
        },
    },
];

// ============================================================================
// Per-connection parameters
// ============================================================================

/// Per-connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub header_digest: Digest,
    pub data_digest: Digest,
    /// Largest data segment we accept (declared to the target)
    pub max_recv_data_segment_length: u32,
    /// Largest data segment the target accepts (declared by the target)
    pub max_target_recv_data_segment_length: u32,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            header_digest: Digest::None,
            data_digest: Digest::None,
            max_recv_data_segment_length: 131072,
            max_target_recv_data_segment_length: 8192,
        }
    }
}

/// Keys bound to [`ConnectionParams`]
///
/// `MaxRecvDataSegmentLength` appears twice: each side declares its own limit.
pub static CONNECTION_KEYS: &[ProtocolKey<ConnectionParams>] = &[
    ProtocolKey {
        name: "HeaderDigest",
        default: Some("None"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: true,
        leading_connection_only: false,
        get: |p| Some(p.header_digest.as_str().to_string()),
        set: |p, v| {
            p.header_digest = Digest::parse("HeaderDigest", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "DataDigest",
        default: Some("None"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Both,
        kind: KeyType::Negotiated,
        used_for_discovery: true,
        leading_connection_only: false,
        get: |p| Some(p.data_digest.as_str().to_string()),
        set: |p, v| {
            p.data_digest = Digest::parse("DataDigest", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "MaxRecvDataSegmentLength",
        default: Some("8192"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Initiator,
        kind: KeyType::Declarative,
        used_for_discovery: false,
        leading_connection_only: false,
        get: |p| Some(p.max_recv_data_segment_length.to_string()),
        set: |p, v| {
            p.max_recv_data_segment_length = parse_number("MaxRecvDataSegmentLength", v)?;
            Ok(())
        },
    },
    ProtocolKey {
        name: "MaxRecvDataSegmentLength",
        default: Some("8192"),
        phase: KeyUsagePhase::OPERATIONAL_NEGOTIATION,
        sender: KeySender::Target,
        kind: KeyType::Declarative,
        used_for_discovery: false,
        leading_connection_only: false,
        get: |p| Some(p.max_target_recv_data_segment_length.to_string()),
        set: |p, v| {
            p.max_target_recv_data_segment_length =
                parse_number("MaxRecvDataSegmentLength", v)?;
            Ok(())
        },
    },
];

// ============================================================================
// Negotiation
// ============================================================================

/// A parameter struct together with its key table and the names already
/// exchanged during the current login
#[derive(Debug)]
pub struct Negotiated<T: 'static> {
    pub values: T,
    keys: &'static [ProtocolKey<T>],
    negotiated: HashSet<&'static str>,
}

impl<T: 'static> Negotiated<T> {
    pub fn new(values: T, keys: &'static [ProtocolKey<T>]) -> Self {
        Negotiated {
            values,
            keys,
            negotiated: HashSet::new(),
        }
    }

    /// Whether this key has already been sent or echoed
    pub fn is_negotiated(&self, name: &str) -> bool {
        self.negotiated.contains(name)
    }

    /// Append every key we should send in `phase` to `out`
    ///
    /// Absent values and values equal to the key's default are not sent; a key
    /// is sent at most once per login. Session-wide keys marked
    /// `leading_connection_only` are only sent when `leading` is set.
    pub fn emit(&mut self, phase: KeyUsagePhase, discovery: bool, leading: bool, out: &mut TextBuffer) {
        for key in self.keys {
            if self.negotiated.contains(key.name) {
                continue;
            }
            let value = (key.get)(&self.values);
            if key.should_transmit(value.as_deref(), phase, discovery, leading) {
                if let Some(value) = value {
                    log::debug!("Offering {}={}", key.name, value);
                    out.add(key.name, &value);
                    self.negotiated.insert(key.name);
                }
            }
        }
    }

    /// Apply target-sent values found in `incoming`, removing them as they are
    /// consumed, and queue echoes for negotiated keys we have not yet sent
    pub fn consume(&mut self, incoming: &mut TextBuffer, outgoing: &mut TextBuffer) -> ScsiResult<()> {
        for key in self.keys.iter().filter(|k| k.sender.includes_target()) {
            let value = match incoming.get(key.name) {
                Some(value) => value.to_string(),
                None => continue,
            };

            log::debug!("Target declared {}={}", key.name, value);
            (key.set)(&mut self.values, &value)?;
            incoming.remove(key.name);

            if key.kind == KeyType::Negotiated && !self.negotiated.contains(key.name) {
                if let Some(current) = (key.get)(&self.values) {
                    outgoing.add(key.name, &current);
                }
                self.negotiated.insert(key.name);
            }
        }
        Ok(())
    }
}
