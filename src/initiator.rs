//! Initiator entry point
//!
//! This module provides the [`Initiator`] and its builder. An initiator holds
//! the local identity (name, alias, CHAP credentials) and opens sessions:
//! discovery sessions to list targets at a portal, and normal sessions to
//! reach a target's LUNs.

use crate::auth::{Authenticator, ChapAuthenticator, ChapCredentials, NullAuthenticator};
use crate::error::{IscsiError, ScsiResult};
use crate::params::{ConnectionParams, SessionParams, SessionType};
use crate::pdu::MAX_DATA_SEGMENT_LENGTH;
use crate::session::Session;
use crate::target::{TargetAddress, TargetInfo};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Name used when the builder is not given one
pub const DEFAULT_INITIATOR_NAME: &str = "iqn.2025-12.local:initiator";

/// Smallest MaxRecvDataSegmentLength RFC 3720 allows
const MIN_RECV_DATA_SEGMENT_LENGTH: u32 = 512;

/// iSCSI initiator
#[derive(Debug, Clone)]
pub struct Initiator {
    name: String,
    alias: Option<String>,
    credentials: Option<ChapCredentials>,
    target_credentials: Option<ChapCredentials>,
    max_recv_data_segment_length: u32,
    io_timeout: Option<Duration>,
}

impl Initiator {
    /// Create a new builder for configuring the initiator
    pub fn builder() -> InitiatorBuilder {
        InitiatorBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// List the targets reachable through `portal`
    ///
    /// # Arguments
    ///
    /// * `portal` - `host[:port]`, port 3260 when omitted
    ///
    /// # Errors
    ///
    /// Returns an error if the portal cannot be reached or the discovery
    /// session fails.
    pub fn get_targets(&self, portal: &str) -> ScsiResult<Vec<TargetInfo>> {
        let address = TargetAddress::parse(portal)?;
        let stream = self.connect_stream(&address)?;

        let mut session = self.open_session(stream, None, vec![address])?;
        let targets = session.enumerate_targets()?;
        session.close()?;
        Ok(targets)
    }

    /// Open a normal session on the target's first address
    pub fn connect_to(&self, target: &TargetInfo) -> ScsiResult<Session<TcpStream>> {
        let address = target.addresses.first().ok_or_else(|| {
            IscsiError::Config(format!("Target {} has no addresses", target.name))
        })?;
        let stream = self.connect_stream(address)?;
        self.open_session(stream, Some(&target.name), target.addresses.clone())
    }

    /// Log in over an already connected stream
    ///
    /// A `target_name` of `None` opens a discovery session.
    pub fn open_session<S: Read + Write>(
        &self,
        stream: S,
        target_name: Option<&str>,
        addresses: Vec<TargetAddress>,
    ) -> ScsiResult<Session<S>> {
        let session_type = match target_name {
            Some(_) => SessionType::Normal,
            None => SessionType::Discovery,
        };

        let mut params = SessionParams::new(session_type, &self.name, target_name);
        params.initiator_alias = self.alias.clone();

        let connection_params = ConnectionParams {
            max_recv_data_segment_length: self.max_recv_data_segment_length,
            ..ConnectionParams::default()
        };

        Session::open(
            stream,
            params,
            self.authenticators(),
            connection_params,
            addresses,
        )
    }

    /// `None` always, `CHAP` after it when credentials are configured
    fn authenticators(&self) -> Vec<Box<dyn Authenticator>> {
        let mut authenticators: Vec<Box<dyn Authenticator>> = vec![Box::new(NullAuthenticator)];
        if let Some(credentials) = &self.credentials {
            let chap = match &self.target_credentials {
                Some(target) => ChapAuthenticator::mutual(credentials.clone(), target.clone()),
                None => ChapAuthenticator::new(credentials.clone()),
            };
            authenticators.push(Box::new(chap));
        }
        authenticators
    }

    fn connect_stream(&self, address: &TargetAddress) -> ScsiResult<TcpStream> {
        let stream = TcpStream::connect(address.socket_addr())?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.io_timeout)?;
        stream.set_write_timeout(self.io_timeout)?;

        log::debug!("Connected to {}", address);
        Ok(stream)
    }
}

/// Builder for configuring an iSCSI initiator
#[derive(Debug, Default)]
pub struct InitiatorBuilder {
    name: Option<String>,
    alias: Option<String>,
    credentials: Option<ChapCredentials>,
    target_credentials: Option<ChapCredentials>,
    max_recv_data_segment_length: Option<u32>,
    io_timeout: Option<Duration>,
}

impl InitiatorBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Set the iSCSI initiator name (IQN or EUI format)
    ///
    /// Example: iqn.2025-12.local:initiator
    pub fn initiator_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn initiator_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Offer CHAP with these credentials in addition to no authentication
    pub fn credentials(mut self, username: &str, secret: &str) -> Self {
        self.credentials = Some(ChapCredentials::new(username, secret));
        self
    }

    /// Require the target to authenticate back (mutual CHAP)
    pub fn target_credentials(mut self, username: &str, secret: &str) -> Self {
        self.target_credentials = Some(ChapCredentials::new(username, secret));
        self
    }

    /// Largest data segment the target may send us (default: 131072)
    pub fn max_recv_data_segment_length(mut self, length: u32) -> Self {
        self.max_recv_data_segment_length = Some(length);
        self
    }

    /// Read/write timeout for TCP connections (default: none)
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ScsiResult<Initiator> {
        let name = self
            .name
            .unwrap_or_else(|| DEFAULT_INITIATOR_NAME.to_string());
        if !name.starts_with("iqn.") && !name.starts_with("eui.") {
            return Err(IscsiError::Config(
                "initiator_name must be in IQN or EUI format (e.g., iqn.2025-12.local:initiator)"
                    .to_string(),
            ));
        }

        let max_recv_data_segment_length = self
            .max_recv_data_segment_length
            .unwrap_or_else(|| ConnectionParams::default().max_recv_data_segment_length);
        if !(MIN_RECV_DATA_SEGMENT_LENGTH..=MAX_DATA_SEGMENT_LENGTH)
            .contains(&max_recv_data_segment_length)
        {
            return Err(IscsiError::Config(format!(
                "max_recv_data_segment_length must be between {} and {}",
                MIN_RECV_DATA_SEGMENT_LENGTH, MAX_DATA_SEGMENT_LENGTH
            )));
        }

        if self.target_credentials.is_some() && self.credentials.is_none() {
            return Err(IscsiError::Config(
                "target_credentials requires credentials to be set".to_string(),
            ));
        }

        if self.io_timeout == Some(Duration::ZERO) {
            return Err(IscsiError::Config("io_timeout must be non-zero".to_string()));
        }

        Ok(Initiator {
            name,
            alias: self.alias,
            credentials: self.credentials,
            target_credentials: self.target_credentials,
            max_recv_data_segment_length,
            io_timeout: self.io_timeout,
        })
    }
}
