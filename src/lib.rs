//! A pure Rust iSCSI initiator
//!
//! This library logs in to iSCSI targets over any ordered byte stream (TCP in
//! practice), negotiates session and connection parameters, and executes
//! SCSI commands with R2T flow control. On top of that it offers target
//! discovery, LUN enumeration, block reads and writes, and a seekable
//! [`DiskStream`] over a single LUN.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_initiator::Initiator;
//! use std::io::Read;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let initiator = Initiator::builder()
//!     .initiator_name("iqn.2025-12.local:initiator")
//!     .build()?;
//!
//! let targets = initiator.get_targets("192.168.1.10:3260")?;
//! let mut session = initiator.connect_to(&targets[0])?;
//!
//! for lun in session.get_block_device_luns()? {
//!     let capacity = session.get_capacity(lun)?;
//!     println!("LUN {}: {} bytes", lun, capacity.size_bytes());
//!
//!     let mut disk = session.open_disk(lun)?;
//!     let mut boot_sector = [0u8; 512];
//!     disk.read_exact(&mut boot_sector)?;
//! }
//!
//! session.close()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod command;
pub mod connection;
pub mod disk;
pub mod error;
pub mod initiator;
pub mod login;
pub mod params;
pub mod pdu;
pub mod scsi;
pub mod session;
pub mod target;
pub mod text;

pub use auth::{Authenticator, ChapAuthenticator, ChapCredentials, NullAuthenticator};
pub use connection::Connection;
pub use disk::DiskStream;
pub use error::{decode_login_status, IscsiError, LoginStatus, ScsiResult};
pub use initiator::{Initiator, InitiatorBuilder};
pub use login::LoginStage;
pub use params::{ConnectionParams, SessionParams, SessionType};
pub use scsi::{LunCapacity, LunClass, LunInfo, ScsiCommand, ScsiStatus};
pub use session::{Session, SessionState};
pub use target::{TargetAddress, TargetInfo};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
