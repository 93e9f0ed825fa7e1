//! Log in to every target on a portal and describe its LUNs
//!
//! Usage: cargo run --example browse [portal] [config.toml]
//!
//! The optional config file names the initiator and its CHAP secrets:
//!
//! ```toml
//! [initiator]
//! name = "iqn.2025-12.local:browser"
//! alias = "browser"
//! user = "user"
//! secret = "secret123456"
//! ```

use iscsi_initiator::{Initiator, InitiatorBuilder, LunClass};
use std::io::{Read, Seek, SeekFrom};

fn configure(path: &str) -> Result<InitiatorBuilder, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: toml::Value = contents.parse()?;
    let mut builder = Initiator::builder();

    let section = match config.get("initiator") {
        Some(section) => section,
        None => return Ok(builder),
    };

    if let Some(name) = section.get("name").and_then(|v| v.as_str()) {
        builder = builder.initiator_name(name);
    }
    if let Some(alias) = section.get("alias").and_then(|v| v.as_str()) {
        builder = builder.initiator_alias(alias);
    }
    let user = section.get("user").and_then(|v| v.as_str());
    let secret = section.get("secret").and_then(|v| v.as_str());
    if let (Some(user), Some(secret)) = (user, secret) {
        builder = builder.credentials(user, secret);
    }

    Ok(builder)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let portal = args.next().unwrap_or_else(|| "127.0.0.1:3260".to_string());
    let builder = match args.next() {
        Some(path) => configure(&path)?,
        None => Initiator::builder(),
    };
    let initiator = builder.build()?;

    println!("Initiator: {}", initiator.name());

    for target in initiator.get_targets(&portal)? {
        println!("\n{}", target);

        let mut session = match initiator.connect_to(&target) {
            Ok(session) => session,
            Err(e) => {
                println!("  login failed: {}", e);
                continue;
            }
        };

        for info in session.get_luns()? {
            println!(
                "  LUN {}: {:?} {} {} {}",
                info, info.device_type, info.vendor_id, info.product_id, info.product_revision
            );
            if info.device_type != LunClass::BlockStorage {
                continue;
            }

            let capacity = session.get_capacity(info.lun)?;
            println!(
                "    {} blocks of {} bytes ({} MiB)",
                capacity.logical_block_count,
                capacity.block_size,
                capacity.size_bytes() / (1024 * 1024)
            );

            // Boot sector signature
            let mut disk = session.open_disk(info.lun)?;
            let mut sector = [0u8; 512];
            disk.seek(SeekFrom::Start(0))?;
            disk.read_exact(&mut sector)?;
            if sector[510..512] == [0x55, 0xAA] {
                println!("    MBR signature present");
            } else {
                println!("    first sector: {}", hex::encode(&sector[..16]));
            }
        }

        session.close()?;
    }

    Ok(())
}
