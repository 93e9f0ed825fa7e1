//! Discover targets on a portal with SendTargets
//!
//! Usage: cargo run --example discover_targets [portal] [initiator-iqn]

use iscsi_initiator::Initiator;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let portal = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:3260".to_string());

    let initiator_iqn = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "iqn.2025-12.local:test-initiator".to_string());

    println!("Discovering targets at {}...", portal);

    let initiator = Initiator::builder().initiator_name(&initiator_iqn).build()?;
    let targets = initiator.get_targets(&portal)?;

    if targets.is_empty() {
        println!("No targets discovered");
    } else {
        println!("\nDiscovered {} target(s):", targets.len());
        for target in &targets {
            println!("  TargetName: {}", target.name);
            for address in &target.addresses {
                println!("  TargetAddress: {}", address);
            }
            println!();
        }
    }

    Ok(())
}
