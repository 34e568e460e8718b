// Stage diagnostic: READ-ONLY check of the controller connection
//
// Queries both axes and prints their settings. Nothing is written to the
// motors apart from the queries themselves, so nothing moves.
//
// Usage: cargo run --example stage_diagnostic -- [port]
// Example: cargo run --example stage_diagnostic -- /dev/ttyUSB0

use stage_control::config::{DEFAULT_BAUDRATE, DEFAULT_PORT, DEFAULT_TIMEOUT, MOTOR_MAX_CURRENT};
use stage_control::stage::Stage;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_PORT.to_string());

    println!("Stage diagnostic (read-only)");
    println!("Serial port: {}", port);
    println!();

    let stage = Stage::new(MOTOR_MAX_CURRENT, true);
    println!("Step 1: Opening serial port...");
    if !stage.connect(&port, DEFAULT_BAUDRATE, DEFAULT_TIMEOUT) {
        println!("  x Failed to open {}", port);
        println!();
        println!("Troubleshooting:");
        println!("  - Check the port name is correct");
        println!("  - Verify the controller is powered and the cable is connected");
        return Err(format!("could not open {port}").into());
    }
    println!("  ok");
    println!();

    println!("Step 2: Listing controller addresses...");
    match stage.get_addresses() {
        Ok(addresses) => println!("  Addresses: {}", addresses),
        Err(e) => println!("  x {}", e),
    }
    println!();

    println!(
        "Step 3: Reading axis settings (motor rating {} A)...",
        stage.motor_max_current()
    );
    for motor in [1u8, 2] {
        match stage.report(motor) {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(e) => println!("  Motor {}: x {}", motor, e),
        }
    }

    stage.disconnect();
    Ok(())
}
