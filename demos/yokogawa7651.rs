use std::time::Duration;

use labvisa::yokogawa7651::{OutputState, VoltageRange, Yokogawa7651};
use labvisa::{Instrument, Resource};

const DEFAULT_ADDRESS: &str = "PROLOGIX::/dev/ttyUSB0::1";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
    let mut source = Yokogawa7651::open(&address, Resource::infer_kind(&address))?;
    println!("{}", source.describe());

    println!("Voltage ranges:");
    for range in VoltageRange::ALL {
        println!("  {range}");
    }

    // 3 V in the 10 V range with a 20 mA current limit, on for ten seconds
    source.initialize()?;
    source.set_voltage_mode(VoltageRange::V10, 20.0)?;
    source.set_output_value(3.0)?;
    source.set_output_state(OutputState::On)?;
    std::thread::sleep(Duration::from_secs(10));
    source.set_output_state(OutputState::Off)?;
    source.close()?;
    Ok(())
}
