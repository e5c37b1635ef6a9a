use clap::Parser;
use intelliflo::{
    frame::Address,
    scheduler::{Config, Scheduler},
    serial::{self, TokioClock},
};
use std::{error::Error, time::Duration};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pump numbers to poll (1 to 16)
    #[arg(short = 'n', long = "pump", value_parser = parse_pump, default_value = "1")]
    pumps: Vec<Address>,

    /// Poll interval in seconds
    #[arg(short, long, default_value_t = 10)]
    interval: u64,

    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,
}

fn parse_pump(s: &str) -> Result<Address, String> {
    let num: u8 = s.parse().map_err(|err| format!("{err}"))?;

    Address::pump(num).ok_or_else(|| format!("pump number out of range: {num}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = Config {
        poll_interval: Duration::from_secs(args.interval),
        ..Config::default()
    };
    let port = serial::open(&args.port)?;
    let mut sched = Scheduler::new(port, TokioClock::new(), &args.pumps, config)?;

    for &pump in &args.pumps {
        let sink = sched.telemetry();

        sink.register_power_observer(pump, move |watts| println!("{pump}: power {watts} W"));
        sink.register_rpm_observer(pump, move |rpm| println!("{pump}: speed {rpm} rpm"));
        sink.register_running_observer(pump, move |running| {
            println!("{pump}: {}", if running { "running" } else { "stopped" });
        });
        sink.register_reachability_observer(pump, move |reachable| {
            println!(
                "{pump}: {}",
                if reachable { "reachable" } else { "unreachable" }
            );
        });
    }

    sched.run().await?;

    Ok(())
}
