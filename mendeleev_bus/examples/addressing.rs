//! Interactive address assignment for a freshly connected wall of elements.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use mendeleev_bus::BusMaster;
use mendeleev_bus::addressing::{AddressingMode, AddressingProcedure};

#[derive(Parser)]
#[command(about = "Assign bus addresses to the elements, one touch at a time")]
struct Args {
    /// The RS485 tty device, or socket://host:port
    #[arg(short, long)]
    device: String,

    /// Seconds to wait between broadcast messages
    #[arg(short = 'w', long, default_value_t = 0.5)]
    broadcast_wait: f64,

    /// Prompt for every address instead of walking 1..118
    #[arg(short, long)]
    manual: bool,

    /// Seconds to wait for a touch in manual mode (automatic mode waits
    /// until Ctrl-C)
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Log level filter
    #[arg(short, long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new().parse_filters(&args.log).init();

    log::info!("starting on {}", args.device);
    let mut master = BusMaster::new(&args.device);
    master.connect()?;

    let mode = if args.manual {
        AddressingMode::Manual
    } else {
        AddressingMode::Automatic
    };
    let mut procedure = AddressingProcedure::new(&master, mode);
    procedure.broadcast_wait = Duration::from_secs_f64(args.broadcast_wait);
    procedure.ready_timeout = args.timeout.map(Duration::from_secs_f64);
    procedure.run()?;

    log::info!("finished");
    Ok(())
}
