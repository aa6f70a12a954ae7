//! Minimal demo: paint one element and ask for its firmware version.

use std::env;
use std::process::exit;

use mendeleev_bus::{BusMaster, Command, DEFAULT_TIMEOUT};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 6 {
        eprintln!("usage: setcolor <device> <element> <r> <g> <b>");
        exit(1);
    }

    let element: u8 = args[2].parse().expect("element address");
    let color: Vec<u8> = args[3..6]
        .iter()
        .map(|v| v.parse().expect("color byte"))
        .collect();

    let mut master = BusMaster::new(&args[1]);
    if let Err(e) = master.connect() {
        eprintln!("failed to connect: {e}");
        exit(1);
    }

    if let Err(e) = master.send_cmd(element, Command::SetColor, &color, DEFAULT_TIMEOUT) {
        eprintln!("setcolor failed: {e}");
        exit(1);
    }

    match master.version(element, DEFAULT_TIMEOUT) {
        Ok(version) => println!("element {element} acknowledged, firmware {version}"),
        Err(e) => eprintln!("version query failed: {e}"),
    }
}
