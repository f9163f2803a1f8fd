use boardlink_hal::types::FirmwareInfo;
use boardlink_orchestrator::{OrchestratorConfig, create_session};
use boardlink_runtime::HostEvent;
use boardlink_serial::SerialPorts;
use serde::Serialize;
use std::env;
use std::path::Path;

/// What a scan found, printed as one JSON line.
#[derive(Debug, Serialize)]
struct ScanReport {
    path: String,
    firmware: Option<FirmwareInfo>,
    pin_count: usize,
    input_pins: Vec<u8>,
    pwm_pins: Vec<u8>,
    servo_pins: Vec<u8>,
    analog_pins: Vec<u8>,
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} <board_config.toml>\n       {program} --list-ports");
    std::process::exit(1)
}

fn list_ports() {
    let ports = match SerialPorts::new().list() {
        Ok(ports) => ports,
        Err(err) => {
            eprintln!("Failed to enumerate serial ports: {err}");
            std::process::exit(1);
        }
    };
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        let product = port.product.unwrap_or_default();
        println!("{} {product}", port.descriptor);
    }
}

fn print_event(event: &HostEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => log::warn!("could not encode {event:?}: {err}"),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = env::args();
    let program = args.next().unwrap_or_else(|| "boardlink".to_string());

    let Some(arg) = args.next() else {
        usage(&program);
    };
    if args.next().is_some() {
        usage(&program);
    }

    if arg == "--list-ports" {
        list_ports();
        return;
    }

    if Path::new(&arg).extension().and_then(|ext| ext.to_str()) != Some("toml") {
        eprintln!("Expected a .toml config path, got: {arg}");
        std::process::exit(1);
    }

    let config = match OrchestratorConfig::from_file(&arg) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let mut session = match create_session(&config) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let ext = &session.extension;
    let board = match ext.scan().await {
        Ok(board) => board,
        Err(err) => {
            eprintln!("Scan failed: {err}");
            std::process::exit(1);
        }
    };

    let report = ScanReport {
        path: board.descriptor().map(|d| d.path).unwrap_or_default(),
        firmware: board.firmware(),
        pin_count: board.pin_count(),
        input_pins: ext.input_pins(),
        pwm_pins: ext.pwm_pins(),
        servo_pins: ext.servo_pins(),
        analog_pins: board.analog_pins(),
    };
    match serde_json::to_string(&report) {
        Ok(line) => println!("{line}"),
        Err(err) => log::warn!("could not encode scan report: {err}"),
    }

    ext.disconnect();
    while let Ok(event) = session.host_events.try_recv() {
        print_event(&event);
    }
}
