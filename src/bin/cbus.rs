use std::env;
use std::process;
use std::thread;

use clap::{App, AppSettings, Arg, SubCommand};

use iec::bus::channel::{pipe_pair, BusChannel};
use iec::bus::lines::{GpioLines, DEFAULT_PINS};
use iec::bus::transport::Transport;
use iec::drive::Drive;
use iec::host::Host;
use iec::{IecError, Result};

static EXIT_FAILURE: i32 = 1;

static MODES: [&str; 5] = ["serve", "load", "save", "cmd", "errch"];

fn main() {
    env_logger::init();

    // A bare path as the first argument means serve mode.
    let mut args: Vec<String> = env::args().collect();
    if args.len() > 1 {
        let first = args[1].as_str();
        if !MODES.contains(&first) && !first.starts_with('-') && first != "help" {
            args.insert(1, "serve".to_string());
        }
    }

    let matches = App::new("Commodore IEC Bus Utility")
        .version("0.1.0")
        .about("Serve a directory or D64 image as a 1541 drive, or act as the computer against a real drive.")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("serve")
                .about("Act as a disk drive serving a directory or disk image")
                .arg(Arg::with_name("path").required(true))
                .arg(
                    Arg::with_name("command")
                        .required(false)
                        .help("Also act as host against the served image: \"$\" lists the directory, anything else is a DOS command"),
                )
                .arg(
                    Arg::with_name("device")
                        .required(false)
                        .validator(drive_device_validator),
                ),
        )
        .subcommand(
            SubCommand::with_name("load")
                .about("Load a file (or \"$\") from a drive")
                .arg(Arg::with_name("filename").required(true))
                .arg(
                    Arg::with_name("device")
                        .required(false)
                        .validator(target_device_validator),
                ),
        )
        .subcommand(
            SubCommand::with_name("save")
                .about("Save a local file to a drive")
                .arg(Arg::with_name("filename").required(true))
                .arg(
                    Arg::with_name("device")
                        .required(false)
                        .validator(target_device_validator),
                ),
        )
        .subcommand(
            SubCommand::with_name("cmd")
                .about("Send a DOS command and read the drive status")
                .arg(Arg::with_name("command").required(true))
                .arg(
                    Arg::with_name("device")
                        .required(false)
                        .validator(target_device_validator),
                ),
        )
        .subcommand(
            SubCommand::with_name("errch")
                .about("Read the drive's error channel")
                .arg(
                    Arg::with_name("device")
                        .required(false)
                        .validator(target_device_validator),
                ),
        )
        .get_matches_from(args);

    let result = match matches.subcommand() {
        ("serve", Some(m)) => {
            // `serve <path> <n>` means a device number, not a host
            // command.
            let (command, device) = match (m.value_of("command"), m.value_of("device")) {
                (Some(c), None) if c.parse::<u8>().map_or(false, |n| (4..=11).contains(&n)) => {
                    (None, c.parse().unwrap_or(8))
                }
                (c, d) => (c, device_of(d)),
            };
            cmd_serve(m.value_of("path").unwrap(), command, device)
        }
        ("load", Some(m)) => cmd_load(
            m.value_of("filename").unwrap(),
            device_of(m.value_of("device")),
        ),
        ("save", Some(m)) => cmd_save(
            m.value_of("filename").unwrap(),
            device_of(m.value_of("device")),
        ),
        ("cmd", Some(m)) => cmd_command(
            m.value_of("command").unwrap(),
            device_of(m.value_of("device")),
        ),
        ("errch", Some(m)) => cmd_error_channel(device_of(m.value_of("device"))),
        _ => unreachable!(),
    };

    if let Err(e) = result {
        println!("{}", e);
        process::exit(EXIT_FAILURE);
    }
}

fn device_of(value: Option<&str>) -> u8 {
    value.and_then(|v| v.parse().ok()).unwrap_or(8)
}

fn device_validator(value: String, min: u8) -> std::result::Result<(), String> {
    match value.parse::<u8>() {
        Ok(n) if n >= min && n <= 11 => Ok(()),
        _ => Err(IecError::IllegalDeviceNumber.to_string()),
    }
}

/// Drives answer to 8..=11.
fn drive_device_validator(value: String) -> std::result::Result<(), String> {
    device_validator(value, 8)
}

/// Host operations may target serial devices 4..=11.
fn target_device_validator(value: String) -> std::result::Result<(), String> {
    device_validator(value, 4)
}

/// Open the real bus and wrap it in a transport.
fn bus_transport() -> Result<Transport> {
    let lines = GpioLines::open(&DEFAULT_PINS)?;
    let channel = BusChannel::open(lines)?;
    Ok(Transport::new(Box::new(channel)))
}

fn cmd_serve(path: &str, command: Option<&str>, device: u8) -> Result<()> {
    match command {
        None => {
            let mut drive = Drive::new(bus_transport()?, device)?;
            drive.serve(path)
        }
        Some(command) => {
            // Run the drive side on its own thread against an
            // in-process pipe, and act as the host on this one.
            let (host_end, drive_end) = pipe_pair();
            let drive_path = path.to_string();
            let server = thread::spawn(move || -> Result<()> {
                let mut drive = Drive::new(Transport::new(Box::new(drive_end)), device)?;
                drive.serve(&drive_path)
            });

            let mut host = Host::new(Transport::new(Box::new(host_end)))?;
            let result = if command == "$" {
                host.load("$", device)
            } else {
                host.command(command, device)
            };

            drop(host);
            match server.join() {
                Ok(served) => result.and(served),
                Err(_) => Err(IecError::GeneralError),
            }
        }
    }
}

fn cmd_load(filename: &str, device: u8) -> Result<()> {
    Host::new(bus_transport()?)?.load(filename, device)
}

fn cmd_save(filename: &str, device: u8) -> Result<()> {
    Host::new(bus_transport()?)?.save(filename, device)
}

fn cmd_command(command: &str, device: u8) -> Result<()> {
    Host::new(bus_transport()?)?.command(command, device)
}

fn cmd_error_channel(device: u8) -> Result<()> {
    Host::new(bus_transport()?)?.read_error_channel(device)
}
