//! 1541 disk drive emulation.
//!
//! The drive serves either a local host directory or a mounted D64
//! image.  A serve loop folds the bus into commands, tracks per-channel
//! state for the sixteen secondary addresses, executes DOS commands
//! from the command channel, and streams file data in both directions.
//! Channel 15 is the command/status channel, 0 is load, 1 is save, and
//! 2..14 are user files.

pub mod dos;

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::bus::channel;
use crate::bus::transport::{BusCommand, Transport};
use crate::bus::Identity;
use crate::disk::DiskImage;
use crate::drive::dos::{DosCommand, DosStatus, FileSpec};
use crate::error::{IecError, Result};
use crate::listing;
use crate::petscii::Petscii;

/// What the drive is serving.
enum ServeMode {
    /// A local directory; file names map to host files.
    Directory(PathBuf),
    /// A mounted disk image.
    Image(DiskImage),
}

/// State of one secondary address.
struct Channel {
    open: bool,
    last_command: Option<BusCommand>,
    dos_command: DosCommand,
    /// Raw received name or command string.
    petscii: Vec<u8>,
    /// ASCII mirror for host-side file access and diagnostics.
    ascii: String,
    /// Pending payload.
    data: Vec<u8>,
    /// Decoded file name, access mode, and type.
    name: Petscii,
    access: u8,
    file_type: u8,
}

impl Channel {
    fn new() -> Channel {
        Channel {
            open: false,
            last_command: None,
            dos_command: DosCommand::None,
            petscii: vec![],
            ascii: String::new(),
            data: vec![],
            name: Petscii::new(),
            access: b'R',
            file_type: 0x20,
        }
    }

    fn reset(&mut self) {
        *self = Channel::new();
    }
}

/// The command/status channel is always open on a real drive.
const COMMAND_CHANNEL: u8 = 15;

pub struct Drive {
    transport: Transport,
    device_number: u8,
    mode: Option<ServeMode>,
    channels: Vec<Channel>,
    status: DosStatus,
}

impl Drive {
    /// Bind a drive identity to a transport.  Device numbers 8..=11
    /// are accepted.
    pub fn new(mut transport: Transport, device_number: u8) -> Result<Drive> {
        transport.set_identity(Identity::drive(device_number)?)?;
        Ok(Drive {
            transport,
            device_number,
            mode: None,
            channels: (0..16).map(|_| Channel::new()).collect(),
            status: DosStatus::power_on(),
        })
    }

    /// Serve a directory or disk image until SIGINT or until the other
    /// end of the bus goes away.
    pub fn serve<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => {
                eprintln!("Cannot access '{}'", path.display());
                return Err(IecError::FileNotFound);
            }
        };
        self.mode = Some(if metadata.is_file() {
            ServeMode::Image(DiskImage::open(path)?)
        } else if metadata.is_dir() {
            ServeMode::Directory(path.to_path_buf())
        } else {
            eprintln!("'{}' is not a directory.", path.display());
            return Err(IecError::FileNotFound);
        });

        for channel in self.channels.iter_mut() {
            channel.reset();
        }

        println!("Entering disk drive service loop");
        println!("Exit with Ctrl-C or SIGINT");
        channel::install_interrupt_handler()?;

        let mut injected: Option<i16> = None;
        let result = loop {
            match self.serve_one(injected.take()) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(IecError::IllegalState) => break Err(IecError::IllegalState),
                Err(IecError::Signal) => {
                    println!();
                    println!("Exiting disk drive service loop");
                    break Ok(());
                }
                Err(IecError::DeviceNotPresent) => {
                    // The other end of an in-process pipe went away.
                    debug!("bus peer gone, leaving the serve loop");
                    break Ok(());
                }
                Err(IecError::UnexpectedCommand(word)) => {
                    println!();
                    println!("Unexpected command {}", word);
                    injected = Some(word);
                }
                Err(e) => {
                    // Keep serving through everything else.
                    println!();
                    println!("{}", e);
                    if self.transport.clear_error().is_err() {
                        break Ok(());
                    }
                }
            }
        };

        if let Some(ServeMode::Image(mut disk)) = self.mode.take() {
            disk.flush()?;
        }
        result
    }

    /// Handle one bus command.  `Ok(false)` ends the loop.
    fn serve_one(&mut self, injected: Option<i16>) -> Result<bool> {
        let (command, secondary) = self
            .transport
            .receive_command(self.device_number, injected)?;
        if let Some(sa) = secondary {
            self.channels[sa as usize].last_command = Some(command);
        }
        match command {
            BusCommand::Open(sa) => self.handle_open(sa)?,
            BusCommand::Close(sa) => self.handle_close(sa)?,
            BusCommand::Receive(sa) => self.handle_receive(sa)?,
            BusCommand::Send(sa) => self.handle_send(sa)?,
            BusCommand::Unlisten => println!("Unlisten"),
            BusCommand::Untalk => println!("Untalk"),
            BusCommand::Exit => {
                println!();
                println!("Exiting disk drive service loop");
                return Ok(false);
            }
            BusCommand::OpenOther
            | BusCommand::CloseOther
            | BusCommand::ReceiveOther
            | BusCommand::SendOther => debug!("{:?}", command),
            // Spurious ATN traffic, e.g. from power cycling.
            BusCommand::Unknown => {}
        }
        Ok(true)
    }

    fn handle_open(&mut self, sa: u8) -> Result<()> {
        println!("Open {}", sa);
        if self.channels[sa as usize].open && sa != COMMAND_CHANNEL {
            println!("Channel {} already open!", sa);
            return Err(IecError::IllegalState);
        }
        self.channels[sa as usize].open = true;
        self.receive_name_or_command(sa)
    }

    fn handle_close(&mut self, sa: u8) -> Result<()> {
        println!("Close {}", sa);
        if !self.channels[sa as usize].open && sa != COMMAND_CHANNEL {
            println!("Channel {} already closed!", sa);
            return Err(IecError::IllegalState);
        }
        debug!(
            "closing channel {} (last DOS command {:?})",
            sa, self.channels[sa as usize].dos_command
        );
        self.channels[sa as usize].reset();
        if let Some(ServeMode::Image(disk)) = &mut self.mode {
            disk.flush()?;
        }
        Ok(())
    }

    /// LISTEN-phase data: a payload arrives from the host.
    fn handle_receive(&mut self, sa: u8) -> Result<()> {
        if !self.channels[sa as usize].open && sa != COMMAND_CHANNEL {
            println!("Channel {} not open!", sa);
            return Err(IecError::IllegalState);
        }
        match sa {
            1 => {
                println!("Save \"{}\"", self.channels[sa as usize].ascii);
                let mut data = vec![];
                self.transport.set_verbose(true);
                let received = self.transport.receive_from_bus(&mut data, None);
                self.transport.set_verbose(false);
                received?;
                self.write_to_disk(sa, data)?;
            }
            2..=14 => {
                println!("Write {}:\"{}\"", sa, self.channels[sa as usize].ascii);
                let mut data = vec![];
                self.transport.receive_from_bus(&mut data, None)?;
                self.channels[sa as usize].data.append(&mut data);
            }
            COMMAND_CHANNEL => {
                self.receive_name_or_command(sa)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// TALK-phase data: the host wants a payload from us.
    fn handle_send(&mut self, sa: u8) -> Result<()> {
        if !self.channels[sa as usize].open && sa != COMMAND_CHANNEL {
            println!("Channel {} not open!", sa);
            return Err(IecError::IllegalState);
        }
        match sa {
            0 => {
                println!("Load \"{}\"", self.channels[sa as usize].ascii);
                let data = self.read_from_disk(sa)?;
                self.channels[sa as usize].data = data;
                self.send_channel_data(sa)?;
            }
            2..=14 => {
                println!("Read {}:\"{}\"", sa, self.channels[sa as usize].ascii);
                self.send_channel_data(sa)?;
            }
            COMMAND_CHANNEL => {
                let message = self.status.to_bytes();
                self.status = DosStatus::ok();
                self.transport.send_to_bus(&message)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Stream a channel's pending buffer, keeping whatever the host
    /// did not accept.
    fn send_channel_data(&mut self, sa: u8) -> Result<()> {
        let data = ::std::mem::replace(&mut self.channels[sa as usize].data, vec![]);
        self.transport.set_verbose(true);
        let sent = self.transport.send_to_bus(&data);
        self.transport.set_verbose(false);
        let sent = sent?;
        if sent != data.len() {
            println!("?break");
            self.channels[sa as usize].data = data[sent..].to_vec();
        }
        Ok(())
    }

    /// Drain the file name (or command string) that follows an OPEN,
    /// decode it, and execute it when it addresses the command channel.
    fn receive_name_or_command(&mut self, sa: u8) -> Result<()> {
        let mut bytes = vec![];
        self.transport.receive_from_bus(&mut bytes, None)?;

        let ascii = Petscii::from_bytes(&bytes).to_ascii_string();
        if sa == COMMAND_CHANNEL {
            println!("command \"{}\"", ascii.trim_end());
        } else {
            println!("filename \"{}\"", ascii);
        }

        let FileSpec {
            name,
            file_type,
            access,
        } = dos::parse_file_spec(&bytes);
        {
            let channel = &mut self.channels[sa as usize];
            channel.petscii = bytes;
            channel.ascii = ascii;
            channel.name = name;
            channel.file_type = file_type;
            channel.access = access;
            debug!(
                "channel {} name {:?} type '{}' mode '{}'",
                sa, channel.name, channel.file_type as char, channel.access as char
            );
        }

        // OPEN on the command channel and PRINT# payloads both carry
        // DOS commands.
        let is_command = sa == COMMAND_CHANNEL
            || self.channels[sa as usize].last_command == Some(BusCommand::Receive(sa));
        if is_command {
            self.execute_dos_command(sa)?;
        }
        Ok(())
    }

    fn execute_dos_command(&mut self, sa: u8) -> Result<()> {
        let mut bytes = self.channels[sa as usize].petscii.clone();
        let command = match dos::identify(&mut bytes) {
            Some(command) => command,
            None => {
                self.status = DosStatus::syntax_error();
                return Ok(());
            }
        };
        self.channels[sa as usize].dos_command = command;
        if command == DosCommand::None {
            return Ok(());
        }
        debug!("DOS command {:?}", command);
        match self.run_dos_command(command, &bytes) {
            Ok(status) => self.status = status,
            Err(e) => self.status = DosStatus::from_error(e),
        }
        Ok(())
    }

    /// Execute a recognized DOS command.  The disk-management commands
    /// act on a mounted image; the rest are recognized and reply OK
    /// without further effect.
    fn run_dos_command(&mut self, command: DosCommand, bytes: &[u8]) -> Result<DosStatus> {
        match command {
            DosCommand::New => {
                if let Some(ServeMode::Image(disk)) = &mut self.mode {
                    let arguments = dos::arguments(bytes);
                    let mut parts = arguments.splitn(2, |&c| c == 0x2C);
                    let name = Petscii::from_bytes(parts.next().unwrap_or(&[]));
                    let id = parts.next().unwrap_or(b"\xA0\xA0");
                    disk.format(&name, id)?;
                }
                Ok(DosStatus::ok())
            }
            DosCommand::Scratch => {
                if let Some(ServeMode::Image(disk)) = &mut self.mode {
                    let spec = dos::parse_file_spec(dos::arguments(bytes));
                    let count = disk.scratch(&spec.name)?;
                    return Ok(DosStatus::files_scratched(count));
                }
                Ok(DosStatus::ok())
            }
            DosCommand::Initialize => {
                // Re-mount the image, dropping any cached state.
                let path = match &mut self.mode {
                    Some(ServeMode::Image(disk)) => {
                        disk.flush()?;
                        disk.path().map(|p| p.to_path_buf())
                    }
                    _ => None,
                };
                if let Some(path) = path {
                    self.mode = Some(ServeMode::Image(DiskImage::open(path)?));
                }
                Ok(DosStatus::ok())
            }
            DosCommand::Validate => Ok(DosStatus::ok()),
            // Recognized but not implemented on this drive.
            _ => Ok(DosStatus::ok()),
        }
    }

    fn read_from_disk(&mut self, sa: u8) -> Result<Vec<u8>> {
        let ascii = self.channels[sa as usize].ascii.clone();
        let name = self.channels[sa as usize].name.clone();
        match &self.mode {
            Some(ServeMode::Image(disk)) => {
                if ascii == "$" {
                    listing::image_directory(disk)
                } else {
                    disk.read_file(&name)
                }
            }
            Some(ServeMode::Directory(path)) => {
                if ascii == "$" {
                    listing::local_directory(path)
                } else {
                    let path = path.join(&ascii);
                    fs::read(&path).map_err(|_| {
                        eprintln!("Could not open local file '{}'", ascii);
                        IecError::FileNotFound
                    })
                }
            }
            None => Err(IecError::UnknownMode),
        }
    }

    fn write_to_disk(&mut self, sa: u8, data: Vec<u8>) -> Result<()> {
        let ascii = self.channels[sa as usize].ascii.clone();
        let name = self.channels[sa as usize].name.clone();
        match &mut self.mode {
            Some(ServeMode::Image(disk)) => disk.write_file(&name, &data),
            Some(ServeMode::Directory(root)) => {
                let path = root.join(&ascii);
                fs::write(&path, &data).map_err(|_| IecError::FileWriteError)
            }
            None => Err(IecError::UnknownMode),
        }
    }
}
