//! Host computer flows: load, save, DOS commands, and the drive's
//! error channel.

use std::fs;
use std::path::Path;

use crate::bus::transport::{check_target_device, Transport};
use crate::bus::Identity;
use crate::error::{IecError, Result};
use crate::listing;
use crate::petscii::Petscii;

/// The computer side of the bus.
pub struct Host {
    transport: Transport,
}

impl Host {
    pub fn new(mut transport: Transport) -> Result<Host> {
        transport.set_identity(Identity::Computer)?;
        Ok(Host { transport })
    }

    /// Load a file (or, for `$`, the directory) from a drive.  A
    /// regular file is written locally under the same name; existing
    /// local files are not overwritten.  On a bus error the drive's
    /// error channel is read for the human message before the error is
    /// re-raised.
    pub fn load(&mut self, filename: &str, device: u8) -> Result<()> {
        let is_directory = filename == "$";
        if !is_directory && Path::new(filename).exists() {
            println!("Not overwriting '{}'", filename);
            return Err(IecError::FileExists);
        }

        let name: Petscii = filename.into();
        let data = match self.transport.load(&name, device) {
            Ok(data) => data,
            Err(e) => {
                println!("{}", e);
                self.read_error_channel(device)?;
                return Err(e);
            }
        };
        println!("{} bytes", data.len());

        if is_directory {
            listing::print_basic_listing(&data);
        } else {
            fs::write(filename, &data).map_err(|_| IecError::FileWriteError)?;
        }
        Ok(())
    }

    /// Save a local file to a drive.
    pub fn save(&mut self, filename: &str, device: u8) -> Result<()> {
        let data = fs::read(filename).map_err(|_| IecError::FileNotFound)?;
        let name: Petscii = filename.into();
        match self.transport.save(&name, device, &data) {
            Ok(written) => {
                println!("{} bytes", written);
                Ok(())
            }
            Err(e) => {
                println!("{}", e);
                self.read_error_channel(device)?;
                Err(e)
            }
        }
    }

    /// Send a DOS command string to the drive's command channel, then
    /// report the resulting status.
    pub fn command(&mut self, command: &str, device: u8) -> Result<()> {
        check_target_device(device)?;
        let command: Petscii = command.into();
        self.transport.send_data(command.as_bytes(), device, 15)?;
        self.read_error_channel(device)
    }

    /// Drain the error channel and print it as ASCII.
    pub fn read_error_channel(&mut self, device: u8) -> Result<()> {
        check_target_device(device)?;
        let mut message = vec![];
        self.transport.receive_data(&mut message, device, 15)?;
        let text = Petscii::from_bytes(&message).to_ascii_string();
        println!("{}", text.trim_end());
        Ok(())
    }
}
