//! Semantic bus primitives on top of a word channel.
//!
//! The transport frames IEC transactions for both sides of the bus:
//! the host computer uses `listen`/`talk`/`open_file`/`send_data`/
//! `receive_data`, a drive uses `receive_command` to fold the under-ATN
//! stream into bus commands and the same data primitives for payload.
//!
//! The final byte of every transmission must be preceded by
//! [`bus::LAST_BYTE_NEXT`], so the sender keeps a one-byte look-ahead
//! buffer: each outgoing byte displaces the previously buffered one,
//! and an explicit flush emits the sentinel followed by the held byte.

use std::time::Duration;

use log::{debug, warn};

use crate::bus::channel::{Channel, SendOutcome, TIMEOUT};
use crate::bus::{self, cmd, Identity};
use crate::error::{IecError, Result};
use crate::petscii::Petscii;

/// A bus command folded from the under-ATN stream, as seen by a drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusCommand {
    /// OPEN on one of our secondary addresses.
    Open(u8),
    /// CLOSE on one of our secondary addresses.
    Close(u8),
    /// Data follows from the host (LISTEN phase).
    Receive(u8),
    /// The host wants data from us (TALK phase).
    Send(u8),
    OpenOther,
    CloseOther,
    ReceiveOther,
    SendOther,
    Unlisten,
    Untalk,
    /// A signal ended the serve loop.
    Exit,
    /// Spurious ATN traffic, e.g. from power cycling.
    Unknown,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CommandRole {
    Idle,
    Listen,
    Talk,
}

/// Framing layer over a [`Channel`].
pub struct Transport {
    channel: Box<dyn Channel>,
    buffered: Option<i16>,
    last_error: i16,
    verbose: bool,
}

impl Transport {
    pub fn new(channel: Box<dyn Channel>) -> Transport {
        Transport {
            channel,
            buffered: None,
            last_error: bus::OK,
            verbose: false,
        }
    }

    /// Assume a bus identity.  On a real bus device this posts the
    /// identity sentinel and resets the engine; on an in-process pipe
    /// the identity is implicit in the wiring.
    pub fn set_identity(&mut self, identity: Identity) -> Result<()> {
        if let Identity::Drive(device) = identity {
            Identity::drive(device)?;
        }
        if self.channel.is_bus_device() {
            self.send_word(identity.sentinel())?;
        }
        Ok(())
    }

    /// Print block-count progress on long transfers.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn last_error(&self) -> i16 {
        self.last_error
    }

    /// Current engine state number (debug surface).
    pub fn engine_state(&self) -> Option<u8> {
        self.channel.engine_state()
    }

    // ----- word level -----

    fn send_word(&mut self, word: i16) -> Result<SendOutcome> {
        match self.channel.send(word) {
            Ok(outcome) => Ok(outcome),
            Err(IecError::Signal) => Err(IecError::Signal),
            Err(e) => {
                self.consume_error_code();
                self.last_error = e.code();
                Err(e)
            }
        }
    }

    fn receive_word(&mut self, timeout: Option<Duration>) -> Result<i16> {
        match self.channel.recv(timeout) {
            Ok(word) => {
                if IecError::is_error_code(word) {
                    self.last_error = word;
                }
                Ok(word)
            }
            Err(IecError::Signal) => Err(IecError::Signal),
            Err(e) => {
                self.consume_error_code();
                self.last_error = e.code();
                Err(e)
            }
        }
    }

    /// After a failed operation the engine has posted the error code
    /// in-band; consume it so the stream stays aligned.
    fn consume_error_code(&mut self) {
        if !self.channel.is_bus_device() {
            return;
        }
        match self.channel.recv(Some(Duration::from_millis(100))) {
            Ok(word) if IecError::is_error_code(word) => {}
            Ok(word) => warn!("expected error code, got {:#X}", word),
            Err(_) => {}
        }
    }

    /// Reset the engine's error state.  A pipe has no engine, so only
    /// the local record is cleared there.
    pub fn clear_error(&mut self) -> Result<()> {
        if self.channel.is_bus_device() {
            self.send_word(bus::CLEAR_ERROR)?;
        }
        self.last_error = bus::OK;
        Ok(())
    }

    // ----- buffered last byte -----

    fn begin_buffered(&mut self) {
        self.buffered = None;
    }

    fn send_buffered(&mut self, word: i16) -> Result<SendOutcome> {
        let outcome = match self.buffered.take() {
            Some(previous) => self.send_word(previous)?,
            None => SendOutcome::Sent,
        };
        self.buffered = Some(word);
        Ok(outcome)
    }

    fn send_last_byte(&mut self) -> Result<SendOutcome> {
        if let Some(last) = self.buffered.take() {
            if let SendOutcome::TalkInterrupted = self.send_word(bus::LAST_BYTE_NEXT)? {
                return Ok(SendOutcome::TalkInterrupted);
            }
            return self.send_word(last);
        }
        Ok(SendOutcome::Sent)
    }

    // ----- command framing -----

    fn command(&mut self, command: u8) -> Result<()> {
        self.send_last_byte()?;
        self.send_word(bus::ASSERT_ATN)?;
        self.send_word(-i16::from(command))?;
        Ok(())
    }

    fn secondary_command(&mut self, command: u8, talk: bool) -> Result<()> {
        self.send_word(-i16::from(command))?;
        if talk {
            self.send_word(bus::TURNAROUND)?;
        } else {
            self.send_word(bus::DEASSERT_ATN)?;
        }
        Ok(())
    }

    pub fn listen(&mut self, device: u8) -> Result<()> {
        self.command(cmd::listen(device))
    }

    pub fn talk(&mut self, device: u8) -> Result<()> {
        self.command(cmd::talk(device))
    }

    pub fn unlisten(&mut self) -> Result<()> {
        self.send_last_byte()?;
        self.command(cmd::UNLISTEN)?;
        self.send_word(bus::BUS_IDLE)?;
        Ok(())
    }

    pub fn untalk(&mut self) -> Result<()> {
        self.send_last_byte()?;
        self.command(cmd::UNTALK)?;
        self.send_word(bus::BUS_IDLE)?;
        Ok(())
    }

    /// Frame `LISTEN / OPEN-sa / name bytes / UNLISTEN`.
    pub fn open_file(&mut self, name: &Petscii, device: u8, secondary: u8) -> Result<()> {
        self.listen(device)?;
        self.secondary_command(cmd::open(secondary), false)?;
        self.begin_buffered();
        for &byte in name.as_bytes() {
            self.send_buffered(i16::from(byte))?;
        }
        self.send_last_byte()?;
        self.unlisten()
    }

    pub fn close_file(&mut self, device: u8, secondary: u8) -> Result<()> {
        self.listen(device)?;
        self.secondary_command(cmd::close(secondary), false)?;
        self.unlisten()
    }

    // ----- data -----

    /// Send a full payload on a data channel.  Returns the number of
    /// bytes that reached the channel, which is short when the remote
    /// listener cut the transmission with ATN.
    pub fn send_data(&mut self, data: &[u8], device: u8, secondary: u8) -> Result<usize> {
        self.listen(device)?;
        self.secondary_command(cmd::data(secondary), false)?;
        let sent = match self.send_to_bus(data) {
            Ok(sent) => sent,
            Err(e) => {
                let _ = self.unlisten();
                return Err(e);
            }
        };
        self.unlisten()?;
        Ok(sent)
    }

    /// Receive a full payload from a data channel.
    pub fn receive_data(&mut self, sink: &mut Vec<u8>, device: u8, secondary: u8) -> Result<usize> {
        self.talk(device)?;
        self.secondary_command(cmd::data(secondary), true)?;
        let received = match self.receive_from_bus(sink, Some(TIMEOUT)) {
            Ok(received) => received,
            Err(e) => {
                let _ = self.untalk();
                return Err(e);
            }
        };
        self.untalk()?;
        Ok(received)
    }

    /// Stream raw bytes with last-byte framing.  No LISTEN framing;
    /// used by the drive once it holds the talker role.
    pub fn send_to_bus(&mut self, data: &[u8]) -> Result<usize> {
        self.begin_buffered();
        let mut accepted = 0usize;
        let mut blocks = 0usize;
        let mut buffering = true;
        for &byte in data {
            let outcome = self.send_buffered(i16::from(byte))?;
            if !buffering {
                match outcome {
                    SendOutcome::Sent => accepted += 1,
                    SendOutcome::TalkInterrupted => {
                        self.progress_end(accepted, blocks);
                        return Ok(accepted);
                    }
                }
            }
            buffering = false;
            blocks = self.progress(accepted, blocks);
        }
        if !buffering {
            if let SendOutcome::Sent = self.send_last_byte()? {
                accepted += 1;
            }
        }
        self.progress_end(accepted, blocks);
        Ok(accepted)
    }

    /// Drain data until the end of the transmission.  On a real bus the
    /// engine posts `EOI` after the final byte; on a pipe the sender's
    /// `LAST_BYTE_NEXT` announces it instead.
    pub fn receive_from_bus(
        &mut self,
        sink: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let mut received = 0usize;
        let mut blocks = 0usize;
        loop {
            let word = match self.receive_word(timeout) {
                Ok(word) => word,
                Err(e) => {
                    self.progress_end(received, blocks);
                    return Err(e);
                }
            };
            if word == bus::EOI {
                break;
            }
            if word == bus::LAST_BYTE_NEXT {
                let last = self.receive_word(timeout)?;
                if last >= 0 {
                    sink.push(last as u8);
                    received += 1;
                }
                break;
            }
            if word == IecError::PrevByteHasError.code() {
                // Flagged but carried; keep going.
                warn!("error at byte {:#06X}", received);
                continue;
            }
            if word < 0 {
                self.progress_end(received, blocks);
                return Err(IecError::from_code(word));
            }
            sink.push(word as u8);
            received += 1;
            blocks = self.progress(received, blocks);
        }
        self.progress_end(received, blocks);
        Ok(received)
    }

    /// Fold the next under-ATN sequence into one bus command.  An
    /// unexpected command word caught by the caller can be re-injected
    /// through `injected` to restart the fold mid-sequence.
    pub fn receive_command(
        &mut self,
        device_number: u8,
        injected: Option<i16>,
    ) -> Result<(BusCommand, Option<u8>)> {
        let mut role = CommandRole::Idle;
        let mut command_device = None;
        let mut under_atn = injected.is_some();
        let mut secondary = None;
        let mut fallback = BusCommand::Unknown;

        let mut pending = injected;
        loop {
            let word = match pending.take() {
                Some(word) => word,
                None => match self.receive_word(None) {
                    Ok(word) => word,
                    Err(IecError::Signal) => return Ok((BusCommand::Exit, None)),
                    Err(e) => return Err(e),
                },
            };

            if word == bus::ASSERT_ATN {
                under_atn = true;
                continue;
            }
            if word == bus::DEASSERT_ATN {
                break;
            }
            if word == bus::TURNAROUND || word == bus::BUS_IDLE {
                // On a pipe these sentinels mark the ATN release that a
                // real bus would deliver as DEASSERT_ATN.
                break;
            }
            if IecError::is_error_code(word) {
                return Err(IecError::from_code(word));
            }
            if under_atn && word < 0 {
                let byte = (-word) as u8;
                if byte == cmd::UNLISTEN {
                    role = CommandRole::Idle;
                    fallback = BusCommand::Unlisten;
                } else if byte == cmd::UNTALK {
                    role = CommandRole::Idle;
                    fallback = BusCommand::Untalk;
                } else if cmd::is_talk(byte) {
                    role = CommandRole::Talk;
                    command_device = Some(cmd::device(byte));
                } else if cmd::is_listen(byte) {
                    role = CommandRole::Listen;
                    command_device = Some(cmd::device(byte));
                } else if cmd::is_secondary(byte) {
                    secondary = Some(byte);
                } else {
                    role = CommandRole::Idle;
                }
            }
        }

        let this_device = command_device == Some(device_number);
        let folded = match (role, secondary) {
            (CommandRole::Listen, Some(byte)) if cmd::is_open(byte) => {
                let sa = cmd::secondary(byte);
                if this_device {
                    (BusCommand::Open(sa), Some(sa))
                } else {
                    (BusCommand::OpenOther, None)
                }
            }
            (CommandRole::Listen, Some(byte)) if cmd::is_close(byte) => {
                let sa = cmd::secondary(byte);
                if this_device {
                    (BusCommand::Close(sa), Some(sa))
                } else {
                    (BusCommand::CloseOther, None)
                }
            }
            (CommandRole::Listen, Some(byte)) if cmd::is_data(byte) => {
                let sa = cmd::secondary(byte);
                if this_device {
                    (BusCommand::Receive(sa), Some(sa))
                } else {
                    (BusCommand::ReceiveOther, None)
                }
            }
            (CommandRole::Talk, Some(byte)) if cmd::is_data(byte) => {
                let sa = cmd::secondary(byte);
                if this_device {
                    (BusCommand::Send(sa), Some(sa))
                } else {
                    (BusCommand::SendOther, None)
                }
            }
            _ => (fallback, None),
        };
        debug!("bus command {:?}", folded.0);
        Ok(folded)
    }

    // ----- high-level flows -----

    /// Load a file from a device into memory.
    pub fn load(&mut self, name: &Petscii, device: u8) -> Result<Vec<u8>> {
        check_target_device(device)?;
        if device == 1 {
            // Cassette is out of scope.
            return Ok(vec![]);
        }
        if name.is_empty() {
            return Err(IecError::MissingFilename);
        }

        println!("searching for {}", name);
        self.open_file(name, device, 0)?;
        println!("loading");
        let mut data = vec![];
        self.verbose = true;
        let result = self.receive_data(&mut data, device, 0);
        self.verbose = false;
        match result {
            Ok(_) => {}
            Err(e) => {
                let _ = self.close_file(device, 0);
                if e == IecError::ReadTimeout {
                    return Err(IecError::FileNotFound);
                }
                return Err(e);
            }
        }
        self.close_file(device, 0)?;
        Ok(data)
    }

    /// Save a memory buffer to a file on a device.
    pub fn save(&mut self, name: &Petscii, device: u8, data: &[u8]) -> Result<usize> {
        check_target_device(device)?;
        if device == 1 {
            return Ok(0);
        }
        if name.is_empty() {
            return Err(IecError::MissingFilename);
        }

        println!("saving {}", name);
        self.open_file(name, device, 1)?;
        self.verbose = true;
        let result = self.send_data(data, device, 1);
        self.verbose = false;
        let saved = match result {
            Ok(saved) => saved,
            Err(e) => {
                let _ = self.close_file(device, 1);
                if e == IecError::DeviceNotPresent {
                    return Err(IecError::SaveError);
                }
                return Err(e);
            }
        };
        self.close_file(device, 1)?;
        Ok(saved)
    }

    // ----- progress display -----

    fn progress(&self, bytes: usize, blocks: usize) -> usize {
        if self.verbose && bytes / 254 > blocks {
            print!("\r{} blocks", bytes / 254);
            use std::io::Write;
            let _ = ::std::io::stdout().flush();
            bytes / 254
        } else {
            blocks
        }
    }

    fn progress_end(&self, bytes: usize, blocks: usize) {
        if self.verbose && blocks > 0 {
            println!("\r{} blocks", (bytes + 253) / 254);
        }
    }
}

/// Host-side target device validation: low numbers are the keyboard,
/// cassette, and screen; serial devices end at 11.
pub(crate) fn check_target_device(device: u8) -> Result<()> {
    match device {
        0 | 2 | 3 => Err(IecError::IllegalDeviceNumber),
        d if d > 11 => Err(IecError::IllegalDeviceNumber),
        _ => Ok(()),
    }
}
