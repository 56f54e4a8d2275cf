//! This is a Rust library for speaking the Commodore IEC serial bus —
//! the three-wire bus connecting a Commodore 64 to its 1541 disk drive
//! — from a machine with general-purpose I/O pins, together with the
//! pieces needed to be useful on either end of the cable.
//!
//! Features:
//!
//! * A bit-level bus engine implementing the IEC three-wire handshake,
//!   EOI signalling, talker/listener turnaround, and command reception
//!   under ATN, with microsecond timing on GPIO lines.
//! * A byte/sentinel channel abstraction over the engine, also
//!   available as an in-process pipe pair for running both bus ends in
//!   one invocation.
//! * A transport layer framing LISTEN/TALK/OPEN/CLOSE/DATA
//!   transactions for host and drive alike.
//! * 1541 drive emulation serving a local directory or a D64 disk
//!   image, including DOS command parsing on the command channel and
//!   the `NN, MESSAGE,TT,SS` status line.
//! * D64 disk image access: BAM allocation with the CBM DOS
//!   interleave, directory traversal, wildcard name matching, and
//!   whole-file read and write.
//! * Host (computer) flows: load, save, DOS commands, and the error
//!   channel.
//! * Directory listings synthesized as C64 BASIC programs, for disk
//!   images and for served host directories.
//! * Conversion between PETSCII and ASCII.
//!
//! Current shortcomings:
//!
//! * Only the 35-track D64 variants (with or without an error table)
//!   are recognized.
//! * Fastloader protocols are not implemented; transfers run at the
//!   stock KERNAL pace.
//! * Most DOS commands beyond NEW, SCRATCH, INITIALIZE, and VALIDATE
//!   are recognized but answer OK without effect.
//! * Cassette and printer devices are out of scope.
//!
//! # Example
//!
//! Serving a disk image to a real C64 over the GPIO bus adapter:
//!
//! ```no_run
//! use iec::bus::channel::BusChannel;
//! use iec::bus::lines::{GpioLines, DEFAULT_PINS};
//! use iec::bus::transport::Transport;
//! use iec::drive::Drive;
//!
//! # fn main() -> iec::Result<()> {
//! let lines = GpioLines::open(&DEFAULT_PINS)?;
//! let channel = BusChannel::open(lines)?;
//! let transport = Transport::new(Box::new(channel));
//! let mut drive = Drive::new(transport, 8)?;
//! drive.serve("games.d64")?;
//! # Ok(())
//! # }
//! ```
//!
//! Both bus ends can also run in the same process over a pipe pair,
//! which is how the `cbus` binary executes a host command against a
//! served disk image:
//!
//! ```
//! use iec::bus::channel::pipe_pair;
//! use iec::bus::transport::Transport;
//!
//! let (host_end, drive_end) = pipe_pair();
//! let host = Transport::new(Box::new(host_end));
//! let drive = Transport::new(Box::new(drive_end));
//! // Hand one end to a Drive on its own thread, keep the other for a
//! // Host.
//! ```
//!
//! # Design of the bus stack
//!
//! The bus support is layered:
//!
//! 1. `bus::lines` drives and samples the ATN, CLK, and DATA lines.
//! 2. `bus::engine` is a reactive state machine converting between
//!    line transitions and a stream of 16-bit words: values 0..=255
//!    are data, negative values carry bus phase and errors in-band.
//! 3. `bus::channel` exposes the stream as a blocking channel with the
//!    engine on its own thread, or as an in-process pipe pair.
//! 4. `bus::transport` frames transactions and hides the last-byte
//!    look-ahead that the EOI handshake requires.
//! 5. `drive` and `host` implement the two bus roles on top.
//!
//! Everything above the engine is ordinary blocking code; the only
//! timing-critical component is the engine itself, which owns the
//! lines while its channel is open.

pub mod bus;
pub mod disk;
pub mod drive;
pub mod host;
pub mod listing;

mod error;
mod petscii;

pub use crate::error::{IecError, Result};
pub use crate::petscii::Petscii;
