//! Physical access to the three IEC bus lines.
//!
//! Lines are open-collector: a line reads high only when nobody pulls it
//! low.  Levels here are the logical bus voltages; an inverting bus
//! adapter is compensated for behind the `inverted-output` feature.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{IecError, Result};

/// Set when the external bus buffer inverts the output stages.
const INVERTED_OUTPUT: bool = cfg!(feature = "inverted-output");

/// Time for a driven line to stabilize on the corresponding input.
const SETTLE_US: u32 = 3;

/// Logical level of a bus line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Lo,
    Hi,
}

impl Level {
    pub fn from_bool(hi: bool) -> Level {
        if hi {
            Level::Hi
        } else {
            Level::Lo
        }
    }

    pub fn is_hi(self) -> bool {
        self == Level::Hi
    }

    /// The data-line level encoding one transmitted bit (LSB first).
    pub fn from_bit(bit: u8) -> Level {
        Level::from_bool(bit != 0)
    }
}

impl ::std::ops::Not for Level {
    type Output = Level;
    fn not(self) -> Level {
        match self {
            Level::Lo => Level::Hi,
            Level::Hi => Level::Lo,
        }
    }
}

/// Access to the six GPIO pins (three in, three out) and the
/// microsecond clock that the bus engine runs on.
///
/// Every `set_*` implementation settles at least 3 µs before returning
/// so that the corresponding input pin reflects the new level.
pub trait LineDriver {
    fn set_atn(&mut self, level: Level);
    fn set_clk(&mut self, level: Level);
    fn set_data(&mut self, level: Level);

    fn atn(&self) -> Level;
    fn clk(&self) -> Level;
    fn data(&self) -> Level;

    /// Free-running microsecond counter.  Wraps; only differences are
    /// meaningful.
    fn micros(&self) -> u32;

    /// Busy-wait for the given number of microseconds.
    fn delay_us(&self, us: u32);

    /// Release every line.
    fn release_bus(&mut self) {
        self.set_clk(Level::Hi);
        self.set_data(Level::Hi);
    }

    /// Release every line including ATN.
    fn idle_state(&mut self) {
        self.set_atn(Level::Hi);
        self.release_bus();
    }

    /// True when no participant is driving any line.
    fn bus_is_idle(&self) -> bool {
        self.atn() == Level::Hi && self.clk() == Level::Hi && self.data() == Level::Hi
    }
}

/// GPIO pin assignments for a bus adapter.
#[derive(Clone, Copy, Debug)]
pub struct GpioPins {
    pub atn_in: u32,
    pub clk_in: u32,
    pub data_in: u32,
    pub atn_out: u32,
    pub clk_out: u32,
    pub data_out: u32,
}

/// Default wiring of the bus adapter.
pub const DEFAULT_PINS: GpioPins = GpioPins {
    atn_in: 17,
    clk_in: 18,
    data_in: 27,
    atn_out: 22,
    clk_out: 23,
    data_out: 24,
};

/// Bus lines driven through the sysfs GPIO interface.
pub struct GpioLines {
    atn_in: File,
    clk_in: File,
    data_in: File,
    atn_out: File,
    clk_out: File,
    data_out: File,
    epoch: Instant,
}

impl GpioLines {
    /// Export and configure the pins, then open their value files.  All
    /// outputs start released (logical high).
    pub fn open(pins: &GpioPins) -> Result<GpioLines> {
        let atn_in = Self::open_pin(pins.atn_in, false)?;
        let clk_in = Self::open_pin(pins.clk_in, false)?;
        let data_in = Self::open_pin(pins.data_in, false)?;
        let atn_out = Self::open_pin(pins.atn_out, true)?;
        let clk_out = Self::open_pin(pins.clk_out, true)?;
        let data_out = Self::open_pin(pins.data_out, true)?;

        let mut lines = GpioLines {
            atn_in,
            clk_in,
            data_in,
            atn_out,
            clk_out,
            data_out,
            epoch: Instant::now(),
        };
        lines.idle_state();
        Ok(lines)
    }

    fn open_pin(pin: u32, output: bool) -> Result<File> {
        let gpio_dir = format!("/sys/class/gpio/gpio{}", pin);
        if !Path::new(&gpio_dir).exists() {
            let mut export = OpenOptions::new()
                .write(true)
                .open("/sys/class/gpio/export")
                .map_err(|_| IecError::DriverNotPresent)?;
            export
                .write_all(format!("{}", pin).as_bytes())
                .map_err(|_| IecError::DriverNotPresent)?;
        }
        let mut direction = OpenOptions::new()
            .write(true)
            .open(format!("{}/direction", gpio_dir))
            .map_err(|_| IecError::DriverNotPresent)?;
        direction
            .write_all(if output { b"out" } else { b"in" })
            .map_err(|_| IecError::DriverNotPresent)?;
        OpenOptions::new()
            .read(!output)
            .write(output)
            .open(format!("{}/value", gpio_dir))
            .map_err(|_| IecError::DriverNotPresent)
    }

    fn write_level(file: &File, level: Level) {
        let driven = if INVERTED_OUTPUT { !level } else { level };
        let byte: &[u8] = if driven.is_hi() { b"1" } else { b"0" };
        let mut file = file;
        let _ = file.write_all(byte);
    }

    fn read_level(file: &File) -> Level {
        let mut file = file;
        let mut byte = [0u8; 1];
        if file.seek(SeekFrom::Start(0)).is_err() {
            return Level::Hi;
        }
        match file.read(&mut byte) {
            Ok(1) => Level::from_bool(byte[0] == b'1'),
            _ => Level::Hi,
        }
    }
}

impl LineDriver for GpioLines {
    fn set_atn(&mut self, level: Level) {
        Self::write_level(&self.atn_out, level);
        self.delay_us(SETTLE_US);
    }

    fn set_clk(&mut self, level: Level) {
        Self::write_level(&self.clk_out, level);
        self.delay_us(SETTLE_US);
    }

    fn set_data(&mut self, level: Level) {
        Self::write_level(&self.data_out, level);
        self.delay_us(SETTLE_US);
    }

    fn atn(&self) -> Level {
        Self::read_level(&self.atn_in)
    }

    fn clk(&self) -> Level {
        Self::read_level(&self.clk_in)
    }

    fn data(&self) -> Level {
        Self::read_level(&self.data_in)
    }

    fn micros(&self) -> u32 {
        let elapsed = self.epoch.elapsed();
        (elapsed.as_secs() as u32)
            .wrapping_mul(1_000_000)
            .wrapping_add(elapsed.subsec_micros())
    }

    fn delay_us(&self, us: u32) {
        spin_delay(us);
    }
}

/// Spin until the given number of microseconds has passed.  The waits on
/// the bus are far below scheduler resolution, so sleeping is not an
/// option.
pub(crate) fn spin_delay(us: u32) {
    let deadline = Instant::now() + Duration::from_micros(u64::from(us));
    while Instant::now() < deadline {}
}

const LINE_ATN: usize = 0;
const LINE_CLK: usize = 1;
const LINE_DATA: usize = 2;

#[derive(Default)]
struct WireState {
    // pulls[line][side]: true when that side pulls the line low
    pulls: [[bool; 2]; 3],
}

impl WireState {
    fn level(&self, line: usize) -> Level {
        Level::from_bool(!self.pulls[line][0] && !self.pulls[line][1])
    }
}

/// One side of an in-process open-collector bus.  Two taps share the
/// line state; each line reads high only when neither tap pulls it low.
/// Useful for loopback tests and simulations.
pub struct WireTap {
    state: Arc<Mutex<WireState>>,
    side: usize,
    epoch: Instant,
}

impl WireTap {
    /// Create a connected pair of taps.
    pub fn pair() -> (WireTap, WireTap) {
        let state = Arc::new(Mutex::new(WireState::default()));
        let epoch = Instant::now();
        (
            WireTap {
                state: state.clone(),
                side: 0,
                epoch,
            },
            WireTap {
                state,
                side: 1,
                epoch,
            },
        )
    }

    fn pull(&self, line: usize, level: Level) {
        let mut state = self.state.lock().unwrap();
        state.pulls[line][self.side] = level == Level::Lo;
    }

    fn level(&self, line: usize) -> Level {
        self.state.lock().unwrap().level(line)
    }
}

impl LineDriver for WireTap {
    fn set_atn(&mut self, level: Level) {
        self.pull(LINE_ATN, level);
    }

    fn set_clk(&mut self, level: Level) {
        self.pull(LINE_CLK, level);
    }

    fn set_data(&mut self, level: Level) {
        self.pull(LINE_DATA, level);
    }

    fn atn(&self) -> Level {
        self.level(LINE_ATN)
    }

    fn clk(&self) -> Level {
        self.level(LINE_CLK)
    }

    fn data(&self) -> Level {
        self.level(LINE_DATA)
    }

    fn micros(&self) -> u32 {
        let elapsed = self.epoch.elapsed();
        (elapsed.as_secs() as u32)
            .wrapping_mul(1_000_000)
            .wrapping_add(elapsed.subsec_micros())
    }

    fn delay_us(&self, us: u32) {
        spin_delay(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_lines_start_high() {
        let (host, drive) = WireTap::pair();
        assert!(host.bus_is_idle());
        assert!(drive.bus_is_idle());
    }

    #[test]
    fn test_wire_open_collector() {
        let (mut host, mut drive) = WireTap::pair();
        host.set_atn(Level::Lo);
        assert_eq!(host.atn(), Level::Lo);
        assert_eq!(drive.atn(), Level::Lo);
        assert_eq!(drive.clk(), Level::Hi);

        // Both pulling: releasing one side is not enough.
        drive.set_atn(Level::Lo);
        host.set_atn(Level::Hi);
        assert_eq!(host.atn(), Level::Lo);
        drive.set_atn(Level::Hi);
        assert_eq!(host.atn(), Level::Hi);
    }

    #[test]
    fn test_level_not() {
        assert_eq!(!Level::Lo, Level::Hi);
        assert_eq!(!Level::Hi, Level::Lo);
    }
}
