//! Byte-oriented channels carrying the 16-bit word stream.
//!
//! [`BusChannel`] runs the bus engine on a dedicated thread over a pair
//! of bounded FIFOs and exposes blocking reads and writes with the
//! engine's error-notification contract: after the engine posts an
//! error, the first read or write fails with the typed error, the next
//! read delivers the in-band error code word, and operation resumes
//! once [`crate::bus::CLEAR_ERROR`] is written through.
//!
//! [`PipeChannel`] presents the same interface over an in-process pipe
//! pair, used when the drive and host sides run in the same invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

use crate::bus::engine::{Engine, Notify, Shared, FIFO_SIZE};
use crate::bus::lines::LineDriver;
use crate::error::{IecError, Result};

/// Retry tick for blocking channel operations.
pub const TICK: Duration = Duration::from_millis(20);

/// Ambient timeout for blocking channel operations.
pub const TIMEOUT: Duration = Duration::from_millis(10_000);

/// Outcome of a successful `send`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The word was accepted into the write FIFO.
    Sent,
    /// ATN interrupted the transmission; the word was not queued and
    /// queued output is being discarded.  A completed read
    /// acknowledges the condition.
    TalkInterrupted,
}

/// A blocking channel of 16-bit words to and from the bus.
pub trait Channel: Send {
    fn send(&mut self, word: i16) -> Result<SendOutcome>;

    /// Receive the next word.  `None` blocks indefinitely (still
    /// interruptible by SIGINT).
    fn recv(&mut self, timeout: Option<Duration>) -> Result<i16>;

    /// True when this channel drives a real bus; identity sentinels are
    /// posted only to real bus devices.
    fn is_bus_device(&self) -> bool;

    /// Current engine state number, where an engine exists.  Debug
    /// surface only.
    fn engine_state(&self) -> Option<u8> {
        None
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_handler(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler that unblocks channel operations with a
/// `Signal` error.  Installed once, at serve-loop start.
pub fn install_interrupt_handler() -> Result<()> {
    let handler = sigint_handler as extern "C" fn(libc::c_int);
    unsafe {
        let mut action: libc::sigaction = ::std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGINT, &action, ::std::ptr::null_mut()) == -1 {
            return Err(IecError::GeneralError);
        }
    }
    Ok(())
}

/// True when a SIGINT arrived since the last take.
pub fn interrupt_pending() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Consume a pending SIGINT.
pub fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// A channel backed by a bus engine running on its own thread.
///
/// Exactly one client exists per engine by construction: the channel
/// owns both FIFO endpoints and the engine thread exits when they are
/// dropped.
pub struct BusChannel {
    read_rx: Receiver<i16>,
    write_tx: Option<SyncSender<i16>>,
    shared: Arc<Shared>,
    engine: Option<JoinHandle<()>>,
}

impl BusChannel {
    /// Start an engine on the given lines and open the channel to it.
    pub fn open<L>(lines: L) -> Result<BusChannel>
    where
        L: LineDriver + Send + 'static,
    {
        let shared = Arc::new(Shared::new());
        let engine_shared = shared.clone();
        let (read_tx, read_rx) = mpsc::sync_channel(FIFO_SIZE);
        let (write_tx, write_rx) = mpsc::sync_channel(FIFO_SIZE);
        let engine = thread::Builder::new()
            .name("iec-engine".to_string())
            .spawn(move || {
                let mut engine = Engine::new(lines, engine_shared, read_tx, write_rx);
                engine.start();
                reactor(&mut engine);
            })
            .map_err(|_| IecError::DriverNotPresent)?;
        debug!("bus channel opened");
        Ok(BusChannel {
            read_rx,
            write_tx: Some(write_tx),
            shared,
            engine: Some(engine),
        })
    }

    fn advance_after_read(&self) {
        if self.shared.notify() == Notify::SendCode {
            if self.shared.status() != crate::bus::OK {
                self.shared.set_notify(Notify::ClearingPending);
            } else {
                self.shared.set_notify(Notify::NoError);
            }
        }
        self.shared.talk_interrupted.store(false, Ordering::SeqCst);
    }
}

impl Channel for BusChannel {
    fn send(&mut self, word: i16) -> Result<SendOutcome> {
        if self.shared.notify() == Notify::ReturnEio {
            self.shared.set_notify(Notify::SendCode);
            return Err(IecError::from_code(self.shared.status()));
        }
        if self.shared.talk_interrupted.load(Ordering::SeqCst) {
            // ATN cut the transmission short; a read acknowledges.
            return Ok(SendOutcome::TalkInterrupted);
        }
        let write_tx = match &self.write_tx {
            Some(write_tx) => write_tx,
            None => return Err(IecError::IllegalState),
        };
        let deadline = Instant::now() + TIMEOUT;
        let mut word = word;
        loop {
            if take_interrupt() {
                return Err(IecError::Signal);
            }
            match write_tx.try_send(word) {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(TrySendError::Full(w)) => word = w,
                Err(TrySendError::Disconnected(_)) => return Err(IecError::DriverNotPresent),
            }
            if self.shared.talk_interrupted.load(Ordering::SeqCst) {
                return Ok(SendOutcome::TalkInterrupted);
            }
            if Instant::now() >= deadline {
                return Err(IecError::WriteTimeout);
            }
            thread::sleep(TICK);
        }
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<i16> {
        if self.shared.notify() == Notify::ReturnEio {
            self.shared.set_notify(Notify::SendCode);
            return Err(IecError::from_code(self.shared.status()));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if take_interrupt() {
                return Err(IecError::Signal);
            }
            match self.read_rx.recv_timeout(TICK) {
                Ok(word) => {
                    self.advance_after_read();
                    return Ok(word);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(IecError::ReadTimeout);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(IecError::DriverNotPresent),
            }
        }
    }

    fn is_bus_device(&self) -> bool {
        true
    }

    fn engine_state(&self) -> Option<u8> {
        Some(self.shared.state.load(Ordering::SeqCst))
    }
}

impl Drop for BusChannel {
    fn drop(&mut self) {
        // Closing the write FIFO stops the engine thread.
        self.write_tx = None;
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
        debug!("bus channel closed");
    }
}

/// The engine's event loop.  Hot waits (a CLK or DATA transition due
/// within a frame) are polled tightly; everything else ticks at
/// scheduler granularity, which the protocol's millisecond-tolerant
/// phases absorb.
fn reactor<L: LineDriver>(engine: &mut Engine<L>) {
    loop {
        match engine.poll_event() {
            Some(event) => engine.machine(event),
            None => {
                if engine.client_disconnected() {
                    break;
                }
                if engine.hot() {
                    thread::yield_now();
                } else {
                    thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }
}

/// One end of an in-process word pipe.  When a drive and a host run in
/// the same invocation, each side holds one end; the raw sentinel
/// stream of the writing side is delivered verbatim to the reader.
pub struct PipeChannel {
    tx: mpsc::Sender<i16>,
    rx: Receiver<i16>,
}

/// Create a connected pair of pipe channels.
pub fn pipe_pair() -> (PipeChannel, PipeChannel) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    (
        PipeChannel { tx: a_tx, rx: b_rx },
        PipeChannel { tx: b_tx, rx: a_rx },
    )
}

impl Channel for PipeChannel {
    fn send(&mut self, word: i16) -> Result<SendOutcome> {
        self.tx
            .send(word)
            .map(|_| SendOutcome::Sent)
            .map_err(|_| IecError::DeviceNotPresent)
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<i16> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if take_interrupt() {
                return Err(IecError::Signal);
            }
            match self.rx.recv_timeout(TICK) {
                Ok(word) => return Ok(word),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(IecError::ReadTimeout);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(IecError::DeviceNotPresent),
            }
        }
    }

    fn is_bus_device(&self) -> bool {
        false
    }
}
