//! The IEC bus engine: a timed state machine that converts between a
//! stream of bytes/sentinels and transitions on the three bus lines.
//!
//! The engine is single-threaded and reactive.  [`Engine::machine`] runs
//! the state machine until the current state asks to wait for an outside
//! event; [`Engine::poll_event`] then produces the next event by
//! comparing armed line waits against the current levels, checking the
//! armed timeout, and checking the user FIFO.  Because waits are
//! satisfied by *level* comparison rather than edge detection, a
//! transition that slips past a poll is picked up on the next one; this
//! is the recovery mechanism that keeps the engine from deadlocking on a
//! missed edge.
//!
//! Timing inside a frame (bit clocking, handshake windows) is done with
//! busy-wait helpers on the line driver's microsecond counter.  Each
//! helper returns `true` on expiry so a state can demote itself to an
//! event-based wait when the remote side is slow.
//!
//! See the C64 and 1541 ROM listings for the protocol reference, e.g.
//! <http://www.pagetable.com/c64rom/c64rom_en.html>.

use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::bus::lines::{Level, LineDriver};
use crate::bus::{self, cmd, Identity};
use crate::error::IecError;

/// Capacity of the read and write FIFOs between engine and channel.
pub const FIFO_SIZE: usize = 1024;

/// Events consumed by the state machine.  Line events carry the new
/// level; the timeout event carries the tag given when it was armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Atn(Level),
    Clk(Level),
    Data(Level),
    Timeout(i32),
    User,
    Tasklet,
    None,
}

/// Timeout tags: the awaited ATN level for the re-check timer, or
/// nothing in particular.
const TAG_LEVEL_LO: i32 = 0;
const TAG_LEVEL_HI: i32 = 1;
const TAG_NONE: i32 = -1;

/// States of the bus engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    WaitAtnAssert,
    WaitAtnDeassert,
    CheckAtn,
    NextCmdByte,
    ReceiveByte,
    RemoteTalkerReadyToSend,
    ListenerReadyForData,
    ProcessUserData,
    SendNextByte,
    SendByte,
    RemoteListenerReadyForData,
    RemoteListenerDataAccepted,
    EoiHandshake,
    EoiHandshakeEnd,
    EoiAtnAsserted,
    SendCommand,
    Reset,
    Error,
}

impl State {
    /// Numeric state id exposed on the debug surface.
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Bus role while a transaction is in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Idle,
    Listen,
    Talk,
}

/// EOI handshake sub-state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Eoi {
    No,
    Send,
    Sent,
    Received,
}

/// Error notification sub-machine, shared with the channel.  The
/// transitions are driven by user reads and writes:
/// no-error -> return-EIO -> send-code -> clearing-pending -> no-error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Notify {
    NoError = 0,
    ReturnEio = 1,
    SendCode = 2,
    ClearingPending = 3,
}

impl Notify {
    pub fn from_u8(value: u8) -> Notify {
        match value {
            1 => Notify::ReturnEio,
            2 => Notify::SendCode,
            3 => Notify::ClearingPending,
            _ => Notify::NoError,
        }
    }
}

/// State shared between the engine thread and the user-side channel.
pub struct Shared {
    /// Error notification sub-state (a `Notify` discriminant).
    pub notify: AtomicU8,
    /// Last posted error code, `bus::OK` when clear.
    pub status: AtomicI16,
    /// Set when ATN interrupted a drive-role transmission; cleared by
    /// the next completed user read.
    pub talk_interrupted: AtomicBool,
    /// Current state number, for the debug surface only.
    pub state: AtomicU8,
}

impl Shared {
    pub fn new() -> Shared {
        Shared {
            notify: AtomicU8::new(Notify::NoError as u8),
            status: AtomicI16::new(bus::OK),
            talk_interrupted: AtomicBool::new(false),
            state: AtomicU8::new(State::Reset.number()),
        }
    }

    pub fn notify(&self) -> Notify {
        Notify::from_u8(self.notify.load(Ordering::SeqCst))
    }

    pub fn set_notify(&self, notify: Notify) {
        self.notify.store(notify as u8, Ordering::SeqCst);
    }

    pub fn status(&self) -> i16 {
        self.status.load(Ordering::SeqCst)
    }
}

impl Default for Shared {
    fn default() -> Shared {
        Shared::new()
    }
}

#[derive(Clone, Copy)]
struct Wait {
    level: Level,
    #[allow(dead_code)]
    check_missed: bool,
}

#[derive(Default)]
struct WaitSet {
    atn: Option<Wait>,
    clk: Option<Wait>,
    data: Option<Wait>,
}

#[derive(Clone, Copy)]
struct Timeout {
    start: u32,
    usecs: u32,
    value: i32,
}

/// Bit cell timing in microseconds.  The talker timing differs between
/// the two identities.
struct BitTiming {
    data_hi: u32,
    data_settle: u32,
    data_valid: u32,
}

static COMPUTER_TIMING: BitTiming = BitTiming {
    data_hi: 50,
    data_settle: 25,
    data_valid: 25,
};

static DRIVE_TIMING: BitTiming = BitTiming {
    data_hi: 90,
    data_settle: 25,
    data_valid: 75,
};

/// The bus engine.  Owns the line driver; posts received words to the
/// read FIFO and consumes outgoing words from the write FIFO.
pub struct Engine<L: LineDriver> {
    lines: L,
    shared: Arc<Shared>,
    read_tx: SyncSender<i16>,
    write_rx: Receiver<i16>,
    pending: Option<i16>,
    identity: Identity,
    role: Role,
    state: State,
    under_atn: bool,
    eoi: Eoi,
    bit: u8,
    byte: i16,
    waits: WaitSet,
    timeout: Option<Timeout>,
    tasklet_pending: bool,
}

/// What the state machine wants after a step.
enum Flow {
    Continue,
    Wait,
}

impl<L: LineDriver> Engine<L> {
    pub fn new(
        lines: L,
        shared: Arc<Shared>,
        read_tx: SyncSender<i16>,
        write_rx: Receiver<i16>,
    ) -> Engine<L> {
        Engine {
            lines,
            shared,
            read_tx,
            write_rx,
            pending: None,
            identity: Identity::Computer,
            role: Role::Idle,
            state: State::Reset,
            under_atn: false,
            eoi: Eoi::No,
            bit: 0,
            byte: 0,
            waits: WaitSet::default(),
            timeout: None,
            tasklet_pending: false,
        }
    }

    /// Reset and run the machine once, as done when the device is
    /// opened.  Warns when the bus lines are not all released.
    pub fn start(&mut self) {
        self.state = State::Reset;
        self.machine(Event::User);
        if !self.lines.bus_is_idle() {
            warn!("IEC bus is not in idle state");
        }
    }

    /// Produce the next pending event, if any.  Non-blocking.
    pub fn poll_event(&mut self) -> Option<Event> {
        if self.tasklet_pending {
            self.tasklet_pending = false;
            return Some(Event::Tasklet);
        }

        // Armed line waits are satisfied by level comparison, which also
        // recovers transitions that happened between polls.
        if let Some(wait) = self.waits.atn {
            if self.lines.atn() == wait.level {
                self.cancel_waits();
                return Some(Event::Atn(wait.level));
            }
        }
        if let Some(wait) = self.waits.clk {
            if self.lines.clk() == wait.level {
                self.cancel_waits();
                return Some(Event::Clk(wait.level));
            }
        }
        if let Some(wait) = self.waits.data {
            if self.lines.data() == wait.level {
                self.cancel_waits();
                return Some(Event::Data(wait.level));
            }
        }

        if let Some(timeout) = self.timeout {
            if self.lines.micros().wrapping_sub(timeout.start) >= timeout.usecs {
                self.timeout = None;
                return Some(Event::Timeout(timeout.value));
            }
        }

        // User data wakes the machine only in the states that consume it.
        if self.state == State::ProcessUserData || self.state == State::CheckAtn {
            if self.pending.is_none() {
                if let Ok(word) = self.write_rx.try_recv() {
                    self.pending = Some(word);
                }
            }
            if self.pending.is_some() {
                return Some(Event::User);
            }
        }

        None
    }

    /// True while the engine is inside a frame, waiting on a CLK or
    /// DATA transition that the remote side produces with microsecond
    /// pacing.  The reactor polls hot waits tightly and sleeps between
    /// polls otherwise (ATN and user waits have millisecond tolerances).
    pub fn hot(&self) -> bool {
        self.waits.clk.is_some() || self.waits.data.is_some()
    }

    /// True once the user side has dropped its end of the write FIFO.
    pub fn client_disconnected(&mut self) -> bool {
        if self.pending.is_some() {
            return false;
        }
        match self.write_rx.try_recv() {
            Ok(word) => {
                self.pending = Some(word);
                false
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => true,
        }
    }

    /// Run the state machine on one outside event.  The machine keeps
    /// stepping while states chain without waiting; the outside event is
    /// given to the first step only.
    pub fn machine(&mut self, event: Event) {
        trace!("event {:?}", event);
        let mut event = event;
        loop {
            trace!("state {:?}", self.state);
            let flow = self.step(event);
            event = Event::None;
            self.shared.state.store(self.state.number(), Ordering::SeqCst);
            if let Flow::Wait = flow {
                break;
            }
        }
    }

    fn step(&mut self, event: Event) -> Flow {
        let (next, wait) = match self.state {
            State::Idle => {
                if self.identity == Identity::Computer
                    || (self.role == Role::Talk && self.eoi != Eoi::Sent)
                {
                    (State::ProcessUserData, true)
                } else {
                    (State::WaitAtnAssert, false)
                }
            }

            State::WaitAtnAssert => {
                let wait = self.wait_atn(Level::Lo, true);
                self.set_timeout(500, TAG_LEVEL_LO);
                (State::CheckAtn, wait)
            }

            State::WaitAtnDeassert => {
                let wait = self.wait_atn(Level::Hi, true);
                self.set_timeout(500, TAG_LEVEL_HI);
                (State::CheckAtn, wait)
            }

            State::CheckAtn => match event {
                Event::Timeout(tag) => {
                    let awaited = if tag == TAG_LEVEL_LO { Level::Lo } else { Level::Hi };
                    if awaited == self.lines.atn() {
                        // The ATN edge slipped by; synthesize the event.
                        debug!("ATN timeout {:?}", awaited);
                        self.waits.atn = None;
                        self.next_cmd_byte(Event::Atn(awaited))
                    } else {
                        (State::CheckAtn, true)
                    }
                }
                Event::User => (State::ProcessUserData, false),
                _ => {
                    self.cancel_timeout();
                    self.next_cmd_byte(event)
                }
            },

            State::NextCmdByte => self.next_cmd_byte(event),

            State::ReceiveByte => {
                self.eoi = Eoi::No;
                self.bit = 8;
                self.byte = 0;
                self.lines.set_clk(Level::Hi);
                let wait = self.wait_clk(Level::Hi);
                (State::RemoteTalkerReadyToSend, wait)
            }

            State::RemoteTalkerReadyToSend => {
                // The next byte may be a data byte after OPEN or a
                // command byte after CLOSE; ATN tells them apart.
                if !self.under_atn && self.lines.atn() == Level::Lo {
                    self.enter_atn();
                }
                self.lines.set_data(Level::Hi); // listener ready-for-data
                if self.wait_data_busy(Level::Hi, 100) {
                    // Another very slow listener on the bus, exit busywait
                    let wait = self.wait_data(Level::Hi);
                    (State::ListenerReadyForData, wait)
                } else {
                    self.listener_ready_for_data()
                }
            }

            State::ListenerReadyForData => self.listener_ready_for_data(),

            State::ProcessUserData | State::SendNextByte => self.process_user_data(),

            State::SendByte => self.send_byte(),

            State::RemoteListenerReadyForData => {
                self.lines.delay_us(80); // Tne (non-EOI response to RFD)
                // The listener may abort by asserting ATN.
                if self.identity.is_drive() && self.lines.atn() == Level::Lo {
                    (State::EoiAtnAsserted, false)
                } else {
                    self.clock_byte_out()
                }
            }

            State::RemoteListenerDataAccepted => self.remote_listener_data_accepted(event),

            State::EoiHandshake => {
                // EOI response time min 200us typ 250us
                if self.wait_data_busy(Level::Lo, 300) {
                    let wait = self.wait_data(Level::Lo);
                    (State::EoiHandshakeEnd, wait)
                } else {
                    self.eoi_handshake_end()
                }
            }

            State::EoiHandshakeEnd => self.eoi_handshake_end(),

            State::EoiAtnAsserted => {
                // ATN went low while talking in drive role.  The user's
                // blocked write must see the partial transfer.
                self.shared.talk_interrupted.store(true, Ordering::SeqCst);
                self.drain_write_fifo();
                (State::CheckAtn, false)
            }

            State::SendCommand => {
                let (next, wait) = self.user_command(self.byte);
                if bus::is_negated_command_byte(self.byte) {
                    self.byte = -self.byte; // make it a normal byte for sending
                }
                (next, wait)
            }

            State::Reset => {
                self.cancel_waits();
                self.cancel_timeout();
                self.lines.idle_state();
                self.shared.status.store(bus::OK, Ordering::SeqCst);
                if self.shared.notify() == Notify::ClearingPending {
                    self.shared.set_notify(Notify::NoError);
                }
                self.role = Role::Idle;
                self.under_atn = false;
                debug!("reset");
                (State::Idle, false)
            }

            State::Error => {
                // Post the error code to the user exactly once.
                if self.shared.notify() == Notify::NoError {
                    self.shared.set_notify(Notify::ReturnEio);
                    let status = self.shared.status();
                    debug!("error {:#X}", -i32::from(status));
                    self.post(status);
                }
                (State::ProcessUserData, false)
            }
        };

        self.state = next;
        if wait {
            Flow::Wait
        } else {
            Flow::Continue
        }
    }

    /// Decode the ATN situation and enter command reception, data
    /// reception, talk turnaround, or idle.  Used by `CheckAtn` and
    /// `NextCmdByte`.
    fn next_cmd_byte(&mut self, event: Event) -> (State, bool) {
        // Trust the event over the current level, since a missed ATN
        // edge may have been synthesized.
        let atn_asserted = match event {
            Event::Atn(level) => level == Level::Lo,
            Event::None => self.lines.atn() == Level::Lo,
            _ => false,
        };

        if atn_asserted {
            if !self.under_atn {
                self.enter_atn();
            }
            self.lines.set_clk(Level::Hi);
            self.lines.set_data(Level::Lo);
            self.eoi = Eoi::No;
            let wait = self.wait_clk(Level::Lo);
            (State::ReceiveByte, wait)
        } else {
            if self.under_atn {
                self.post(bus::DEASSERT_ATN);
                self.under_atn = false;
            }
            match self.role {
                Role::Listen => (State::ReceiveByte, false),
                Role::Talk => {
                    self.lines.set_data(Level::Hi); // talk-attention turnaround
                    self.lines.set_clk(Level::Lo);
                    self.lines.delay_us(80); // Tda (talk-attention ack. hold)
                    self.eoi = Eoi::No;
                    (State::SendNextByte, false)
                }
                Role::Idle => {
                    self.lines.release_bus();
                    (State::Idle, false)
                }
            }
        }
    }

    /// ATN assert housekeeping: post the sentinel and clear errors.
    fn enter_atn(&mut self) {
        self.post(bus::ASSERT_ATN);
        self.under_atn = true;
        if self.shared.notify() == Notify::ClearingPending {
            self.shared.set_notify(Notify::NoError);
        }
        self.shared.status.store(bus::OK, Ordering::SeqCst);
    }

    /// Receive one byte as listener: EOI detection, bit clocking, frame
    /// handshake, command decoding under ATN.
    fn listener_ready_for_data(&mut self) -> (State, bool) {
        if self.wait_clk_busy(Level::Lo, 250) {
            if self.eoi == Eoi::No {
                // First timeout announces EOI.
                self.lines.set_data(Level::Lo);
                self.eoi = Eoi::Received;
                self.lines.delay_us(60); // Tei (EOI response hold time)
                self.lines.set_data(Level::Hi); // ready-for-data again
                return (State::ListenerReadyForData, false);
            } else {
                // Second timeout is a hard error.
                self.lines.release_bus();
                self.set_status(IecError::ReadTimeout);
                return (State::Error, false);
            }
        }

        let mut bit_error = false;
        while self.bit > 0 {
            bit_error |= self.wait_clk_busy(Level::Hi, 1000);
            let data = if self.lines.data().is_hi() { 1 } else { 0 };
            self.byte = (self.byte >> 1) | (data << 7);
            self.bit -= 1;
            bit_error |= self.wait_clk_busy(Level::Lo, 1000);
        }

        self.lines.delay_us(40); // Tf (frame handshake)
        self.lines.set_data(Level::Lo); // listener data-accepted

        // Command bytes received under ATN travel to the user negated.
        let posted = if self.under_atn { -self.byte } else { self.byte };
        self.post(posted);
        if bit_error {
            warn!("reception bit error");
            self.post(IecError::PrevByteHasError.code());
        }

        if self.under_atn {
            return self.decode_command(self.byte as u8);
        }

        if self.eoi == Eoi::Received {
            self.post(bus::EOI);
            self.lines.delay_us(60); // Tfr (EOI acknowledge)
            self.lines.release_bus();
            (State::ProcessUserData, false)
        } else {
            (State::ReceiveByte, false)
        }
    }

    /// Act on a command byte received under ATN.
    fn decode_command(&mut self, byte: u8) -> (State, bool) {
        if byte == cmd::UNLISTEN || byte == cmd::UNTALK {
            self.role = Role::Idle;
            return (State::WaitAtnDeassert, false);
        }
        if let Some(device) = self.identity.device_number() {
            if byte == cmd::talk(device) {
                self.role = Role::Talk;
                return (State::NextCmdByte, false);
            }
            if byte == cmd::listen(device) {
                self.role = Role::Listen;
                return (State::NextCmdByte, false);
            }
        }
        if cmd::is_secondary(byte) {
            // DATA, CLOSE and OPEN are interpreted on the user side.
            (State::WaitAtnDeassert, false)
        } else {
            // The command addressed some other device.
            self.lines.release_bus();
            self.role = Role::Idle;
            (State::WaitAtnDeassert, false)
        }
    }

    /// Pop the next outgoing word and route it: sentinel, discarded
    /// data while in error, or a data byte to transmit.
    fn process_user_data(&mut self) -> (State, bool) {
        if self.identity.is_drive() && self.lines.atn() == Level::Lo {
            return (State::EoiAtnAsserted, false);
        }

        let word = match self.fifo_pop() {
            Some(word) => word,
            None => return (State::Idle, false),
        };
        self.byte = word;

        if word < 0 {
            debug!("-> {:#X}", -i32::from(word));
            return (State::SendCommand, false);
        }
        if self.shared.status() != bus::OK {
            // Wait for a command to clear the error.
            trace!("-> {:#04X} (discarded)", word);
            return (State::ProcessUserData, false);
        }
        trace!("-> {:#04X}", word);
        self.send_byte()
    }

    /// Begin transmitting the byte in `self.byte`: presence probe,
    /// ready-to-send, optional EOI handshake.
    fn send_byte(&mut self) -> (State, bool) {
        self.lines.set_data(Level::Hi);
        if self.lines.data() == Level::Hi {
            // Nobody holds DATA: there is no listener on the bus.
            self.lines.idle_state();
            self.set_status(IecError::DeviceNotPresent);
            return (State::Error, false);
        }
        self.lines.set_clk(Level::Hi); // talker ready-to-send
        let next = if self.eoi == Eoi::Send {
            State::EoiHandshake
        } else {
            State::RemoteListenerReadyForData
        };
        // Busywait longer than the EOI time.
        if self.wait_data_atn_busy(Level::Hi, 400) {
            // Slow remote-listener-ready-for-data, exit busywait.
            let mut wait = self.wait_data(Level::Hi);
            if self.identity.is_drive() {
                wait = wait && self.wait_atn(Level::Lo, false);
            }
            return (next, wait);
        }
        (next, false)
    }

    /// Clock the eight bits of `self.byte` onto the bus, then wait for
    /// the listener's frame acknowledgement.
    fn clock_byte_out(&mut self) -> (State, bool) {
        self.lines.set_clk(Level::Lo);
        self.bit = 8;
        while self.bit > 0 {
            if self.lines.data() == Level::Lo {
                // The listener reclaimed DATA mid-byte.
                self.lines.idle_state();
                self.set_status(IecError::WriteTimeout);
                return (State::Error, false);
            }
            let timing = self.bit_timing();
            self.lines.delay_us(timing.data_hi);
            self.lines.set_data(Level::from_bit((self.byte & 1) as u8)); // LSB first
            self.byte >>= 1;
            self.lines.delay_us(timing.data_settle);
            self.lines.set_clk(Level::Hi);
            self.lines.delay_us(timing.data_valid);
            self.lines.set_clk(Level::Lo);
            self.lines.set_data(Level::Hi);
            self.bit -= 1;
        }

        self.set_timeout(1000, TAG_NONE); // listener data-accepted timeout
        if self.wait_data_busy(Level::Lo, 100) {
            // Very slow listener-data-accepted, exit busywait.
            let wait = self.wait_data(Level::Lo);
            return (State::RemoteListenerDataAccepted, wait);
        }
        // Ensure no accidental timeout on the fallthrough.
        self.remote_listener_data_accepted(Event::None)
    }

    fn remote_listener_data_accepted(&mut self, event: Event) -> (State, bool) {
        if let Event::Timeout(_) = event {
            self.lines.idle_state();
            self.set_status(IecError::WriteTimeout);
            return (State::Error, false);
        }
        self.cancel_timeout();
        // A small breather after all the busywaits.
        self.tasklet_pending = true;
        (State::SendNextByte, true)
    }

    fn eoi_handshake_end(&mut self) -> (State, bool) {
        self.eoi = Eoi::Sent;
        if self.wait_data_busy(Level::Hi, 100) {
            // Slow remote-listener-ready-for-data, exit busywait.
            let wait = self.wait_data(Level::Hi);
            return (State::RemoteListenerReadyForData, wait);
        }
        (State::RemoteListenerReadyForData, false)
    }

    /// Act on a sentinel from the user.  Returns the next state and
    /// whether to wait.
    fn user_command(&mut self, word: i16) -> (State, bool) {
        let mut next = State::SendNextByte;
        let mut wait = false;

        if word == bus::ASSERT_ATN {
            trace!("ASSERT_ATN");
            if self.shared.notify() == Notify::ClearingPending {
                self.shared.set_notify(Notify::NoError);
            }
            self.shared.status.store(bus::OK, Ordering::SeqCst);
            self.lines.set_data(Level::Hi);
            self.lines.set_clk(Level::Hi);
            self.lines.set_atn(Level::Lo);
        } else if word == bus::DEASSERT_ATN {
            trace!("DEASSERT_ATN");
            self.lines.delay_us(20); // Tr (frame to release of ATN)
            self.lines.set_atn(Level::Hi);
            self.lines.delay_us(150); // Ttk (talk-attention release)
            // The bus standard gives min 20/typ 30/max 100, but the C64
            // is slower.
        } else if word == bus::BUS_IDLE {
            trace!("BUS_IDLE");
            self.lines.delay_us(20); // Tr
            self.lines.idle_state();
        } else if word == bus::LAST_BYTE_NEXT {
            trace!("LAST_BYTE_NEXT");
            self.eoi = Eoi::Send;
        } else if word == bus::TURNAROUND {
            trace!("TURNAROUND");
            // Talk-attention turnaround: hand the talker role over and
            // wait for the new talker's clock.
            self.lines.set_data(Level::Lo);
            self.lines.set_atn(Level::Hi);
            self.lines.set_clk(Level::Hi);
            wait = self.wait_clk(Level::Lo);
            next = State::ReceiveByte;
        } else if bus::is_negated_command_byte(word) {
            self.lines.set_clk(Level::Lo);
            self.lines.set_data(Level::Hi);
            self.set_timeout(1000, TAG_NONE);
            wait = true;
            next = State::SendByte;
        } else if word == bus::IDENTITY_COMPUTER || bus::is_identity_drive(word) {
            if word == bus::IDENTITY_COMPUTER {
                trace!("IDENTITY_COMPUTER");
                self.identity = Identity::Computer;
                next = State::Reset;
            } else {
                match Identity::drive(bus::identity_device(word)) {
                    Ok(identity) => {
                        trace!("IDENTITY_DRIVE({})", bus::identity_device(word));
                        self.identity = identity;
                        next = State::Reset;
                    }
                    Err(e) => {
                        self.set_status(e);
                        next = State::Error;
                    }
                }
            }
        } else if word == bus::CLEAR_ERROR {
            trace!("CLEAR_ERROR");
            next = State::Reset;
        } else {
            // Unknown command, ignore.
        }
        (next, wait)
    }

    // ----- helpers -----

    fn bit_timing(&self) -> &'static BitTiming {
        match self.identity {
            Identity::Computer => &COMPUTER_TIMING,
            Identity::Drive(_) => &DRIVE_TIMING,
        }
    }

    fn set_status(&mut self, error: IecError) {
        self.shared.status.store(error.code(), Ordering::SeqCst);
    }

    /// Post a word to the read FIFO.  A full FIFO drops the word with a
    /// warning, like the original's bounded kernel FIFO.
    fn post(&mut self, word: i16) {
        match self.read_tx.try_send(word) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("read FIFO full, dropping {:#X}", word),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn fifo_pop(&mut self) -> Option<i16> {
        if let Some(word) = self.pending.take() {
            return Some(word);
        }
        self.write_rx.try_recv().ok()
    }

    fn drain_write_fifo(&mut self) {
        self.pending = None;
        while self.write_rx.try_recv().is_ok() {}
    }

    // Arm an event wait for a line unless the awaited level is already
    // present; returns true when waiting is required.

    fn wait_atn(&mut self, level: Level, check_missed: bool) -> bool {
        if self.lines.atn() != level {
            self.waits.atn = Some(Wait { level, check_missed });
            true
        } else {
            false
        }
    }

    fn wait_clk(&mut self, level: Level) -> bool {
        if self.lines.clk() != level {
            self.waits.clk = Some(Wait { level, check_missed: false });
            true
        } else {
            false
        }
    }

    fn wait_data(&mut self, level: Level) -> bool {
        if self.lines.data() != level {
            self.waits.data = Some(Wait { level, check_missed: false });
            true
        } else {
            false
        }
    }

    fn cancel_waits(&mut self) {
        self.waits = WaitSet::default();
    }

    fn set_timeout(&mut self, usecs: u32, value: i32) {
        self.timeout = Some(Timeout {
            start: self.lines.micros(),
            usecs,
            value,
        });
    }

    fn cancel_timeout(&mut self) {
        self.timeout = None;
    }

    // Busy-wait helpers; true means the timeout expired.

    fn wait_clk_busy(&mut self, level: Level, timeout_us: u32) -> bool {
        let start = self.lines.micros();
        while self.lines.micros().wrapping_sub(start) < timeout_us {
            if self.lines.clk() == level {
                return false;
            }
            self.lines.delay_us(1);
        }
        true
    }

    fn wait_data_busy(&mut self, level: Level, timeout_us: u32) -> bool {
        let start = self.lines.micros();
        while self.lines.micros().wrapping_sub(start) < timeout_us {
            if self.lines.data() == level {
                return false;
            }
            self.lines.delay_us(1);
        }
        true
    }

    fn wait_data_atn_busy(&mut self, level: Level, timeout_us: u32) -> bool {
        let start = self.lines.micros();
        while self.lines.micros().wrapping_sub(start) < timeout_us {
            if self.lines.data() == level || self.lines.atn() == Level::Lo {
                return false;
            }
            self.lines.delay_us(1);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;

    // A deterministic peer on a simulated bus.  The peer executes a
    // script of primitive operations; it advances whenever the engine
    // touches the lines, and time is virtual (the microsecond counter
    // moves only in delay_us), so every test run is identical.

    #[derive(Clone, Copy, Debug)]
    enum Op {
        PullAtn(Level),
        PullClk(Level),
        PullData(Level),
        WaitData(Level),
        Delay(u32),
        // Send one byte as remote talker (optionally EOI-flagged).
        TalkByte(u8),
        TalkByteEoi(u8),
        // Receive one byte as remote listener into `received`.
        ListenByte,
        // Do nothing forever.
        Stall,
    }

    const LINE_ATN: usize = 0;
    const LINE_CLK: usize = 1;
    const LINE_DATA: usize = 2;

    // Between-bytes gap a real talker leaves before ready-to-send.
    const TBB_US: u32 = 100;

    struct Sim {
        now: u32,
        engine_pulls: [bool; 3],
        peer_pulls: [bool; 3],
        script: Vec<Op>,
        op: usize,
        phase: u32,
        at: u32,
        bit: u8,
        shift: u8,
        received: Vec<u8>,
        eoi_seen: bool,
    }

    impl Sim {
        fn new(script: Vec<Op>) -> Sim {
            Sim {
                now: 0,
                engine_pulls: [false; 3],
                peer_pulls: [false; 3],
                script,
                op: 0,
                phase: 0,
                at: 0,
                bit: 0,
                shift: 0,
                received: vec![],
                eoi_seen: false,
            }
        }

        fn level(&self, line: usize) -> Level {
            Level::from_bool(!self.engine_pulls[line] && !self.peer_pulls[line])
        }

        fn pull(&mut self, line: usize, level: Level) {
            self.peer_pulls[line] = level == Level::Lo;
        }

        fn next_op(&mut self) {
            self.op += 1;
            self.phase = 0;
        }

        // Run the peer until it blocks on a condition or a deadline.
        fn advance(&mut self) {
            loop {
                let op = match self.script.get(self.op) {
                    Some(op) => *op,
                    None => return,
                };
                let progressed = match op {
                    Op::PullAtn(level) => {
                        self.pull(LINE_ATN, level);
                        self.next_op();
                        true
                    }
                    Op::PullClk(level) => {
                        self.pull(LINE_CLK, level);
                        self.next_op();
                        true
                    }
                    Op::PullData(level) => {
                        self.pull(LINE_DATA, level);
                        self.next_op();
                        true
                    }
                    Op::WaitData(level) => {
                        if self.level(LINE_DATA) == level {
                            self.next_op();
                            true
                        } else {
                            false
                        }
                    }
                    Op::Delay(us) => {
                        if self.phase == 0 {
                            self.at = self.now + us;
                            self.phase = 1;
                            true
                        } else if self.now >= self.at {
                            self.next_op();
                            true
                        } else {
                            false
                        }
                    }
                    Op::TalkByte(byte) => self.talk_byte(byte, false),
                    Op::TalkByteEoi(byte) => self.talk_byte(byte, true),
                    Op::ListenByte => self.listen_byte(),
                    Op::Stall => false,
                };
                if !progressed {
                    return;
                }
            }
        }

        // The talker side of one byte frame.  The peer holds CLK low
        // before and after.
        fn talk_byte(&mut self, byte: u8, eoi: bool) -> bool {
            match self.phase {
                0 => {
                    // Leave the between-bytes gap, then ready-to-send.
                    self.at = self.now + TBB_US;
                    self.phase = 1;
                    true
                }
                1 => {
                    if self.now < self.at {
                        return false;
                    }
                    self.pull(LINE_CLK, Level::Hi);
                    self.phase = 2;
                    true
                }
                2 => {
                    // Listener ready-for-data.
                    if self.level(LINE_DATA) != Level::Hi {
                        return false;
                    }
                    self.bit = 0;
                    self.phase = if eoi { 3 } else { 5 };
                    true
                }
                3 => {
                    // EOI: wait out the listener's acknowledge pulse.
                    if self.level(LINE_DATA) != Level::Lo {
                        return false;
                    }
                    self.phase = 4;
                    true
                }
                4 => {
                    if self.level(LINE_DATA) != Level::Hi {
                        return false;
                    }
                    self.phase = 5;
                    true
                }
                5 => {
                    // Begin bit clocking.
                    self.pull(LINE_CLK, Level::Lo);
                    self.at = self.now + 30;
                    self.phase = 6;
                    true
                }
                6 => {
                    // Place the bit on DATA while CLK is low.
                    if self.now < self.at {
                        return false;
                    }
                    let value = (byte >> self.bit) & 1;
                    self.pull(LINE_DATA, Level::from_bit(value));
                    self.at = self.now + 30;
                    self.phase = 7;
                    true
                }
                7 => {
                    if self.now < self.at {
                        return false;
                    }
                    self.pull(LINE_CLK, Level::Hi); // data valid
                    self.at = self.now + 30;
                    self.phase = 8;
                    true
                }
                8 => {
                    if self.now < self.at {
                        return false;
                    }
                    self.pull(LINE_CLK, Level::Lo);
                    self.pull(LINE_DATA, Level::Hi);
                    self.bit += 1;
                    self.at = self.now + 10;
                    self.phase = if self.bit == 8 { 9 } else { 6 };
                    true
                }
                9 => {
                    // Frame handshake: listener pulls DATA low.
                    if self.level(LINE_DATA) != Level::Lo {
                        return false;
                    }
                    self.next_op();
                    true
                }
                _ => unreachable!(),
            }
        }

        // The listener side of one byte frame.  The peer holds DATA low
        // before and after, and answers a held-high CLK with the EOI
        // acknowledge pulse.
        fn listen_byte(&mut self) -> bool {
            match self.phase {
                0 => {
                    self.pull(LINE_DATA, Level::Lo);
                    self.phase = 1;
                    true
                }
                1 => {
                    // Talker ready-to-send.
                    if self.level(LINE_CLK) != Level::Hi {
                        return false;
                    }
                    self.at = self.now + 5;
                    self.phase = 2;
                    true
                }
                2 => {
                    if self.now < self.at {
                        return false;
                    }
                    self.pull(LINE_DATA, Level::Hi); // ready-for-data
                    self.at = self.now + 250;
                    self.bit = 0;
                    self.shift = 0;
                    self.phase = 3;
                    true
                }
                3 => {
                    // Wait for bit clocking; a ~250 us still-high clock
                    // means EOI, which gets the acknowledge pulse.
                    if self.level(LINE_CLK) == Level::Lo {
                        self.phase = 5;
                        return true;
                    }
                    if self.now >= self.at {
                        self.eoi_seen = true;
                        self.pull(LINE_DATA, Level::Lo);
                        self.at = self.now + 60;
                        self.phase = 4;
                        return true;
                    }
                    false
                }
                4 => {
                    if self.now < self.at {
                        return false;
                    }
                    self.pull(LINE_DATA, Level::Hi);
                    self.at = self.now + 100_000;
                    self.phase = 3;
                    true
                }
                5 => {
                    // Sample on CLK high.
                    if self.level(LINE_CLK) != Level::Hi {
                        return false;
                    }
                    let value = if self.level(LINE_DATA).is_hi() { 1 } else { 0 };
                    self.shift = (self.shift >> 1) | (value << 7);
                    self.phase = 6;
                    true
                }
                6 => {
                    if self.level(LINE_CLK) != Level::Lo {
                        return false;
                    }
                    self.bit += 1;
                    self.phase = if self.bit == 8 { 7 } else { 5 };
                    if self.bit == 8 {
                        self.at = self.now + 20;
                    }
                    true
                }
                7 => {
                    // Frame handshake.
                    if self.now < self.at {
                        return false;
                    }
                    self.pull(LINE_DATA, Level::Lo);
                    self.received.push(self.shift);
                    self.next_op();
                    true
                }
                _ => unreachable!(),
            }
        }
    }

    #[derive(Clone)]
    struct SimLines(Rc<RefCell<Sim>>);

    impl SimLines {
        fn new(script: Vec<Op>) -> SimLines {
            SimLines(Rc::new(RefCell::new(Sim::new(script))))
        }

        fn tick(&self, us: u32) {
            let mut sim = self.0.borrow_mut();
            for _ in 0..us {
                sim.now += 1;
                sim.advance();
            }
        }

        fn set(&self, line: usize, level: Level) {
            let mut sim = self.0.borrow_mut();
            sim.engine_pulls[line] = level == Level::Lo;
            sim.advance();
        }

        fn get(&self, line: usize) -> Level {
            let mut sim = self.0.borrow_mut();
            sim.advance();
            sim.level(line)
        }
    }

    impl LineDriver for SimLines {
        fn set_atn(&mut self, level: Level) {
            self.set(LINE_ATN, level);
        }
        fn set_clk(&mut self, level: Level) {
            self.set(LINE_CLK, level);
        }
        fn set_data(&mut self, level: Level) {
            self.set(LINE_DATA, level);
        }
        fn atn(&self) -> Level {
            self.get(LINE_ATN)
        }
        fn clk(&self) -> Level {
            self.get(LINE_CLK)
        }
        fn data(&self) -> Level {
            self.get(LINE_DATA)
        }
        fn micros(&self) -> u32 {
            self.0.borrow().now
        }
        fn delay_us(&self, us: u32) {
            self.tick(us);
        }
    }

    struct Harness {
        engine: Engine<SimLines>,
        sim: SimLines,
        shared: Arc<Shared>,
        read_rx: Receiver<i16>,
        write_tx: SyncSender<i16>,
    }

    impl Harness {
        fn new(identity: Identity, script: Vec<Op>) -> Harness {
            let sim = SimLines::new(script);
            let shared = Arc::new(Shared::new());
            let (read_tx, read_rx) = mpsc::sync_channel(FIFO_SIZE);
            let (write_tx, write_rx) = mpsc::sync_channel(FIFO_SIZE);
            let mut engine = Engine::new(sim.clone(), shared.clone(), read_tx, write_rx);
            if let Identity::Drive(_) = identity {
                write_tx.send(identity.sentinel()).unwrap();
            }
            engine.start();
            Harness {
                engine,
                sim,
                shared,
                read_rx,
                write_tx,
            }
        }

        // Run engine and peer until `stop` holds or the iteration bound
        // trips.
        fn run_until<F: Fn(&Harness) -> bool>(&mut self, stop: F) {
            for _ in 0..200_000 {
                if stop(self) {
                    return;
                }
                match self.engine.poll_event() {
                    Some(event) => self.engine.machine(event),
                    None => self.sim.tick(10),
                }
            }
            panic!("simulation did not converge");
        }

        fn words(&self) -> Vec<i16> {
            self.read_rx.try_iter().collect()
        }
    }

    fn atn_preamble(commands: &[u8]) -> Vec<Op> {
        let mut script = vec![
            Op::PullAtn(Level::Lo),
            Op::PullClk(Level::Lo),
            Op::WaitData(Level::Lo),
        ];
        for byte in commands {
            script.push(Op::TalkByte(*byte));
        }
        script
    }

    #[test]
    fn test_receive_with_atn_negation_and_eoi() {
        // A host addresses drive 8 (LISTEN + DATA sa 2), then sends two
        // data bytes, the second EOI-flagged.
        let mut script = atn_preamble(&[cmd::listen(8), cmd::data(2)]);
        script.extend_from_slice(&[
            Op::PullAtn(Level::Hi),
            Op::Delay(150),
            Op::TalkByte(0x44),
            Op::TalkByteEoi(0x45),
            Op::PullClk(Level::Hi),
            Op::Stall,
        ]);

        let mut harness = Harness::new(Identity::Drive(8), script);
        let mut words = vec![];
        harness.run_until(|h| {
            h.engine.state == State::CheckAtn && h.sim.0.borrow().op + 1 >= h.sim.0.borrow().script.len()
        });
        words.extend(harness.words());

        assert_eq!(
            words,
            vec![
                bus::ASSERT_ATN,
                -(cmd::listen(8) as i16),
                -(cmd::data(2) as i16),
                bus::DEASSERT_ATN,
                0x44,
                0x45,
                bus::EOI,
            ]
        );
    }

    #[test]
    fn test_commands_for_other_device_ignored() {
        // A LISTEN addressed to device 9 leaves a drive-8 engine idle;
        // the sentinels and the negated byte still reach the stream.
        let mut script = atn_preamble(&[cmd::listen(9)]);
        script.extend_from_slice(&[Op::PullAtn(Level::Hi), Op::PullClk(Level::Hi), Op::Stall]);

        let mut harness = Harness::new(Identity::Drive(8), script);
        harness.run_until(|h| {
            h.sim.0.borrow().op + 1 >= h.sim.0.borrow().script.len()
                && h.engine.state == State::CheckAtn
        });

        assert_eq!(
            harness.words(),
            vec![bus::ASSERT_ATN, -(cmd::listen(9) as i16), bus::DEASSERT_ATN]
        );
    }

    #[test]
    fn test_read_timeout_after_double_eoi_window() {
        // The talker raises ready-to-send and then never clocks: the
        // first ~250 us window signals EOI, the second is a hard error.
        let mut script = atn_preamble(&[cmd::listen(8), cmd::data(2)]);
        script.extend_from_slice(&[
            Op::PullAtn(Level::Hi),
            Op::Delay(150),
            Op::Delay(TBB_US),
            Op::PullClk(Level::Hi),
            Op::Stall,
        ]);

        let mut harness = Harness::new(Identity::Drive(8), script);
        harness.run_until(|h| h.shared.status() == IecError::ReadTimeout.code());

        let words = harness.words();
        assert_eq!(words.last(), Some(&IecError::ReadTimeout.code()));
        assert_eq!(harness.shared.notify(), Notify::ReturnEio);
    }

    #[test]
    fn test_send_command_bytes_under_atn() {
        // The user side frames LISTEN(8) + OPEN(0) under ATN; the peer
        // listener observes the raw command bytes.
        let script = vec![Op::ListenByte, Op::ListenByte, Op::Stall];
        let mut harness = Harness::new(Identity::Computer, script);
        for word in [
            bus::ASSERT_ATN,
            -(cmd::listen(8) as i16),
            -(cmd::open(0) as i16),
            bus::DEASSERT_ATN,
        ]
        .iter()
        {
            harness.write_tx.send(*word).unwrap();
        }
        harness.run_until(|h| h.sim.0.borrow().received.len() == 2);

        assert_eq!(harness.sim.0.borrow().received, vec![cmd::listen(8), cmd::open(0)]);
        assert_eq!(harness.shared.status(), bus::OK);
    }

    #[test]
    fn test_send_data_with_eoi_handshake() {
        let script = vec![Op::ListenByte, Op::Stall];
        let mut harness = Harness::new(Identity::Computer, script);
        harness.write_tx.send(bus::LAST_BYTE_NEXT).unwrap();
        harness.write_tx.send(0x42).unwrap();
        harness.run_until(|h| h.sim.0.borrow().received.len() == 1);

        let sim = harness.sim.0.borrow();
        assert_eq!(sim.received, vec![0x42]);
        assert!(sim.eoi_seen);
    }

    #[test]
    fn test_device_not_present() {
        // No listener pulls DATA: the ready-to-send probe fails.
        let mut harness = Harness::new(Identity::Computer, vec![Op::Stall]);
        harness.write_tx.send(0x41).unwrap();
        harness.run_until(|h| h.shared.status() != bus::OK);

        assert_eq!(harness.shared.status(), IecError::DeviceNotPresent.code());
        assert_eq!(harness.words().last(), Some(&IecError::DeviceNotPresent.code()));
        assert_eq!(harness.shared.notify(), Notify::ReturnEio);
    }

    #[test]
    fn test_wait_completes_synchronously_when_level_present() {
        let mut harness = Harness::new(Identity::Computer, vec![Op::Stall]);
        // All lines idle high: arming a wait for high completes at once.
        assert!(!harness.engine.wait_clk(Level::Hi));
        assert!(harness.engine.waits.clk.is_none());
        // A wait for low arms.
        assert!(harness.engine.wait_clk(Level::Lo));
        assert!(harness.engine.waits.clk.is_some());
        harness.engine.cancel_waits();
    }

    #[test]
    fn test_clear_error_resets_notification() {
        let mut harness = Harness::new(Identity::Computer, vec![Op::Stall]);
        harness.write_tx.send(0x41).unwrap();
        harness.run_until(|h| h.shared.status() != bus::OK);
        assert_eq!(harness.shared.notify(), Notify::ReturnEio);

        // The channel advances the notification on user reads; once the
        // code has been delivered, CLEAR_ERROR resets everything.
        harness.shared.set_notify(Notify::ClearingPending);
        harness.write_tx.send(bus::CLEAR_ERROR).unwrap();
        harness.run_until(|h| h.shared.notify() == Notify::NoError);
        assert_eq!(harness.shared.status(), bus::OK);
    }

    #[test]
    fn test_drive_talker_interrupted_by_atn() {
        // Host addresses drive 8 with TALK + DATA, performs the
        // turnaround, accepts one byte, then re-asserts ATN.  The
        // engine must flag talk_interrupted and discard queued output.
        let mut script = atn_preamble(&[cmd::talk(8), cmd::data(0)]);
        script.extend_from_slice(&[
            // Turnaround: become listener, release ATN and CLK.
            Op::PullData(Level::Lo),
            Op::PullAtn(Level::Hi),
            Op::PullClk(Level::Hi),
            Op::ListenByte,
            Op::PullAtn(Level::Lo),
            Op::Stall,
        ]);

        let mut harness = Harness::new(Identity::Drive(8), script);
        // Queue the data only once the peer has completed the
        // turnaround and released ATN.
        harness.run_until(|h| h.sim.0.borrow().op >= 8);
        harness.write_tx.send(0x11).unwrap();
        harness.write_tx.send(0x22).unwrap();
        harness.run_until(|h| h.shared.talk_interrupted.load(Ordering::SeqCst));

        assert_eq!(harness.sim.0.borrow().received, vec![0x11]);
    }
}
