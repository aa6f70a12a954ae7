//! Master-side driver for the Mendeleev element bus: a half-duplex RS-485
//! multi-drop bus with up to 118 peripherals, one per chemical element.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mendeleev_bus::{BusMaster, Command};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut master = BusMaster::new("/dev/ttyUSB0");
//!     master.connect()?;
//!
//!     // Gold, in gold.
//!     master.send_cmd(79, Command::SetColor, &[0xFF, 0xD7, 0x00], Duration::from_secs(1))?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError, channel, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mendeleev_core::constants::address_constants::{BROADCAST, MASTER};
use mendeleev_core::constants::wire_constants::{PREAMBLE_BYTE, PREAMBLE_LENGTH};
use mendeleev_core::elements;
use mendeleev_core::frame::FrameError;
use mendeleev_core::ota;
use mendeleev_core::parser::BusParser;

pub mod addressing;
pub mod mock_port;
pub mod transport;

pub use mendeleev_core::commands::{Command, Mode};
pub use mendeleev_core::frame::Frame;

use transport::BusPort;

/// Read timeout of the I/O loop; also how often blocked callers re-check
/// the connection state.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Delay before each reconnect attempt after a connection loss.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Bound on the inbound frame queue. On a single-master bus only the reply
/// to the outstanding request should ever sit here.
const FRAME_QUEUE_DEPTH: usize = 64;

/// Reply deadline used by the convenience wrappers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Bus turnaround pause after a broadcast.
pub const DEFAULT_BROADCAST_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum BusError {
    /// Device or socket failure; the session reconnects in the background.
    Transport(io::Error),
    /// No matching reply arrived before the caller's deadline.
    Timeout,
    /// The element answered with the complemented command code.
    CommandFailed { command: Command, payload: Vec<u8> },
    /// Destination does not name an element.
    InvalidAddress(u8),
    /// The request lock was poisoned by a panicking holder.
    BusBusy,
    /// The frame could not be built, e.g. an oversized payload.
    Frame(FrameError),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Transport(e) => write!(f, "transport error: {e}"),
            BusError::Timeout => write!(f, "timed out waiting for a reply"),
            BusError::CommandFailed { command, payload } => {
                write!(f, "command {command} failed ({} payload bytes)", payload.len())
            }
            BusError::InvalidAddress(addr) => write!(f, "invalid element address: {addr}"),
            BusError::BusBusy => write!(f, "bus request lock unavailable"),
            BusError::Frame(e) => write!(f, "frame error: {e}"),
        }
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BusError::Transport(e) => Some(e),
            BusError::Frame(e) => Some(e),
            _ => None,
        }
    }
}

/// State guarded by the request lock: holding it serializes everything that
/// touches the half-duplex bus, and hands the holder exclusive use of the
/// inbound frame queue.
struct Correlator {
    next_seq: u16,
    frames: Receiver<Frame>,
}

/// The master-side session on one bus.
///
/// A background I/O thread owns the port: it drains queued writes, feeds
/// received bytes through [`BusParser`] and forwards decoded frames to the
/// session. On connection loss it keeps retrying in the background while
/// in-flight operations fail over to the caller.
pub struct BusMaster {
    url: String,
    src_addr: u8,
    reconnect_delay: Duration,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    tx_sender: Sender<Vec<u8>>,
    tx_receiver: Mutex<Option<Receiver<Vec<u8>>>>,
    frame_sender: SyncSender<Frame>,
    shared: Mutex<Correlator>,
    join_handle: Option<JoinHandle<()>>,
}

impl BusMaster {
    /// Creates a session for the bus at `url` without touching any device.
    ///
    /// `socket://host:port` selects TCP; anything else is a serial device
    /// path. Call [`connect`](Self::connect) before issuing requests.
    pub fn new(url: &str) -> Self {
        let (tx_sender, tx_receiver) = channel();
        let (frame_sender, frames) = sync_channel(FRAME_QUEUE_DEPTH);
        Self {
            url: url.to_string(),
            src_addr: MASTER,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            tx_sender,
            tx_receiver: Mutex::new(Some(tx_receiver)),
            frame_sender,
            shared: Mutex::new(Correlator { next_seq: 0, frames }),
            join_handle: None,
        }
    }

    /// Creates a connected session on an in-memory port, plus the handle
    /// that plays the element side. For tests and demos.
    pub fn new_mock() -> (Self, mock_port::MockBusHandle) {
        let (port, handle) = mock_port::pair(POLL_INTERVAL);
        let mut master = Self::new("mock://");
        master.reconnect_delay = Duration::from_millis(50);
        master.spawn_io(Box::new(port));
        (master, handle)
    }

    /// Opens the port and starts the background I/O thread.
    ///
    /// Returns early if the session is already running.
    pub fn connect(&mut self) -> Result<(), BusError> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }
        let port = transport::open_port(&self.url, POLL_INTERVAL).map_err(BusError::Transport)?;
        log::info!("connected to {}", self.url);
        self.spawn_io(port);
        Ok(())
    }

    fn spawn_io(&mut self, port: Box<dyn BusPort>) {
        let Some(tx_receiver) = self.tx_receiver.lock().ok().and_then(|mut r| r.take()) else {
            return;
        };

        self.running.store(true, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);

        let url = self.url.clone();
        let running = self.running.clone();
        let connected = self.connected.clone();
        let frame_sender = self.frame_sender.clone();
        let reconnect_delay = self.reconnect_delay;

        self.join_handle = Some(thread::spawn(move || {
            io_loop(
                port,
                &url,
                &running,
                &connected,
                tx_receiver,
                frame_sender,
                reconnect_delay,
            );
        }));
    }

    /// Stops the I/O thread and marks the session closed.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
        self.connected.store(false, Ordering::Relaxed);

        // The receivers were moved into the I/O thread; remake the channels
        // so the session can be reconnected. The sequence counter lives on.
        let mut slot = match self.tx_receiver.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.is_none() {
            let (tx_sender, tx_receiver) = channel();
            self.tx_sender = tx_sender;
            *slot = Some(tx_receiver);
            let (frame_sender, frames) = sync_channel(FRAME_QUEUE_DEPTH);
            self.frame_sender = frame_sender;
            if let Ok(mut correlator) = self.shared.lock() {
                correlator.frames = frames;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends `command` to one element and waits for its reply payload.
    ///
    /// The request lock is held for the whole exchange; overlapping calls
    /// complete in submission order. A reply carrying the complemented
    /// command code surfaces as [`BusError::CommandFailed`] with the reply
    /// payload attached.
    pub fn send_cmd(
        &self,
        destination: u8,
        command: Command,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        if !elements::is_element(destination) {
            return Err(BusError::InvalidAddress(destination));
        }
        self.ensure_connected()?;

        let mut correlator = self.lock_correlator()?;
        let request =
            self.next_request(&mut correlator, destination, command.code(), payload.to_vec())?;
        self.enqueue(&request)?;
        let reply = self.await_reply(&mut correlator, &request, timeout)?;
        if reply.is_error_reply_to(&request) {
            return Err(BusError::CommandFailed {
                command,
                payload: reply.into_payload(),
            });
        }
        Ok(reply.into_payload())
    }

    /// Sends `command` to every element. Broadcasts get no reply; after the
    /// write the session pauses for `wait` to let the bus turn around and
    /// the elements settle.
    pub fn broadcast_cmd(
        &self,
        command: Command,
        payload: &[u8],
        wait: Duration,
    ) -> Result<(), BusError> {
        self.ensure_connected()?;
        let mut correlator = self.lock_correlator()?;
        let frame =
            self.next_request(&mut correlator, BROADCAST, command.code(), payload.to_vec())?;
        self.enqueue(&frame)?;
        thread::sleep(wait);
        Ok(())
    }

    /// Streams a firmware image to one element, fragment by fragment, each
    /// acknowledged before the next goes out. The request lock is held for
    /// the whole transfer.
    pub fn send_ota(
        &self,
        destination: u8,
        image: &[u8],
        timeout: Duration,
    ) -> Result<(), BusError> {
        if !elements::is_element(destination) {
            return Err(BusError::InvalidAddress(destination));
        }
        self.ensure_connected()?;

        let mut correlator = self.lock_correlator()?;
        for payload in ota::fragment_image(image, ota::max_fragment_size()) {
            let request =
                self.next_request(&mut correlator, destination, Command::Ota.code(), payload)?;
            self.enqueue(&request)?;
            let reply = self.await_reply(&mut correlator, &request, timeout)?;
            if reply.is_error_reply_to(&request) {
                log::warn!("ota to {} rejected", elements::describe(destination));
                return Err(BusError::CommandFailed {
                    command: Command::Ota,
                    payload: reply.into_payload(),
                });
            }
        }
        Ok(())
    }

    /// Broadcast form of [`send_ota`](Self::send_ota): no acknowledgements,
    /// fragments are paced by sleeping `wait` after each one.
    pub fn broadcast_ota(&self, image: &[u8], wait: Duration) -> Result<(), BusError> {
        self.ensure_connected()?;
        let mut correlator = self.lock_correlator()?;
        for payload in ota::fragment_image(image, ota::max_fragment_size()) {
            let frame =
                self.next_request(&mut correlator, BROADCAST, Command::Ota.code(), payload)?;
            self.enqueue(&frame)?;
            thread::sleep(wait);
        }
        Ok(())
    }

    /// Passive receive: returns the next frame addressed to
    /// `expected_destination` or to broadcast, discarding anything else.
    /// With `timeout: None` it waits until a frame arrives or the session
    /// stops. Used by the addressing procedure.
    pub fn receive(
        &self,
        expected_destination: u8,
        timeout: Option<Duration>,
    ) -> Result<Frame, BusError> {
        self.ensure_connected()?;
        let correlator = self.lock_correlator()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Err(closed_error());
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BusError::Timeout);
                    }
                    deadline.saturating_duration_since(now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            match correlator.frames.recv_timeout(slice) {
                Ok(frame)
                    if frame.destination == expected_destination
                        || frame.destination == BROADCAST =>
                {
                    return Ok(frame);
                }
                Ok(frame) => log::warn!(
                    "discarding frame for {} while receiving for {}",
                    elements::describe(frame.destination),
                    elements::describe(expected_destination)
                ),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.connected.load(Ordering::Relaxed) {
                        return Err(closed_error());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(closed_error()),
            }
        }
    }

    /// Sets an element's LEDs. The payload layout (RGB or RGBW) is up to
    /// the peripheral.
    pub fn set_color(
        &self,
        destination: u8,
        color: &[u8],
        timeout: Duration,
    ) -> Result<(), BusError> {
        self.send_cmd(destination, Command::SetColor, color, timeout)
            .map(drop)
    }

    pub fn set_mode(
        &self,
        destination: u8,
        mode: Mode,
        timeout: Duration,
    ) -> Result<(), BusError> {
        self.send_cmd(destination, Command::SetMode, &[mode.code()], timeout)
            .map(drop)
    }

    pub fn set_output(
        &self,
        destination: u8,
        output: &[u8],
        timeout: Duration,
    ) -> Result<(), BusError> {
        self.send_cmd(destination, Command::SetOutput, output, timeout)
            .map(drop)
    }

    pub fn reboot(&self, destination: u8, timeout: Duration) -> Result<(), BusError> {
        self.send_cmd(destination, Command::Reboot, &[], timeout)
            .map(drop)
    }

    /// Queries an element's firmware version string.
    pub fn version(&self, destination: u8, timeout: Duration) -> Result<String, BusError> {
        let payload = self.send_cmd(destination, Command::Version, &[], timeout)?;
        Ok(String::from_utf8_lossy(&payload)
            .trim_end_matches('\0')
            .to_string())
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if !self.running.load(Ordering::Relaxed) || !self.connected.load(Ordering::Relaxed) {
            return Err(closed_error());
        }
        Ok(())
    }

    fn lock_correlator(&self) -> Result<std::sync::MutexGuard<'_, Correlator>, BusError> {
        self.shared.lock().map_err(|_| BusError::BusBusy)
    }

    /// Builds the next outgoing frame, consuming a sequence number.
    /// Broadcasts consume one too; elements may use it for de-duplication.
    fn next_request(
        &self,
        correlator: &mut Correlator,
        destination: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Frame, BusError> {
        let sequence_nr = correlator.next_seq;
        correlator.next_seq = correlator.next_seq.wrapping_add(1);
        Frame::new(destination, self.src_addr, sequence_nr, command, payload)
            .map_err(BusError::Frame)
    }

    /// Hands the preamble-prefixed frame to the I/O thread.
    fn enqueue(&self, frame: &Frame) -> Result<(), BusError> {
        let mut bytes = vec![PREAMBLE_BYTE; PREAMBLE_LENGTH];
        bytes.extend_from_slice(&frame.to_bytes());
        self.tx_sender.send(bytes).map_err(|_| closed_error())
    }

    /// Drains inbound frames until one answers `request` or the deadline
    /// passes. Frames that do not answer should not occur on a single-master
    /// bus; they are logged and discarded.
    fn await_reply(
        &self,
        correlator: &mut Correlator,
        request: &Frame,
        timeout: Duration,
    ) -> Result<Frame, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::Timeout);
            }
            let slice = deadline.saturating_duration_since(now).min(POLL_INTERVAL);
            match correlator.frames.recv_timeout(slice) {
                Ok(frame) if frame.answers(request) => return Ok(frame),
                Ok(frame) => log::warn!(
                    "discarding frame from {} (sequence {}) that does not answer sequence {}",
                    elements::describe(frame.source),
                    frame.sequence_nr,
                    request.sequence_nr
                ),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.connected.load(Ordering::Relaxed) {
                        return Err(closed_error());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(closed_error()),
            }
        }
    }
}

/// Closes the session when the master goes out of scope.
impl Drop for BusMaster {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> BusError {
    BusError::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "bus connection lost",
    ))
}

/// The background I/O loop: single owner of the port. Writes queued frames,
/// reads whatever arrives, and forwards decoded frames to the session. On a
/// connection loss it flips the connected flag and keeps retrying until the
/// session stops.
fn io_loop(
    mut port: Box<dyn BusPort>,
    url: &str,
    running: &AtomicBool,
    connected: &AtomicBool,
    tx_receiver: Receiver<Vec<u8>>,
    frame_sender: SyncSender<Frame>,
    reconnect_delay: Duration,
) {
    let mut parser = BusParser::new();
    let mut buffer = [0u8; 1024];

    'session: while running.load(Ordering::Relaxed) {
        // Pending writes go out first so requests are not stuck behind the
        // read timeout.
        while let Ok(bytes) = tx_receiver.try_recv() {
            if let Err(e) = port.write_all(&bytes).and_then(|()| port.flush()) {
                log::warn!("bus write failed: {e}");
                match reconnect(url, running, connected, reconnect_delay) {
                    Some(new_port) => {
                        port = new_port;
                        parser = BusParser::new();
                    }
                    None => break 'session,
                }
                continue 'session;
            }
        }

        match port.read(&mut buffer) {
            Ok(n) if n > 0 => {
                parser.parse_bytes(&buffer[..n]);
                while let Some(frame) = parser.next_frame() {
                    match frame_sender.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            log::warn!("inbound frame queue full, dropping frame");
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            // Session dropped its receiver.
                            return;
                        }
                    }
                }
            }
            Ok(_) => {
                log::warn!("bus connection closed by peer");
                match reconnect(url, running, connected, reconnect_delay) {
                    Some(new_port) => {
                        port = new_port;
                        parser = BusParser::new();
                    }
                    None => break 'session,
                }
            }
            Err(e) if transport::is_idle_read_error(&e) => {}
            Err(e) => {
                log::warn!("bus read failed: {e}");
                match reconnect(url, running, connected, reconnect_delay) {
                    Some(new_port) => {
                        port = new_port;
                        parser = BusParser::new();
                    }
                    None => break 'session,
                }
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
}

/// Retries the connection until it succeeds or the session stops. Each
/// attempt waits out `delay` first; the open itself is bounded by the
/// transport's connect timeout.
fn reconnect(
    url: &str,
    running: &AtomicBool,
    connected: &AtomicBool,
    delay: Duration,
) -> Option<Box<dyn BusPort>> {
    connected.store(false, Ordering::Relaxed);
    loop {
        sleep_while_running(delay, running);
        if !running.load(Ordering::Relaxed) {
            return None;
        }
        match transport::open_port(url, POLL_INTERVAL) {
            Ok(port) => {
                log::info!("reconnected to {url}");
                connected.store(true, Ordering::Relaxed);
                return Some(port);
            }
            Err(e) => log::warn!("reconnect to {url} failed: {e}"),
        }
    }
}

/// Sleeps in small steps so `close()` never has to wait out a full
/// reconnect delay.
fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let step = Duration::from_millis(10);
    let mut remaining = total;
    while remaining > Duration::ZERO && running.load(Ordering::Relaxed) {
        let s = remaining.min(step);
        thread::sleep(s);
        remaining = remaining.saturating_sub(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mendeleev_core::constants::wire_constants::MAX_PAYLOAD;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn reply_to(request: &Frame, command: u8, payload: Vec<u8>) -> Frame {
        Frame::new(
            request.source,
            request.destination,
            request.sequence_nr,
            command,
            payload,
        )
        .unwrap()
    }

    #[test]
    fn connect_failure_is_a_transport_error() {
        let mut master = BusMaster::new("/dev/does-not-exist-mendeleev");
        let err = master.connect().unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
        assert!(!master.is_running());
    }

    #[test]
    fn send_cmd_round_trip() {
        let (master, element) = BusMaster::new_mock();

        // The element's reply can sit in the queue before the request goes
        // out; correlation is by sequence number.
        let reply = Frame::new(0, 5, 0, Command::SetColor.code(), vec![0xAC]).unwrap();
        element.inject_frame(&reply);

        let payload = master
            .send_cmd(5, Command::SetColor, &[0xFF, 0x80, 0x00, 0x00], TIMEOUT)
            .unwrap();
        assert_eq!(payload, vec![0xAC]);

        let frames = element.wait_for_frames(1, TIMEOUT);
        let written = element.written_bytes();
        assert_eq!(&written[..PREAMBLE_LENGTH], &[PREAMBLE_BYTE; PREAMBLE_LENGTH]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].destination, 5);
        assert_eq!(frames[0].source, 0);
        assert_eq!(frames[0].sequence_nr, 0);
        assert_eq!(frames[0].command, Command::SetColor.code());
        assert_eq!(frames[0].payload(), &[0xFF, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn timeout_then_late_reply_is_discarded() {
        let (master, element) = BusMaster::new_mock();

        let err = master
            .send_cmd(5, Command::SetColor, &[0x01], Duration::from_millis(80))
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));

        // The late reply to sequence 0 arrives after the caller gave up,
        // followed by the proper reply to sequence 1.
        let stale = Frame::new(0, 5, 0, Command::SetColor.code(), vec![0xBB]).unwrap();
        let fresh = Frame::new(0, 5, 1, Command::SetColor.code(), vec![0xCC]).unwrap();
        element.inject_frame(&stale);
        element.inject_frame(&fresh);

        let payload = master
            .send_cmd(5, Command::SetColor, &[0x02], TIMEOUT)
            .unwrap();
        assert_eq!(payload, vec![0xCC]);
    }

    #[test]
    fn error_reply_surfaces_command_failed() {
        let (master, element) = BusMaster::new_mock();

        let error_reply = Frame::new(0, 5, 0, !Command::SetColor.code(), vec![0x13]).unwrap();
        element.inject_frame(&error_reply);

        let err = master
            .send_cmd(5, Command::SetColor, &[0x01], TIMEOUT)
            .unwrap_err();
        match err {
            BusError::CommandFailed { command, payload } => {
                assert_eq!(command, Command::SetColor);
                assert_eq!(payload, vec![0x13]);
            }
            other => panic!("expected CommandFailed, got {other}"),
        }
    }

    #[test]
    fn invalid_addresses_are_rejected_before_io() {
        let (master, element) = BusMaster::new_mock();

        for destination in [0x00, 119, BROADCAST] {
            let err = master
                .send_cmd(destination, Command::Reboot, &[], TIMEOUT)
                .unwrap_err();
            assert!(matches!(err, BusError::InvalidAddress(a) if a == destination));
        }
        let err = master.send_ota(0, &[0u8; 8], TIMEOUT).unwrap_err();
        assert!(matches!(err, BusError::InvalidAddress(0)));

        std::thread::sleep(Duration::from_millis(50));
        assert!(element.written_bytes().is_empty());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (master, _element) = BusMaster::new_mock();
        let err = master
            .send_cmd(1, Command::SetColor, &vec![0u8; MAX_PAYLOAD + 1], TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, BusError::Frame(FrameError::PayloadTooLong { .. })));
    }

    #[test]
    fn broadcast_writes_one_frame_and_waits() {
        let (master, element) = BusMaster::new_mock();

        let started = Instant::now();
        master
            .broadcast_cmd(Command::Reboot, &[], Duration::from_millis(200))
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        let frames = element.wait_for_frames(1, TIMEOUT);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].destination, BROADCAST);
        assert_eq!(frames[0].command, Command::Reboot.code());
        assert_eq!(frames[0].payload(), &[] as &[u8]);
    }

    #[test]
    fn sequence_numbers_increment_across_requests() {
        let (master, element) = BusMaster::new_mock();

        for _ in 0..4 {
            master
                .broadcast_cmd(Command::SetColor, &[0x00], Duration::ZERO)
                .unwrap();
        }

        let frames = element.wait_for_frames(4, TIMEOUT);
        let sequences: Vec<u16> = frames.iter().map(|f| f.sequence_nr).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }

    #[test]
    fn overlapping_requests_complete_in_submission_order() {
        let (master, element) = BusMaster::new_mock();
        let master = Arc::new(master);

        let first = {
            let master = master.clone();
            thread::spawn(move || master.send_cmd(1, Command::SetColor, &[0x01], TIMEOUT))
        };
        // The first request is on the wire before the second caller starts.
        let frames = element.wait_for_frames(1, TIMEOUT);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].destination, 1);

        let second = {
            let master = master.clone();
            thread::spawn(move || master.send_cmd(2, Command::SetColor, &[0x02], TIMEOUT))
        };

        // The second request must not hit the wire while the first is
        // outstanding.
        thread::sleep(Duration::from_millis(150));
        assert_eq!(element.written_frames().len(), 1);

        let reply1 = reply_to(&element.written_frames()[0], Command::SetColor.code(), vec![]);
        element.inject_frame(&reply1);
        assert!(first.join().unwrap().is_ok());

        let frames = element.wait_for_frames(2, TIMEOUT);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].destination, 2);
        assert_eq!(frames[1].sequence_nr, 1);

        let reply2 = reply_to(&frames[1], Command::SetColor.code(), vec![]);
        element.inject_frame(&reply2);
        assert!(second.join().unwrap().is_ok());
    }

    #[test]
    fn send_ota_fragments_and_acknowledgements() {
        let (master, element) = BusMaster::new_mock();
        let master = Arc::new(master);
        let image: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();

        let sender = {
            let master = master.clone();
            let image = image.clone();
            thread::spawn(move || master.send_ota(9, &image, TIMEOUT))
        };

        // Acknowledge each fragment as it shows up.
        for k in 1..=4 {
            let frames = element.wait_for_frames(k, TIMEOUT);
            assert_eq!(frames.len(), k);
            let request = &frames[k - 1];
            assert_eq!(request.command, Command::Ota.code());
            element.inject_frame(&reply_to(request, Command::Ota.code(), vec![]));
        }
        assert!(sender.join().unwrap().is_ok());

        let frames = element.written_frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].payload(), &[0x00, 0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(frames[1].payload()[0], 0x01);
        assert_eq!(&frames[1].payload()[1..], &image[0..222]);
        assert_eq!(frames[2].payload()[0], 0x02);
        assert_eq!(&frames[2].payload()[1..], &image[222..444]);
        assert_eq!(frames[3].payload()[0], 0x03);
        assert_eq!(&frames[3].payload()[1..], &image[444..500]);
        // One sequence number per fragment.
        let sequences: Vec<u16> = frames.iter().map(|f| f.sequence_nr).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }

    #[test]
    fn broadcast_ota_needs_no_acknowledgement() {
        let (master, element) = BusMaster::new_mock();
        let image = vec![0x5Au8; 10];

        master.broadcast_ota(&image, Duration::ZERO).unwrap();

        let frames = element.wait_for_frames(2, TIMEOUT);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.destination == BROADCAST));
        assert_eq!(frames[0].payload(), &[0x00, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(frames[1].payload()[0], 0x01);
        assert_eq!(&frames[1].payload()[1..], &image[..]);
    }

    #[test]
    fn receive_filters_on_destination() {
        let (master, element) = BusMaster::new_mock();

        let other = Frame::new(3, 7, 0, Command::Setup.code(), vec![0x01]).unwrap();
        let wanted = Frame::new(0, 7, 1, Command::Setup.code(), vec![0x01]).unwrap();
        element.inject_frame(&other);
        element.inject_frame(&wanted);

        let frame = master.receive(0, Some(TIMEOUT)).unwrap();
        assert_eq!(frame, wanted);
    }

    #[test]
    fn receive_accepts_broadcast_frames() {
        let (master, element) = BusMaster::new_mock();

        let frame = Frame::new(BROADCAST, 4, 0, Command::Setup.code(), vec![0x01]).unwrap();
        element.inject_frame(&frame);

        let received = master.receive(0, Some(TIMEOUT)).unwrap();
        assert_eq!(received, frame);
    }

    #[test]
    fn receive_times_out() {
        let (master, _element) = BusMaster::new_mock();
        let err = master.receive(0, Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, BusError::Timeout));
    }

    #[test]
    fn corrupted_reply_is_never_delivered() {
        let (master, element) = BusMaster::new_mock();

        // A valid-looking reply with one payload byte flipped after CRC
        // computation: the parser drops it, so the request times out.
        let reply = Frame::new(0, 5, 0, Command::SetColor.code(), vec![0xAC]).unwrap();
        let mut bytes = vec![PREAMBLE_BYTE; PREAMBLE_LENGTH];
        bytes.extend_from_slice(&reply.to_bytes());
        let penultimate = bytes.len() - 2;
        bytes[penultimate] ^= 0x01;
        element.inject_bytes(&bytes);

        let err = master
            .send_cmd(5, Command::SetColor, &[0x01], Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));
    }

    #[test]
    fn version_decodes_the_reply_string() {
        let (master, element) = BusMaster::new_mock();

        let reply = Frame::new(
            0,
            3,
            0,
            Command::Version.code(),
            b"v1.2.3\0\0".to_vec(),
        )
        .unwrap();
        element.inject_frame(&reply);

        let version = master.version(3, TIMEOUT).unwrap();
        assert_eq!(version, "v1.2.3");
    }

    #[test]
    fn close_is_idempotent_and_fails_fast_afterwards() {
        let (mut master, _element) = BusMaster::new_mock();
        assert!(master.is_running());
        master.close();
        master.close();
        assert!(!master.is_running());

        let err = master
            .send_cmd(1, Command::Reboot, &[], TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
    }
}
