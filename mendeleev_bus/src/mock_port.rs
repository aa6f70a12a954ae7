//! In-memory transport pair for exercising the bus master without hardware.
//!
//! `MockBusPort` is handed to the session as its `BusPort`; the paired
//! `MockBusHandle` plays the element side: it injects frames toward the
//! master and inspects everything the master wrote.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use mendeleev_core::constants::wire_constants::{PREAMBLE_BYTE, PREAMBLE_LENGTH};
use mendeleev_core::frame::Frame;
use mendeleev_core::parser::BusParser;

struct Inner {
    /// Bytes waiting for the master to read.
    to_master: VecDeque<u8>,
    /// Everything the master has written, preambles included.
    from_master: Vec<u8>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    readable: Condvar,
}

/// Master-side endpoint. Reads block up to the configured timeout and then
/// fail with `TimedOut`, the same contract a real serial port gives the
/// session's I/O loop.
pub struct MockBusPort {
    shared: Arc<Shared>,
    read_timeout: Duration,
}

/// Element-side endpoint used by tests.
pub struct MockBusHandle {
    shared: Arc<Shared>,
}

/// Creates a connected port/handle pair.
pub fn pair(read_timeout: Duration) -> (MockBusPort, MockBusHandle) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            to_master: VecDeque::new(),
            from_master: Vec::new(),
            closed: false,
        }),
        readable: Condvar::new(),
    });
    (
        MockBusPort {
            shared: shared.clone(),
            read_timeout,
        },
        MockBusHandle { shared },
    )
}

impl Read for MockBusPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.to_master.is_empty() {
            if inner.closed {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"));
            }
            let (guard, _) = self
                .shared
                .readable
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }

        let n = buf.len().min(inner.to_master.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.to_master.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockBusPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock port closed"));
        }
        inner.from_master.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MockBusHandle {
    /// Queues raw bytes for the master to read.
    pub fn inject_bytes(&self, bytes: &[u8]) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.to_master.extend(bytes.iter().copied());
        self.shared.readable.notify_all();
    }

    /// Queues a full frame, preamble prefixed, for the master to read.
    pub fn inject_frame(&self, frame: &Frame) {
        let mut bytes = vec![PREAMBLE_BYTE; PREAMBLE_LENGTH];
        bytes.extend_from_slice(&frame.to_bytes());
        self.inject_bytes(&bytes);
    }

    /// Snapshot of every byte the master has written so far.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.shared.inner.lock().unwrap().from_master.clone()
    }

    /// Parses the master's writes back into frames.
    pub fn written_frames(&self) -> Vec<Frame> {
        let bytes = self.written_bytes();
        let mut parser = BusParser::new();
        parser.parse_bytes(&bytes);
        let mut frames = Vec::new();
        while let Some(frame) = parser.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Blocks until the master has written at least `count` frames, up to
    /// `timeout`. Lets tests react to a request before injecting its reply.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.written_frames();
            if frames.len() >= count || Instant::now() >= deadline {
                return frames;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Simulates the peer going away: pending and future reads see EOF.
    pub fn close(&self) {
        self.shared.inner.lock().unwrap().closed = true;
        self.shared.readable.notify_all();
    }
}
