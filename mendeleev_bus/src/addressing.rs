//! Address assignment for a freshly powered bus.
//!
//! Elements come out of the box without an address and only listen on
//! broadcast. The master puts the whole bus into setup mode, then walks the
//! wall one element at a time: a touched element broadcasts a ready signal,
//! the master answers with a broadcast assigning it the next address, and so
//! on through address 118.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use mendeleev_core::constants::address_constants::{BROADCAST, FIRST_ELEMENT, NUM_ELEMENTS};
use mendeleev_core::constants::setup_constants;
use mendeleev_core::elements;

use crate::{BusError, BusMaster, Command, DEFAULT_BROADCAST_WAIT, Frame};

/// Pause between an element's ready signal and the assign broadcast, giving
/// the touched element time to start listening for its address.
const ASSIGN_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// Walk addresses 1..=118 without user interaction.
    Automatic,
    /// Prompt for every address, defaulting to the next sequential one.
    Manual,
}

/// A received setup frame that did not carry the ready signal.
#[derive(Debug)]
pub struct SetupProtocolError {
    pub frame: Frame,
}

impl fmt::Display for SetupProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected a setup_ready frame, got command 0x{:02X} from {}",
            self.frame.command,
            elements::describe(self.frame.source)
        )
    }
}

impl std::error::Error for SetupProtocolError {}

/// Drives the address assignment procedure over an existing session.
pub struct AddressingProcedure<'a> {
    master: &'a BusMaster,
    pub mode: AddressingMode,
    /// Settle time after each setup broadcast.
    pub broadcast_wait: Duration,
    /// How long to wait for a touch; `None` waits until Ctrl-C.
    pub ready_timeout: Option<Duration>,
    pub assign_delay: Duration,
    /// Highest address to assign. 118 on a full wall.
    pub last_element: u8,
    /// Next address to hand out.
    next_address: u8,
    /// Whether the enter-setup broadcast has gone out.
    in_setup: bool,
}

impl<'a> AddressingProcedure<'a> {
    pub fn new(master: &'a BusMaster, mode: AddressingMode) -> Self {
        Self {
            master,
            mode,
            broadcast_wait: DEFAULT_BROADCAST_WAIT,
            ready_timeout: None,
            assign_delay: ASSIGN_DELAY,
            last_element: NUM_ELEMENTS,
            next_address: FIRST_ELEMENT,
            in_setup: false,
        }
    }

    /// Runs the whole procedure: enter setup, assign addresses until done,
    /// exit setup. Timeouts reprompt the same address; any other failure
    /// aborts after a clean exit broadcast.
    pub fn run(&mut self) -> Result<()> {
        self.enter_setup().context("entering setup mode")?;

        loop {
            let next_address = match self.mode {
                AddressingMode::Automatic => {
                    if self.next_address > self.last_element {
                        break;
                    }
                    self.next_address
                }
                AddressingMode::Manual => prompt_next_address(self.next_address)?,
            };

            match self.assign_address(next_address) {
                Ok(()) => self.next_address = next_address + 1,
                Err(e) if is_timeout(&e) => {
                    println!("timed out, try again");
                    continue;
                }
                Err(e) => {
                    let _ = self.exit_setup();
                    return Err(e.context("addressing aborted"));
                }
            }
        }

        self.exit_setup().context("leaving setup mode")
    }

    /// Waits for a touched element and broadcasts its new address.
    pub fn assign_address(&self, next_address: u8) -> Result<()> {
        if !elements::is_element(next_address) || next_address > self.last_element {
            return Err(BusError::InvalidAddress(next_address).into());
        }

        println!(
            "Please touch the element to set address {} ({})",
            next_address,
            elements::describe(next_address)
        );
        let frame = self.master.receive(BROADCAST, self.ready_timeout)?;
        if frame.command != Command::Setup.code()
            || frame.payload().first() != Some(&setup_constants::READY)
        {
            return Err(SetupProtocolError { frame }.into());
        }
        println!("received setup_ready from {}", elements::describe(frame.source));

        thread::sleep(self.assign_delay);

        self.master.broadcast_cmd(
            Command::Setup,
            &[setup_constants::ASSIGN, next_address],
            self.broadcast_wait,
        )?;
        println!("sent address {next_address}");
        Ok(())
    }

    pub fn enter_setup(&mut self) -> Result<(), BusError> {
        self.master
            .broadcast_cmd(Command::Setup, &[setup_constants::ENTER], self.broadcast_wait)?;
        self.in_setup = true;
        Ok(())
    }

    /// Leaves setup mode. A no-op unless the enter broadcast went out.
    pub fn exit_setup(&mut self) -> Result<(), BusError> {
        if !self.in_setup {
            return Ok(());
        }
        self.master
            .broadcast_cmd(Command::Setup, &[setup_constants::EXIT], self.broadcast_wait)?;
        self.in_setup = false;
        Ok(())
    }
}

fn is_timeout(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<BusError>(), Some(BusError::Timeout))
}

fn prompt_next_address(default: u8) -> Result<u8> {
    print!("which address do you want to set? [{default}] ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        Ok(default)
    } else {
        line.parse().context("not a valid address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_frame(source: u8, sequence_nr: u16) -> Frame {
        Frame::new(
            BROADCAST,
            source,
            sequence_nr,
            Command::Setup.code(),
            vec![setup_constants::READY],
        )
        .unwrap()
    }

    fn quick_procedure<'a>(
        master: &'a BusMaster,
        last_element: u8,
        ready_timeout: Option<Duration>,
    ) -> AddressingProcedure<'a> {
        let mut procedure = AddressingProcedure::new(master, AddressingMode::Automatic);
        procedure.broadcast_wait = Duration::ZERO;
        procedure.assign_delay = Duration::from_millis(10);
        procedure.ready_timeout = ready_timeout;
        procedure.last_element = last_element;
        procedure
    }

    #[test]
    fn automatic_run_assigns_every_address() {
        let (master, element) = BusMaster::new_mock();

        // Two touches queued up front; the procedure consumes one per
        // address.
        element.inject_frame(&ready_frame(0, 100));
        element.inject_frame(&ready_frame(0, 101));

        let mut procedure = quick_procedure(&master, 2, Some(Duration::from_secs(1)));
        procedure.run().unwrap();

        let frames = element.wait_for_frames(4, Duration::from_secs(1));
        let payloads: Vec<&[u8]> = frames.iter().map(|f| f.payload()).collect();
        assert_eq!(
            payloads,
            vec![
                &[setup_constants::ENTER][..],
                &[setup_constants::ASSIGN, 1][..],
                &[setup_constants::ASSIGN, 2][..],
                &[setup_constants::EXIT][..],
            ]
        );
        assert!(frames.iter().all(|f| f.destination == BROADCAST));
        assert!(frames.iter().all(|f| f.command == Command::Setup.code()));
    }

    #[test]
    fn timeout_retries_the_same_address() {
        let (master, element) = BusMaster::new_mock();

        let mut procedure = quick_procedure(&master, 1, Some(Duration::from_millis(60)));

        // No touch yet: the first attempt times out and the procedure asks
        // again for the same address. Feed the touch from another thread
        // after the first attempt has expired.
        let feeder = {
            let handle_frame = ready_frame(0, 7);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(120));
                element.inject_frame(&handle_frame);
                element
            })
        };

        procedure.run().unwrap();
        let element = feeder.join().unwrap();

        let frames = element.wait_for_frames(3, Duration::from_secs(1));
        let payloads: Vec<&[u8]> = frames.iter().map(|f| f.payload()).collect();
        assert_eq!(
            payloads,
            vec![
                &[setup_constants::ENTER][..],
                &[setup_constants::ASSIGN, 1][..],
                &[setup_constants::EXIT][..],
            ]
        );
    }

    #[test]
    fn unexpected_frame_aborts_with_exit_broadcast() {
        let (master, element) = BusMaster::new_mock();

        // A broadcast that is not a ready signal: wrong setup opcode.
        let bogus = Frame::new(
            BROADCAST,
            9,
            3,
            Command::Setup.code(),
            vec![setup_constants::ASSIGN, 4],
        )
        .unwrap();
        element.inject_frame(&bogus);

        let mut procedure = quick_procedure(&master, 2, Some(Duration::from_secs(1)));
        let err = procedure.run().unwrap_err();
        assert!(err.downcast_ref::<SetupProtocolError>().is_some());

        // Enter, then the clean exit; no assignment in between.
        let frames = element.wait_for_frames(2, Duration::from_secs(1));
        let payloads: Vec<&[u8]> = frames.iter().map(|f| f.payload()).collect();
        assert_eq!(
            payloads,
            vec![&[setup_constants::ENTER][..], &[setup_constants::EXIT][..]]
        );
    }

    #[test]
    fn out_of_range_address_is_rejected() {
        let (master, _element) = BusMaster::new_mock();
        let procedure = quick_procedure(&master, NUM_ELEMENTS, Some(Duration::from_millis(50)));

        let err = procedure.assign_address(0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::InvalidAddress(0))
        ));
        let err = procedure.assign_address(119).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BusError>(),
            Some(BusError::InvalidAddress(119))
        ));
    }
}
