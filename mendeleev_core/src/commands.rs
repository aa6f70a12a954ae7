use core::fmt;

use serde::{Deserialize, Serialize};

/// Command codes understood by the elements.
///
/// A reply normally echoes the request's code; an element signals failure by
/// replying with the bitwise complement of the code instead, which is why
/// frames carry the raw byte rather than this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    SetColor = 0x00,
    SetMode = 0x01,
    Ota = 0x02,
    Version = 0x03,
    SetOutput = 0x04,
    Reboot = 0x05,
    Setup = 0x06,
}

impl Command {
    /// The on-wire command byte.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The code an element uses to flag this command as failed.
    pub const fn error_code(self) -> u8 {
        !(self as u8)
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Command::SetColor),
            0x01 => Some(Command::SetMode),
            0x02 => Some(Command::Ota),
            0x03 => Some(Command::Version),
            0x04 => Some(Command::SetOutput),
            0x05 => Some(Command::Reboot),
            0x06 => Some(Command::Setup),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::SetColor => "setcolor",
            Command::SetMode => "setmode",
            Command::Ota => "ota",
            Command::Version => "version",
            Command::SetOutput => "setoutput",
            Command::Reboot => "reboot",
            Command::Setup => "setup",
        };
        f.write_str(name)
    }
}

/// Operating mode carried by a `setmode` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    Guest = 0x01,
    Teacher = 0x02,
}

impl Mode {
    pub const fn code(self) -> u8 {
        self as u8
    }
}
