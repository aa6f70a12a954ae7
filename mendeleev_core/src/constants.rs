pub mod wire_constants {
    /// Preamble byte, repeated ahead of every frame on the wire.
    pub const PREAMBLE_BYTE: u8 = 0xA5;
    /// Number of preamble repetitions.
    pub const PREAMBLE_LENGTH: usize = 8;
    /// Header and CRC bytes around the payload, preamble excluded.
    pub const FRAME_OVERHEAD: usize = 9;
    /// Size of the CRC field in bytes.
    pub const CRC_SIZE: usize = 2;
    /// Upper bound on a full frame, preamble included.
    pub const MAX_FRAME_SIZE: usize = 240;
    /// Payload bytes that fit in a single frame.
    pub const MAX_PAYLOAD: usize = MAX_FRAME_SIZE - PREAMBLE_LENGTH - FRAME_OVERHEAD;
}

pub mod address_constants {
    /// The controlling host. It originates every request on the bus.
    pub const MASTER: u8 = 0x00;
    /// All elements listen on this address; broadcasts get no reply.
    pub const BROADCAST: u8 = 0xFF;
    /// Lowest element address (hydrogen).
    pub const FIRST_ELEMENT: u8 = 1;
    /// Highest element address (oganesson).
    pub const NUM_ELEMENTS: u8 = 118;
}

pub mod setup_constants {
    /// Put every unaddressed element into setup mode.
    pub const ENTER: u8 = 0x00;
    /// Element-originated: "I have been touched, assign me next".
    pub const READY: u8 = 0x01;
    /// Assign the address carried in the following payload byte.
    pub const ASSIGN: u8 = 0x02;
    /// Leave setup mode.
    pub const EXIT: u8 = 0x03;
}
