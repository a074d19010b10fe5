//! Wire-level constants and types for the Game Boy Printer packet protocol.
//!
//! Every packet on the link is framed as
//! `88 33 | command | compression | length (LE) | payload | checksum (LE) |
//! dummy dummy`. The two dummy bytes are the window in which the slave
//! answers with its device ID and status byte.

/// Two-byte magic framing every packet, observed MSB-first on the wire.
pub const SYNC_WORD: u16 = 0x8833;

/// The sync word in wire order.
pub const SYNC_BYTES: [u8; 2] = [0x88, 0x33];

/// Fixed device ID transmitted as the high byte of every status word.
pub const DEVICE_ID: u8 = 0x81;

/// Milliseconds of mid-packet silence before the engine resets itself.
pub const PACKET_TIMEOUT_MS: u32 = 5000;

/// Size of a PRINT packet's instruction payload.
pub const PRINT_INSTRUCTION_LEN: usize = 4;

/// Command byte of a packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Init = 0x01,
    Print = 0x02,
    Data = 0x04,
    Break = 0x08,
    Inquiry = 0x0F,
}

impl Command {
    /// Decode a raw command byte. Unknown commands still move the packet
    /// decoder through length and checksum, so `None` is not an error.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Command::Init),
            0x02 => Some(Command::Print),
            0x04 => Some(Command::Data),
            0x08 => Some(Command::Break),
            0x0F => Some(Command::Inquiry),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// The four instruction bytes of a PRINT packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrintInstruction {
    bytes: [u8; PRINT_INSTRUCTION_LEN],
}

impl PrintInstruction {
    pub(crate) fn new(bytes: [u8; PRINT_INSTRUCTION_LEN]) -> Self {
        Self { bytes }
    }

    pub fn num_of_sheets(&self) -> u8 {
        self.bytes[0]
    }

    /// Linefeeds fed before the sheet prints (high nibble of byte 1).
    pub fn linefeed_before(&self) -> u8 {
        self.bytes[1] >> 4
    }

    /// Linefeeds fed after the sheet prints (low nibble of byte 1).
    pub fn linefeed_after(&self) -> u8 {
        self.bytes[1] & 0x0F
    }

    pub fn palette(&self) -> u8 {
        self.bytes[2]
    }

    pub fn density(&self) -> u8 {
        self.bytes[3]
    }

    pub fn raw(&self) -> [u8; PRINT_INSTRUCTION_LEN] {
        self.bytes
    }
}

/// Mod-65536 sum of the command, compression, length and payload bytes. The
/// sync word is excluded.
pub fn packet_checksum(command: u8, compression: u8, payload: &[u8]) -> u16 {
    let length = payload.len() as u16;
    let mut sum = (command as u16)
        .wrapping_add(compression as u16)
        .wrapping_add(length & 0xFF)
        .wrapping_add(length >> 8);
    for &byte in payload {
        sum = sum.wrapping_add(byte as u16);
    }
    sum
}

/// Assemble a master-side wire packet: sync word, header, length (LE),
/// payload, checksum (LE) and the two dummy bytes the slave answers in.
pub fn build_packet(command: Command, compression: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u16;
    let checksum = packet_checksum(command.raw(), compression, payload);
    let mut buf = Vec::with_capacity(10 + payload.len());
    buf.extend_from_slice(&SYNC_BYTES);
    buf.push(command.raw());
    buf.push(compression);
    buf.push((length & 0xFF) as u8);
    buf.push((length >> 8) as u8);
    buf.extend_from_slice(payload);
    buf.push((checksum & 0xFF) as u8);
    buf.push((checksum >> 8) as u8);
    buf.push(0x00);
    buf.push(0x00);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_raw_values() {
        for cmd in [
            Command::Init,
            Command::Print,
            Command::Data,
            Command::Break,
            Command::Inquiry,
        ] {
            assert_eq!(Command::from_raw(cmd.raw()), Some(cmd));
        }
        assert_eq!(Command::from_raw(0x00), None);
        assert_eq!(Command::from_raw(0x3F), None);
    }

    #[test]
    fn checksum_covers_header_and_payload() {
        // PRINT with the canonical 4-byte instruction 01 03 E4 40.
        let sum = packet_checksum(0x02, 0x00, &[0x01, 0x03, 0xE4, 0x40]);
        assert_eq!(sum, 0x012E);
    }

    #[test]
    fn build_packet_frames_an_init() {
        let packet = build_packet(Command::Init, 0x00, &[]);
        assert_eq!(
            packet,
            vec![0x88, 0x33, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn print_instruction_splits_linefeed_nibbles() {
        let instr = PrintInstruction::new([0x01, 0x13, 0xE4, 0x40]);
        assert_eq!(instr.num_of_sheets(), 1);
        assert_eq!(instr.linefeed_before(), 1);
        assert_eq!(instr.linefeed_after(), 3);
        assert_eq!(instr.palette(), 0xE4);
        assert_eq!(instr.density(), 0x40);
    }
}
