//! Packet state machine driving the serial-link slave.

use std::mem;

use crate::protocol::{
    Command, PrintInstruction, PACKET_TIMEOUT_MS, PRINT_INSTRUCTION_LEN, SYNC_BYTES,
};
use crate::ring::PayloadRing;
use crate::shifter::{BitShifter, TransferMode};
use crate::status::{StatusModel, StatusRegister};
use crate::sync::PreambleScanner;

/// Default payload buffer capacity in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Firmware-style build options, surfaced as construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct LinkConfig {
    /// Payload ring capacity in bytes.
    pub buffer_capacity: usize,
    /// Verify packet checksums and report mismatches via the status bit.
    pub use_checksum: bool,
    /// Hold each packet's payload bytes provisionally and commit them only
    /// once its checksum verifies, so a master's retransmit wins.
    pub stage_on_checksum: bool,
    /// Divert raw wire observations into the payload ring for debugging.
    pub raw_dump: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            use_checksum: false,
            stage_on_checksum: false,
            raw_dump: false,
        }
    }
}

/// Decode stage of the in-flight packet. Every packet visits the five stages
/// in order exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PacketState {
    /// Command and compression bytes.
    Header1,
    /// Data length, little-endian.
    Header2,
    Payload,
    Checksum,
    /// Two-byte window in which the slave answers with device ID and status.
    Dummy,
}

/// The serial-link slave engine of a virtual Game Boy Printer.
///
/// Feed clock edges from the edge context via [`Self::on_edge`] (dual-edge
/// ISRs) or [`Self::on_rising`] (rising-edge-only ISRs). From the foreground,
/// drain payload bytes and notification latches, and call [`Self::tick`] to
/// advance the packet timeout. The edge path performs no allocation, no
/// locking and no logging; its worst case is one state transition plus a
/// ring-buffer enqueue.
#[derive(Debug)]
pub struct PrinterLink {
    cfg: LinkConfig,
    shifter: BitShifter,
    scanner: PreambleScanner,
    ring: PayloadRing,
    status: StatusModel,

    state: PacketState,
    command: u8,
    compression: u8,
    data_length: u16,
    data_index: u16,
    received_checksum: u16,
    computed_checksum: u16,
    checksum_ok: bool,
    instruction: [u8; PRINT_INSTRUCTION_LEN],
    print_seen: bool,

    timeout_ms: u32,
    break_pending: bool,

    init_received: bool,
    data_packet_received: bool,
    data_end_received: bool,
    print_received: bool,
    break_received: bool,
    inquiry_received: bool,
    packet_completed: bool,
}

impl PrinterLink {
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    pub fn with_config(cfg: LinkConfig) -> Self {
        link_log!(
            Trace,
            target: "gbprint::engine",
            "link engine up, {} byte payload buffer",
            cfg.buffer_capacity
        );
        Self {
            ring: PayloadRing::new(cfg.buffer_capacity),
            cfg,
            shifter: BitShifter::new(),
            scanner: PreambleScanner::new(),
            status: StatusModel::new(),
            state: PacketState::Header1,
            command: 0,
            compression: 0,
            data_length: 0,
            data_index: 0,
            received_checksum: 0,
            computed_checksum: 0,
            checksum_ok: true,
            instruction: [0; PRINT_INSTRUCTION_LEN],
            print_seen: false,
            timeout_ms: 0,
            break_pending: false,
            init_received: false,
            data_packet_received: false,
            data_end_received: false,
            print_received: false,
            break_received: false,
            inquiry_received: false,
            packet_completed: false,
        }
    }

    /// Dual-edge ISR entry point: deliver every observed clock transition.
    /// `clock_level` is the line level after the transition, so true means a
    /// rising edge. Returns the level to hold on the slave-output line until
    /// the next call.
    pub fn on_edge(&mut self, clock_level: bool, data_in: bool) -> bool {
        if !self.scanner.synchronised() {
            // Bits clock in on the rising edge; falling edges carry nothing.
            if clock_level && self.scanner.push(data_in) {
                self.begin_packet();
            }
            return self.shifter.out_level();
        }
        if clock_level {
            if self.shifter.active() && self.shifter.sample(data_in) {
                self.finish_transfer();
            }
        } else {
            self.shifter.drive();
        }
        self.shifter.out_level()
    }

    /// Rising-edge-only ISR entry point. The next TX bit is pre-computed
    /// after every sample so it is on the line well before the master's next
    /// rising edge.
    pub fn on_rising(&mut self, data_in: bool) -> bool {
        if !self.scanner.synchronised() {
            if self.scanner.push(data_in) {
                self.begin_packet();
            }
            return self.shifter.out_level();
        }
        if self.shifter.active() {
            if self.shifter.sample(data_in) {
                self.finish_transfer();
            }
            self.shifter.drive();
        }
        self.shifter.out_level()
    }

    /// Advance the packet timeout by `elapsed_ms` and apply any pending
    /// BREAK. Returns true iff the engine reset.
    pub fn tick(&mut self, elapsed_ms: u32) -> bool {
        if self.break_pending {
            self.break_pending = false;
            link_log!(Info, target: "gbprint::engine", "break packet received, resetting link");
            self.reset();
            return true;
        }
        if self.timeout_ms > 0 {
            self.timeout_ms = self.timeout_ms.saturating_sub(elapsed_ms);
            if self.timeout_ms == 0 {
                link_log!(Warn, target: "gbprint::engine", "mid-packet timeout, resetting link");
                self.reset();
                return true;
            }
        }
        false
    }

    /// Return the engine to its post-construction state: preamble scan armed,
    /// all status bits clear, payload buffer empty. Notification latches are
    /// left for the consumer to drain.
    pub fn reset(&mut self) {
        self.shifter.begin(TransferMode::Idle, 0);
        self.scanner.rearm();
        self.state = PacketState::Header1;
        self.command = 0;
        self.compression = 0;
        self.data_length = 0;
        self.data_index = 0;
        self.received_checksum = 0;
        self.computed_checksum = 0;
        self.checksum_ok = true;
        self.status.reset();
        self.ring.clear();
        self.timeout_ms = 0;
        self.break_pending = false;
    }

    /// Committed payload bytes waiting for the consumer.
    pub fn available(&self) -> usize {
        self.ring.len()
    }

    /// Dequeue one payload byte. Draining the buffer empty clears the
    /// unprocessed-data status bit.
    pub fn take_byte(&mut self) -> Option<u8> {
        let byte = self.ring.pop()?;
        if self.ring.is_empty() {
            self.status.reg.set_unprocessed_data(false);
        }
        Some(byte)
    }

    /// Committed payload byte at `offset` from the queue front, without
    /// dequeuing.
    pub fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.ring.peek(offset)
    }

    /// Read and clear the INIT notification.
    pub fn consume_init_received(&mut self) -> bool {
        mem::take(&mut self.init_received)
    }

    /// Read and clear the non-empty DATA notification.
    pub fn consume_data_received(&mut self) -> bool {
        mem::take(&mut self.data_packet_received)
    }

    /// Read and clear the zero-length DATA (end sentinel) notification.
    pub fn consume_data_end_received(&mut self) -> bool {
        mem::take(&mut self.data_end_received)
    }

    /// Read and clear the PRINT notification.
    pub fn consume_print_received(&mut self) -> bool {
        mem::take(&mut self.print_received)
    }

    /// Read and clear the BREAK notification.
    pub fn consume_break_received(&mut self) -> bool {
        mem::take(&mut self.break_received)
    }

    /// Read and clear the INQUIRY notification.
    pub fn consume_inquiry_received(&mut self) -> bool {
        mem::take(&mut self.inquiry_received)
    }

    /// Read and clear the packet-completed latch, raised at the end of every
    /// Dummy phase.
    pub fn consume_packet_completed(&mut self) -> bool {
        mem::take(&mut self.packet_completed)
    }

    /// Instruction bytes of the most recent PRINT packet, once one has
    /// arrived.
    pub fn print_instruction(&self) -> Option<PrintInstruction> {
        self.print_seen
            .then(|| PrintInstruction::new(self.instruction))
    }

    /// Live status bits (read side of the override surface).
    pub fn status(&self) -> &StatusRegister {
        &self.status.reg
    }

    /// Mutable status bits (write side of the override surface); writes take
    /// effect on the next Dummy transmission.
    pub fn status_mut(&mut self) -> &mut StatusRegister {
        &mut self.status.reg
    }

    /// Full 16-bit device/status word.
    pub fn status_word(&self) -> u16 {
        self.status.reg.word()
    }

    /// Whether the preamble has been seen for the in-flight packet.
    pub fn is_synchronised(&self) -> bool {
        self.scanner.synchronised()
    }

    pub fn data_packets_remaining(&self) -> u8 {
        self.status.data_packets_remaining()
    }

    pub fn untransmitted_remaining(&self) -> u8 {
        self.status.untransmitted_remaining()
    }

    pub fn busy_packets_remaining(&self) -> u8 {
        self.status.busy_remaining()
    }

    fn begin_packet(&mut self) {
        self.state = PacketState::Header1;
        self.timeout_ms = PACKET_TIMEOUT_MS;
        self.shifter.begin(TransferMode::WordBe, 0);
    }

    /// One packet-state transition, run on the rising edge that completes a
    /// transfer. Must stay short: the master's next edge is only ever
    /// microseconds away.
    fn finish_transfer(&mut self) {
        if self.cfg.raw_dump {
            self.dump_transfer();
        }
        self.timeout_ms = PACKET_TIMEOUT_MS;
        match self.state {
            PacketState::Header1 => {
                let word = self.shifter.word();
                self.command = (word >> 8) as u8;
                self.compression = word as u8;
                self.computed_checksum = 0;
                self.state = PacketState::Header2;
                self.shifter.begin(TransferMode::WordLe, 0);
            }
            PacketState::Header2 => {
                self.data_length = self.shifter.word();
                self.data_index = 0;
                let has_payload = matches!(
                    Command::from_raw(self.command),
                    Some(Command::Data) | Some(Command::Print)
                ) && self.data_length != 0;
                if has_payload {
                    self.state = PacketState::Payload;
                    self.shifter.begin(TransferMode::Byte, 0);
                } else {
                    self.state = PacketState::Checksum;
                    self.shifter.begin(TransferMode::WordLe, 0);
                }
            }
            PacketState::Payload => {
                let byte = self.shifter.byte();
                match Command::from_raw(self.command) {
                    Some(Command::Data) if !self.cfg.raw_dump => {
                        self.enqueue_payload(byte);
                    }
                    Some(Command::Print) => {
                        // Oversized PRINT payloads are consumed in full but
                        // only the instruction bytes are recorded.
                        if (self.data_index as usize) < PRINT_INSTRUCTION_LEN {
                            self.instruction[self.data_index as usize] = byte;
                        }
                    }
                    _ => {}
                }
                self.computed_checksum = self.computed_checksum.wrapping_add(byte as u16);
                self.data_index += 1;
                if self.data_index >= self.data_length {
                    self.state = PacketState::Checksum;
                    self.shifter.begin(TransferMode::WordLe, 0);
                } else {
                    self.shifter.begin(TransferMode::Byte, 0);
                }
            }
            PacketState::Checksum => {
                self.received_checksum = self.shifter.word();
                self.computed_checksum = self
                    .computed_checksum
                    .wrapping_add(self.command as u16)
                    .wrapping_add(self.compression as u16)
                    .wrapping_add(self.data_length >> 8)
                    .wrapping_add(self.data_length & 0xFF);
                self.checksum_ok = self.received_checksum == self.computed_checksum;
                // The error bit latches until a full reset; the master is
                // expected to retransmit when it sees it.
                if self.cfg.use_checksum && !self.checksum_ok {
                    self.status.reg.set_checksum_error(true);
                }
                match Command::from_raw(self.command) {
                    Some(Command::Init) => self.status.on_init(),
                    Some(Command::Print) => self.status.on_print(),
                    Some(Command::Data) => self.status.on_data(),
                    Some(Command::Break) => {
                        // BREAK clears every bit, then runs the same countdown
                        // step an INQUIRY would.
                        self.status.reg.clear_all();
                        self.status.step_inquiry();
                    }
                    Some(Command::Inquiry) => self.status.step_inquiry(),
                    None => {}
                }
                self.state = PacketState::Dummy;
                self.shifter.begin(TransferMode::WordBe, self.status.reg.word());
            }
            PacketState::Dummy => {
                match Command::from_raw(self.command) {
                    Some(Command::Data) => self.status.settle_data(self.data_length == 0),
                    Some(Command::Inquiry) => self.status.settle_inquiry(),
                    _ => {}
                }
                if self.cfg.stage_on_checksum {
                    if self.checksum_ok {
                        self.ring.commit();
                    } else {
                        // The master retransmits on checksum error; drop the
                        // bad copy so the retransmit wins.
                        self.ring.discard_staged();
                    }
                }
                // Latches are raised only once the packet's bytes are
                // committed.
                match Command::from_raw(self.command) {
                    Some(Command::Init) => self.init_received = true,
                    Some(Command::Print) => {
                        self.print_received = true;
                        self.print_seen = true;
                    }
                    Some(Command::Data) => {
                        if self.data_length > 0 {
                            self.data_packet_received = true;
                        } else {
                            self.data_end_received = true;
                        }
                    }
                    Some(Command::Break) => {
                        self.break_received = true;
                        // The reset itself runs from the foreground tick.
                        self.break_pending = true;
                    }
                    Some(Command::Inquiry) => self.inquiry_received = true,
                    None => {}
                }
                self.state = PacketState::Header1;
                self.shifter.begin(TransferMode::Idle, 0);
                self.scanner.rearm();
                self.packet_completed = true;
            }
        }
    }

    fn enqueue_payload(&mut self, byte: u8) {
        if self.cfg.stage_on_checksum {
            self.ring.stage(byte);
        } else {
            self.ring.push(byte);
        }
    }

    /// Mirror the completed transfer into the ring in wire order. The Dummy
    /// window carries the slave's response, so its transmitted bytes are
    /// dumped instead of the master's.
    fn dump_transfer(&mut self) {
        if self.state == PacketState::Header1 {
            for byte in SYNC_BYTES {
                self.enqueue_payload(byte);
            }
        }
        match self.shifter.mode() {
            TransferMode::Byte => {
                let byte = self.shifter.byte();
                self.enqueue_payload(byte);
            }
            TransferMode::WordBe | TransferMode::WordLe => {
                let word = if self.state == PacketState::Dummy {
                    self.shifter.wire_tx()
                } else {
                    self.shifter.wire_rx()
                };
                self.enqueue_payload((word >> 8) as u8);
                self.enqueue_payload(word as u8);
            }
            TransferMode::Idle => {}
        }
    }
}

impl Default for PrinterLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_byte(link: &mut PrinterLink, byte: u8) {
        for i in (0..8).rev() {
            let bit = byte & (1 << i) != 0;
            link.on_edge(false, bit);
            link.on_edge(true, bit);
        }
    }

    #[test]
    fn sync_word_arms_the_header_transfer() {
        let mut link = PrinterLink::new();
        assert!(!link.is_synchronised());
        feed_byte(&mut link, 0x88);
        assert!(!link.is_synchronised());
        feed_byte(&mut link, 0x33);
        assert!(link.is_synchronised());
    }

    #[test]
    fn timeout_only_runs_mid_packet() {
        let mut link = PrinterLink::new();
        // No packet in flight: ticks never reset.
        assert!(!link.tick(10_000));

        feed_byte(&mut link, 0x88);
        feed_byte(&mut link, 0x33);
        assert!(!link.tick(PACKET_TIMEOUT_MS - 1));
        assert!(link.tick(1));
        assert!(!link.is_synchronised());
    }

    #[test]
    fn each_transfer_refills_the_timeout() {
        let mut link = PrinterLink::new();
        feed_byte(&mut link, 0x88);
        feed_byte(&mut link, 0x33);
        assert!(!link.tick(PACKET_TIMEOUT_MS - 1));
        // Completing the header transfer rearms the full window.
        feed_byte(&mut link, 0x01);
        feed_byte(&mut link, 0x00);
        assert!(!link.tick(PACKET_TIMEOUT_MS - 1));
        assert!(link.tick(1));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut link = PrinterLink::new();
        feed_byte(&mut link, 0x88);
        feed_byte(&mut link, 0x33);
        feed_byte(&mut link, 0x04);
        link.status_mut().set_paper_jam(true);

        link.reset();
        let word = link.status_word();
        let synced = link.is_synchronised();
        let avail = link.available();
        link.reset();
        assert_eq!(link.status_word(), word);
        assert_eq!(link.is_synchronised(), synced);
        assert_eq!(link.available(), avail);
        assert_eq!(word, 0x8100);
    }

    #[test]
    fn external_status_writes_survive_until_transmission() {
        let mut link = PrinterLink::new();
        link.status_mut().set_low_battery(true);
        assert!(link.status().low_battery());
        assert_eq!(link.status_word(), 0x8180);
    }
}
