//! Life-cycle driver and public façade.

use crate::config::{ChecksumKind, ProtocolId};
use crate::models;
use crate::packet::{self, RxParser, RxState, SYNC_CHAR};
use crate::session::{CommConfig, McuInfo, SelectMode, Session, TrimResult};
use crate::transport::{Parity, Transport};
use crate::{Error, Result};

use byteorder::{BigEndian, ByteOrder};

/// Per-run programming options.
#[derive(Clone, Debug, Default)]
pub struct ProgramConfig {
    /// Override the 2400-baud status-exchange rate.
    pub baud_handshake: Option<u32>,
    /// Override the negotiated transfer rate.
    pub baud_transfer: Option<u32>,
    /// Desired run frequency for the calibrated families; the measured
    /// power-up frequency is kept when unset.
    pub target_frequency: Option<f64>,
    /// Also wipe the data EEPROM during erase.
    pub erase_eeprom: bool,
    /// Option bytes to commit after programming, in the family's layout.
    pub options: Option<Vec<u8>>,
}

/// Drives one target through connect → identify → program → disconnect.
///
/// Owns the transport for the whole session; create one per target. Not
/// reentrant: callbacks must not call back into the programmer or touch
/// the transport.
pub struct Programmer {
    session: Session,
    progress: Option<Box<dyn FnMut(u32, u32)>>,
}

impl Programmer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(transport),
            progress: None,
        }
    }

    /// Identify the family from the reported magic (default).
    pub fn set_mode_auto(&mut self) {
        self.session.select_mode = SelectMode::Auto;
    }

    /// Impose a protocol family, bypassing identification failures.
    pub fn set_mode_manual(&mut self, proto: ProtocolId) {
        self.session.select_mode = SelectMode::Manual(proto);
        self.session.bind(proto);
    }

    /// Called after every completed block with `(written, total)` bytes.
    pub fn on_progress(&mut self, callback: impl FnMut(u32, u32) + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// Solicit the bootloader and identify the target.
    ///
    /// Streams `0x7F` at a 30 ms cadence until the power-cycled target
    /// answers with its status frame, then derives clock and identity
    /// from it. `timeout_ms = 0` waits forever.
    pub fn connect(&mut self, timeout_ms: u32) -> Result<()> {
        self.session.reset();
        let baud = self.session.comm.baud_handshake;
        self.session.transport.set_baudrate(baud)?;
        self.session.transport.set_parity(Parity::None)?;
        self.session.transport.flush();

        let payload = self.wait_for_status(timeout_ms)?;
        self.identify(&payload)
    }

    fn wait_for_status(&mut self, timeout_ms: u32) -> Result<Vec<u8>> {
        let transport = &mut self.session.transport;
        let start = transport.tick_ms();
        let mut parser = RxParser::new();
        let mut chunk = [0u8; 64];

        loop {
            if timeout_ms > 0 && transport.tick_ms().wrapping_sub(start) >= timeout_ms {
                return Err(Error::Timeout);
            }
            let _ = transport.write(&[SYNC_CHAR], 100);
            transport.delay_ms(30);

            // Drain whatever the target has sent so far.
            loop {
                let n = match transport.read(&mut chunk, 10) {
                    Ok(0) | Err(Error::Timeout) => break,
                    Ok(n) => n,
                    Err(e) => return Err(e),
                };
                for &byte in &chunk[..n] {
                    match parser.push(byte) {
                        RxState::Complete => {
                            if let Some(payload) = Self::status_payload(parser.frame()) {
                                log::debug!("status frame {:02X?}", parser.frame());
                                return Ok(payload);
                            }
                            parser.reset();
                        }
                        RxState::Error => parser.reset(),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Validate a candidate status frame under either checksum width.
    ///
    /// The frame arrives before the family is known, so double-byte (the
    /// common case) is tried first and STC89's single-byte second.
    fn status_payload(frame: &[u8]) -> Option<Vec<u8>> {
        let info = packet::parse_frame(ChecksumKind::DoubleByte, frame)
            .or_else(|_| packet::parse_frame(ChecksumKind::SingleByte, frame))
            .ok()?;
        if info.payload.len() < 20 {
            return None;
        }
        Some(info.payload.to_vec())
    }

    fn identify(&mut self, payload: &[u8]) -> Result<()> {
        let magic = if payload.len() >= 22 {
            BigEndian::read_u16(&payload[20..22])
        } else {
            // A few variants report the magic two bytes earlier.
            BigEndian::read_u16(&payload[15..17])
        };
        self.session.mcu_info.magic = magic;

        if let Some(model) = models::find_model_by_magic(magic) {
            self.session.mcu_info.model_name = Some(model.name);
            self.session.mcu_info.flash_size = model.flash_size;
            self.session.mcu_info.eeprom_size = model.eeprom_size;
            if self.session.select_mode == SelectMode::Auto {
                self.session.bind(model.protocol);
            }
            log::info!("target {} (magic {magic:#06X})", model.name);
        } else if self.session.select_mode == SelectMode::Auto {
            log::warn!("magic {magic:#06X} not in the model database");
            return Err(Error::UnknownModel);
        }

        if let Ok(ops) = self.session.ops() {
            ops.parse_status_packet(&mut self.session, payload)?;
        }
        Ok(())
    }

    /// Fix the protocol family for the coming operations.
    ///
    /// Manual mode simply binds the imposed family. Auto mode re-derives
    /// it from the model name through the prefix matcher, covering parts
    /// whose magic row is missing but whose name is recognizable.
    pub fn select_protocol(&mut self) -> Result<()> {
        match self.session.select_mode {
            SelectMode::Manual(proto) => self.session.bind(proto),
            SelectMode::Auto => {
                let name = self.session.mcu_info.model_name.ok_or(Error::UnknownModel)?;
                let proto = models::match_protocol_by_name(name).ok_or(Error::UnknownModel)?;
                self.session.bind(proto);
            }
        }

        // The later bootloaders talk with even parity from here on;
        // STC89A instead flips mid-handshake, after its baud test.
        let config = self.session.config()?;
        if config.parity == Parity::Even && !config.parity_switch_after_handshake {
            self.session.transport.set_parity(Parity::Even)?;
        }
        Ok(())
    }

    /// Run the full programming cycle on `firmware`.
    ///
    /// Handshake, calibrate where the family requires it, erase, program
    /// in blocks, confirm, optionally write option bytes, disconnect. A
    /// failing step aborts the sequence after a best-effort disconnect.
    pub fn program(&mut self, firmware: &[u8], config: &ProgramConfig) -> Result<()> {
        if firmware.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.apply_overrides(config);
        let result = self.program_inner(firmware, config);
        self.finish_session(result)
    }

    fn program_inner(&mut self, firmware: &[u8], config: &ProgramConfig) -> Result<()> {
        let ops = self.session.ops()?;
        ops.handshake(&mut self.session)?;

        if self.session.config()?.needs_freq_calib {
            ops.calibrate_frequency(&mut self.session, config.target_frequency)?;
        }

        ops.erase_flash(&mut self.session, firmware.len() as u32)?;

        let block_size = self.session.config()?.block_size;
        let total = firmware.len() as u32;
        for_each_block(firmware, block_size, |addr, block, chunk_len, is_first| {
            ops.program_block(&mut self.session, addr, block, is_first)?;
            let written = addr + chunk_len as u32;
            log::debug!("programmed {written}/{total}");
            if let Some(callback) = self.progress.as_mut() {
                callback(written, total);
            }
            Ok(())
        })?;

        ops.program_finish(&mut self.session)?;

        if let Some(options) = &config.options {
            ops.set_options(&mut self.session, options)?;
        }
        Ok(())
    }

    /// Erase user flash without programming.
    // TODO: wire `erase_eeprom` into the erase command once its encoding
    // is verified on hardware; the flag is accepted and ignored for now.
    pub fn erase_only(&mut self, _erase_eeprom: bool) -> Result<()> {
        let result = self.erase_inner();
        self.finish_session(result)
    }

    fn erase_inner(&mut self) -> Result<()> {
        let ops = self.session.ops()?;
        ops.handshake(&mut self.session)?;
        if self.session.config()?.needs_freq_calib {
            ops.calibrate_frequency(&mut self.session, None)?;
        }
        let flash_size = self.session.mcu_info.flash_size;
        ops.erase_flash(&mut self.session, flash_size)
    }

    /// Write the family's option bytes outside a full programming run.
    pub fn set_options(&mut self, options: &[u8]) -> Result<()> {
        let ops = self.session.ops()?;
        ops.set_options(&mut self.session, options)
    }

    /// Tell the bootloader to leave programming mode. Not fatal if the
    /// target no longer listens.
    pub fn disconnect(&mut self) -> Result<()> {
        if let Ok(ops) = self.session.ops() {
            let _ = ops.disconnect(&mut self.session);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, config: &ProgramConfig) {
        if let Some(baud) = config.baud_handshake {
            self.session.comm.baud_handshake = baud;
        }
        if let Some(baud) = config.baud_transfer {
            self.session.comm.baud_transfer = baud;
        }
    }

    fn finish_session(&mut self, result: Result<()>) -> Result<()> {
        let _ = self.disconnect();
        result
    }

    /// Shared session state (MCU info, trim result, comm parameters).
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn mcu_info(&self) -> &McuInfo {
        self.session.mcu_info()
    }

    pub fn trim_result(&self) -> &TrimResult {
        self.session.trim_result()
    }

    pub fn detected_protocol(&self) -> Option<ProtocolId> {
        self.session.detected_protocol()
    }

    pub fn comm_config(&self) -> &CommConfig {
        self.session.comm_config()
    }

    pub fn comm_config_mut(&mut self) -> &mut CommConfig {
        self.session.comm_config_mut()
    }
}

/// Walk `firmware` in `block_size` steps, zero-padding the tail so every
/// visit sees a full block. The callback also receives the unpadded
/// chunk length for progress accounting.
fn for_each_block<F>(firmware: &[u8], block_size: usize, mut f: F) -> Result<()>
where
    F: FnMut(u32, &[u8], usize, bool) -> Result<()>,
{
    let mut block = vec![0u8; block_size];
    for (index, chunk) in firmware.chunks(block_size).enumerate() {
        let addr = (index * block_size) as u32;
        block.fill(0x00);
        block[..chunk.len()].copy_from_slice(chunk);
        f(addr, &block, chunk.len(), index == 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_frame;
    use crate::testing::{queue_read, MockTransport};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Status payload of an STC89C52RC running 11.0592 MHz in 12T mode:
    /// eight period counters of 2688, mode byte with bit 0 set, magic
    /// E002 at 20..21.
    fn stc89_status_payload() -> Vec<u8> {
        let mut payload = vec![0x50];
        for _ in 0..8 {
            payload.extend_from_slice(&2688u16.to_be_bytes());
        }
        payload.push(0x45); // 17: BSL version 4.5
        payload.push(b'A'); // 18: stepping
        payload.push(0x01); // 19: 12T mode
        payload.extend_from_slice(&[0xE0, 0x02]); // 20..21: magic
        payload
    }

    fn frame(kind: ChecksumKind, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        build_frame(kind, payload, &mut out);
        out
    }

    #[test]
    fn connect_identifies_an_stc89_target() {
        let (mock, state) = MockTransport::new();
        queue_read(&state, frame(ChecksumKind::SingleByte, &stc89_status_payload()));

        let mut programmer = Programmer::new(Box::new(mock));
        programmer.connect(5000).unwrap();

        let info = programmer.mcu_info();
        assert_eq!(info.magic, 0xE002);
        assert_eq!(info.model_name, Some("STC89C52RC"));
        assert_eq!(info.flash_size, 8192);
        assert!(!info.cpu_6t);
        assert_eq!(info.freq_counter, 2688);
        assert_eq!(info.clock_hz, 11_059_200.0);
        assert_eq!(programmer.detected_protocol(), Some(ProtocolId::Stc89));
        assert_eq!(state.borrow().bauds, vec![2400]);
        assert_eq!(state.borrow().parities, vec![Parity::None]);
    }

    #[test]
    fn connect_identifies_an_stc8g_target() {
        // STC8G1K08A, BSL 7.2 stepping C, counters of 2688.
        let mut payload = vec![0x50];
        for _ in 0..8 {
            payload.extend_from_slice(&2688u16.to_be_bytes());
        }
        payload.push(0x72); // 17
        payload.push(b'C'); // 18
        payload.push(0x00); // 19
        payload.extend_from_slice(&[0xF7, 0xA1]); // 20..21
        payload.push(0x00); // 22

        let (mock, state) = MockTransport::new();
        queue_read(&state, frame(ChecksumKind::DoubleByte, &payload));

        let mut programmer = Programmer::new(Box::new(mock));
        programmer.connect(5000).unwrap();
        programmer.select_protocol().unwrap();

        let info = programmer.mcu_info();
        assert_eq!(info.magic, 0xF7A1);
        assert_eq!(info.model_name, Some("STC8G1K08A"));
        assert_eq!(info.flash_size, 8192);
        assert_eq!(info.bsl_version_str, "7.2.0C");
        assert!(!info.cpu_6t);
        assert_eq!(programmer.detected_protocol(), Some(ProtocolId::Stc8));
    }

    #[test]
    fn connect_times_out_without_a_target() {
        let (mock, _state) = MockTransport::new();
        let mut programmer = Programmer::new(Box::new(mock));
        assert_eq!(programmer.connect(200).unwrap_err(), Error::Timeout);
    }

    #[test]
    fn connect_rejects_unknown_magic_in_auto_mode() {
        let mut payload = stc89_status_payload();
        payload[20] = 0x12;
        payload[21] = 0x34;
        let (mock, state) = MockTransport::new();
        queue_read(&state, frame(ChecksumKind::SingleByte, &payload));

        let mut programmer = Programmer::new(Box::new(mock));
        assert_eq!(programmer.connect(5000).unwrap_err(), Error::UnknownModel);
    }

    #[test]
    fn manual_mode_accepts_unknown_magic() {
        let mut payload = stc89_status_payload();
        payload[20] = 0x12;
        payload[21] = 0x34;
        let (mock, state) = MockTransport::new();
        queue_read(&state, frame(ChecksumKind::SingleByte, &payload));

        let mut programmer = Programmer::new(Box::new(mock));
        programmer.set_mode_manual(ProtocolId::Stc89);
        programmer.connect(5000).unwrap();
        programmer.select_protocol().unwrap();
        assert_eq!(programmer.mcu_info().magic, 0x1234);
        assert_eq!(programmer.mcu_info().model_name, None);
        assert_eq!(programmer.detected_protocol(), Some(ProtocolId::Stc89));
    }

    #[test]
    fn connect_survives_noise_before_the_status_frame() {
        let (mock, state) = MockTransport::new();
        queue_read(&state, vec![0x00, 0xFF, 0x46, 0x13]);
        queue_read(&state, frame(ChecksumKind::SingleByte, &stc89_status_payload()));

        let mut programmer = Programmer::new(Box::new(mock));
        programmer.connect(5000).unwrap();
        assert_eq!(programmer.mcu_info().magic, 0xE002);
    }

    /// Full STC89 programming cycle against a scripted target: verifies
    /// the exact transmit stream, baud switches and progress reporting.
    #[test]
    fn program_drives_the_whole_stc89_cycle() {
        let firmware: Vec<u8> = (0..200u32).map(|i| (i * 3 + 1) as u8).collect();
        let kind = ChecksumKind::SingleByte;
        let csum1 = crate::packet::checksum8(&firmware[..128]);
        let csum2 = crate::packet::checksum8(&firmware[128..]);

        let (mock, state) = MockTransport::new();
        queue_read(&state, frame(kind, &stc89_status_payload()));
        queue_read(&state, frame(kind, &[0x8F])); // baud test echo
        queue_read(&state, frame(kind, &[0x8E])); // baud commit echo
        for _ in 0..4 {
            queue_read(&state, frame(kind, &[0x80])); // ping-pong
        }
        queue_read(&state, frame(kind, &[0x80])); // erase done
        queue_read(&state, frame(kind, &[0x80, csum1]));
        queue_read(&state, frame(kind, &[0x80, csum2]));

        let progress = Rc::new(RefCell::new(Vec::new()));
        let seen = progress.clone();

        let mut programmer = Programmer::new(Box::new(mock));
        programmer.on_progress(move |current, total| seen.borrow_mut().push((current, total)));
        programmer.connect(5000).unwrap();
        programmer.select_protocol().unwrap();
        programmer
            .program(&firmware, &ProgramConfig::default())
            .unwrap();

        assert_eq!(*progress.borrow(), vec![(128, 200), (200, 200)]);

        // Reconstruct the expected transmit stream. BRT for 11.0592 MHz
        // in 12T mode is 0xFFFD; wait state 0x81.
        let mut expected = vec![SYNC_CHAR];
        let mut push = |payload: &[u8]| expected.extend_from_slice(&frame(kind, payload));
        push(&[0x8F, 0xFF, 0xFD, 0x00, 0x02, 0xA0, 0x81]);
        push(&[0x8E, 0xFF, 0xFD, 0x00, 0x02, 0xA0]);
        for _ in 0..4 {
            push(&[0x80, 0x00, 0x00, 0x36, 0x01, 0xE0, 0x02]);
        }
        push(&[0x84, 0x02, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33]);
        let mut block1 = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80];
        block1.extend_from_slice(&firmware[..128]);
        push(&block1);
        let mut block2 = vec![0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x80];
        block2.extend_from_slice(&firmware[128..]);
        block2.resize(7 + 128, 0x00);
        push(&block2);
        push(&[0x82]);

        assert_eq!(state.borrow().writes, expected);
        // Connect at 2400, baud test at 115200, back, commit at 115200.
        assert_eq!(state.borrow().bauds, vec![2400, 115_200, 2400, 115_200]);
    }

    #[test]
    fn failed_erase_still_sends_the_disconnect() {
        let kind = ChecksumKind::SingleByte;
        let (mock, state) = MockTransport::new();
        queue_read(&state, frame(kind, &stc89_status_payload()));
        queue_read(&state, frame(kind, &[0x8F]));
        queue_read(&state, frame(kind, &[0x8E]));
        for _ in 0..4 {
            queue_read(&state, frame(kind, &[0x80]));
        }
        // No erase reply scripted: the erase step times out.

        let mut programmer = Programmer::new(Box::new(mock));
        programmer.connect(5000).unwrap();
        programmer.select_protocol().unwrap();
        let err = programmer
            .program(&[0xAA; 16], &ProgramConfig::default())
            .unwrap_err();
        assert_eq!(err, Error::EraseFail);

        let disconnect = frame(kind, &[0x82]);
        let writes = state.borrow().writes.clone();
        assert!(writes.ends_with(&disconnect));
    }

    #[test]
    fn block_iteration_pads_the_tail_and_walks_addresses() {
        let firmware: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let mut calls: Vec<(u32, Vec<u8>, usize, bool)> = Vec::new();
        for_each_block(&firmware, 64, |addr, block, chunk_len, is_first| {
            calls.push((addr, block.to_vec(), chunk_len, is_first));
            Ok(())
        })
        .unwrap();

        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].0, calls[0].2, calls[0].3), (0, 64, true));
        assert_eq!((calls[1].0, calls[1].2, calls[1].3), (64, 36, false));
        assert_eq!(calls[1].1.len(), 64);
        assert_eq!(&calls[1].1[..36], &firmware[64..]);
        assert!(calls[1].1[36..].iter().all(|&b| b == 0x00));

        // An exact multiple produces full blocks and no extra call.
        let firmware = vec![0x55u8; 256];
        let mut count = 0;
        for_each_block(&firmware, 128, |addr, block, chunk_len, _| {
            assert_eq!(addr as usize, count * 128);
            assert_eq!((block.len(), chunk_len), (128, 128));
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
    }
}
