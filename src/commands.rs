//! Typed bootloader commands.
//!
//! Every command validates its arguments before anything is framed, so a
//! [`ProtocolError::Validation`] always means nothing was sent.

use std::convert::TryFrom;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::chip::{format_mac, Chip, SecurityInfo, CHIP_DETECT_MAGIC_REG};
use crate::connection::Connection;
use crate::error::{ProtocolError, Result};
use crate::packet::{checksum, words, Command, LoaderMode, Opcode};
use crate::settings::Settings;
use crate::stub::StubImage;

/// Largest block accepted by MEM_DATA.
pub const MAX_RAM_BLOCK: usize = 0x1800;

/// What the stub sends once it runs.
pub const STUB_GREETING: &[u8] = b"OHAI";

/// Pause after switching the local baud rate, letting the UART settle.
const BAUD_SETTLE: Duration = Duration::from_millis(50);

// =============================================================================
// Public Interface
// =============================================================================

/// The SYNC payload: `07 07 12 20` followed by 32 times `0x55`.
pub fn sync_payload() -> Vec<u8> {
    let mut payload = vec![0x07, 0x07, 0x12, 0x20];
    payload.extend_from_slice(&[0x55; 32]);
    payload
}

/// Command library over a [`Connection`], using the time budgets of
/// [`Settings`].
///
/// Starting the stub and switching the baud rate change what the session
/// knows about the link, so those two only run through the
/// [`Session`](crate::Session).
pub struct Commands<'a> {
    connection: &'a mut Connection,
    settings: &'a Settings,
}

impl<'a> Commands<'a> {
    pub fn new(connection: &'a mut Connection, settings: &'a Settings) -> Self {
        Commands {
            connection,
            settings,
        }
    }

    /// One SYNC exchange. The ROM loader answers a single SYNC with several
    /// responses; the extra ones are drained before returning.
    pub fn sync(&mut self) -> Result<()> {
        let command = Command::new(Opcode::Sync, sync_payload());
        self.connection.command(&command, self.settings.sync_timeout)?;
        self.connection.drain(self.settings.sync_timeout)?;
        Ok(())
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        let command = Command::new(Opcode::ReadReg, words(&[address]));
        let response = self
            .connection
            .command(&command, self.settings.command_timeout)?;
        debug!("READ_REG 0x{:08x} = 0x{:08x}", address, response.value);
        Ok(response.value)
    }

    /// Write `value` to the bits of `address` selected by `mask`, then wait
    /// `delay_us` on the chip side.
    pub fn write_reg(&mut self, address: u32, value: u32, mask: u32, delay_us: u32) -> Result<()> {
        let command = Command::new(Opcode::WriteReg, words(&[address, value, mask, delay_us]));
        self.connection
            .command(&command, self.settings.command_timeout)?;
        Ok(())
    }

    /// Announce an upload of `size` bytes to RAM at `address`, sent as
    /// `blocks` blocks of `block_size` bytes.
    pub fn mem_begin(&mut self, size: u32, blocks: u32, block_size: u32, address: u32) -> Result<()> {
        if block_size == 0 || block_size as usize > MAX_RAM_BLOCK {
            return Err(ProtocolError::Validation(format!(
                "block size {} outside 1..={}",
                block_size, MAX_RAM_BLOCK
            )));
        }
        let expected = (u64::from(size) + u64::from(block_size) - 1) / u64::from(block_size);
        if u64::from(blocks) != expected {
            return Err(ProtocolError::Validation(format!(
                "{} bytes in blocks of {} need {} blocks, not {}",
                size, block_size, expected, blocks
            )));
        }

        let command = Command::new(Opcode::MemBegin, words(&[size, blocks, block_size, address]));
        self.connection
            .command(&command, self.settings.stub_timeout)?;
        Ok(())
    }

    /// Send block number `sequence` of a RAM upload.
    pub fn mem_data(&mut self, data: &[u8], sequence: u32) -> Result<()> {
        if data.is_empty() || data.len() > MAX_RAM_BLOCK {
            return Err(ProtocolError::Validation(format!(
                "MEM_DATA block of {} bytes outside 1..={}",
                data.len(),
                MAX_RAM_BLOCK
            )));
        }

        let mut payload = words(&[data.len() as u32, sequence, 0, 0]);
        payload.extend_from_slice(data);
        let command = Command::new(Opcode::MemData, payload).with_value(checksum(data));
        self.connection
            .command(&command, self.settings.stub_timeout)?;
        Ok(())
    }

    /// Finish a RAM upload, jumping to `entry` when given.
    pub fn mem_end(&mut self, entry: Option<u32>) -> Result<()> {
        let (no_entry, entry) = match entry {
            Some(entry) => (0, entry),
            None => (1, 0),
        };
        let command = Command::new(Opcode::MemEnd, words(&[no_entry, entry]));
        self.connection
            .command(&command, self.settings.stub_timeout)?;
        Ok(())
    }

    /// MEM_BEGIN followed by as many MEM_DATA as needed. `progress` is called
    /// with the bytes sent so far and the total after every block.
    pub fn upload_to_ram(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        if data.is_empty() {
            return Err(ProtocolError::Validation("nothing to upload".into()));
        }

        let (size, blocks) = ram_layout(data.len())?;
        debug!(
            "uploading {} bytes to 0x{:08x} in {} block(s)",
            size, address, blocks
        );
        self.mem_begin(size, blocks, MAX_RAM_BLOCK as u32, address)?;

        let mut sent = 0;
        for (sequence, block) in data.chunks(MAX_RAM_BLOCK).enumerate() {
            self.mem_data(block, sequence as u32)?;
            sent += block.len();
            progress(sent, data.len());
        }
        Ok(())
    }

    /// Upload every segment of `stub`, start it and wait for its greeting.
    /// On success the connection talks stub semantics.
    pub(crate) fn run_stub(&mut self, stub: &StubImage, progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
        if stub.is_empty() {
            return Err(ProtocolError::Validation("stub image is empty".into()));
        }

        let total = stub.len();
        let mut uploaded = 0;
        for segment in stub.segments() {
            self.upload_to_ram(segment.address, &segment.data, &mut |sent: usize, _: usize| {
                progress(uploaded + sent, total)
            })?;
            uploaded += segment.data.len();
        }

        info!("Starting the stub at 0x{:08x}", stub.entry);
        self.mem_end(Some(stub.entry))?;
        self.await_greeting()?;
        self.connection.set_mode(LoaderMode::Stub);
        Ok(())
    }

    /// Ask the loader to switch to `new_baud` and follow it locally.
    ///
    /// The loader may switch before its acknowledgement has left at the old
    /// rate, so the local side switches right after sending. A lost or
    /// garbled acknowledgement is logged and otherwise ignored.
    pub(crate) fn change_baud(&mut self, new_baud: u32, current_baud: u32) -> Result<()> {
        if new_baud == 0 {
            return Err(ProtocolError::Validation("baud rate must be positive".into()));
        }

        let prior = match self.connection.mode() {
            LoaderMode::Rom => 0,
            LoaderMode::Stub => current_baud,
        };
        let command = Command::new(Opcode::ChangeBaudrate, words(&[new_baud, prior]));
        self.connection.write_command(&command)?;
        self.connection.transport().set_baud(new_baud)?;
        thread::sleep(BAUD_SETTLE);

        match self
            .connection
            .await_response(Opcode::ChangeBaudrate, self.settings.command_timeout)
        {
            Ok(_) => {}
            Err(e @ ProtocolError::Timeout { .. }) | Err(e @ ProtocolError::Framing(_)) => {
                warn!("No usable acknowledgement of the baud change ({}), carrying on", e);
                self.connection.clear_input();
            }
            Err(e) => return Err(e),
        }
        info!("Link switched from {} to {} baud", current_baud, new_baud);
        Ok(())
    }

    pub fn security_info(&mut self) -> Result<SecurityInfo> {
        let command = Command::new(Opcode::GetSecurityInfo, vec![]);
        let response = self
            .connection
            .command(&command, self.settings.identity_timeout)?;
        SecurityInfo::try_from(&response.data[..])
    }

    /// Read the detection magic and look it up.
    pub fn detect_chip(&mut self) -> Result<(u32, Option<Chip>)> {
        let magic = self.read_reg(CHIP_DETECT_MAGIC_REG)?;
        let chip = Chip::from_magic(magic);
        debug!("chip magic 0x{:08x} -> {:?}", magic, chip);
        Ok((magic, chip))
    }

    /// Read and format the factory MAC of `chip`.
    pub fn read_mac(&mut self, chip: Chip) -> Result<String> {
        let (low, high) = chip.mac_registers();
        let low = self.read_reg(low)?;
        let high = self.read_reg(high)?;
        Ok(format_mac(high, low))
    }

    // -------------------------------------------------------------------------

    fn await_greeting(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.stub_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self.connection.await_frame(remaining)? {
                Some(frame) => frame,
                None => return Err(ProtocolError::Timeout { opcode: Opcode::MemEnd }),
            };
            if frame == STUB_GREETING {
                debug!("stub says hello");
                return Ok(());
            }
            if self.settings.strict_correlation {
                return Err(ProtocolError::InvalidResponse(format!(
                    "expected the stub greeting, received {:02x?}",
                    frame
                )));
            }
            debug!("discarding {} byte frame while waiting for the stub", frame.len());
        }
    }
}

/// Size and block count of a RAM upload of `len` bytes, as sent in MEM_BEGIN.
fn ram_layout(len: usize) -> Result<(u32, u32)> {
    let size = u32::try_from(len).map_err(|_| {
        ProtocolError::Validation(format!("{} bytes do not fit a RAM upload", len))
    })?;
    let blocks = (size as usize + MAX_RAM_BLOCK - 1) / MAX_RAM_BLOCK;
    Ok((size, blocks as u32))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
use crate::{
    error::ErrorKind,
    settings::SettingsBuilder,
    transport::{ScriptedTransport, Step, TransportCall},
};

#[cfg(test)]
fn test_settings() -> Settings {
    SettingsBuilder::new()
        .reset_on_connect(false)
        .sync_timeout(Duration::from_millis(20))
        .command_timeout(Duration::from_millis(100))
        .stub_timeout(Duration::from_millis(100))
        .identity_timeout(Duration::from_millis(100))
        .finalize()
}

#[cfg(test)]
fn connect(script: &ScriptedTransport) -> Connection {
    let mut connection = Connection::new(Box::new(script.clone()));
    connection.open(115_200).unwrap();
    connection
}

#[test]
fn sync_payload_layout() {
    let payload = sync_payload();
    assert_eq!(payload.len(), 36);
    assert_eq!(&payload[..4], &[0x07, 0x07, 0x12, 0x20]);
    assert!(payload[4..].iter().all(|b| *b == 0x55));
}

#[test]
fn read_reg_returns_value() {
    let script = ScriptedTransport::new(vec![Step::rom(Opcode::ReadReg, 0x9, &[])]);
    let mut connection = connect(&script);
    let settings = test_settings();

    let value = Commands::new(&mut connection, &settings)
        .read_reg(CHIP_DETECT_MAGIC_REG)
        .unwrap();
    assert_eq!(value, 0x9);
    match &script.calls()[1] {
        TransportCall::Write(packet) => assert_eq!(&packet[8..], &[0x00, 0x10, 0x00, 0x40]),
        other => panic!("unexpected call {:?}", other),
    }
}

#[test]
fn write_reg_payload() {
    let script = ScriptedTransport::new(vec![Step::rom(Opcode::WriteReg, 0, &[])]);
    let mut connection = connect(&script);
    let settings = test_settings();

    Commands::new(&mut connection, &settings)
        .write_reg(0x6000_0000, 0xAB, 0xFFFF_FFFF, 0)
        .unwrap();
    match &script.calls()[1] {
        TransportCall::Write(packet) => {
            assert_eq!(packet[2..4], [16, 0]);
            assert_eq!(&packet[8..], &words(&[0x6000_0000, 0xAB, 0xFFFF_FFFF, 0])[..]);
        }
        other => panic!("unexpected call {:?}", other),
    }
}

#[test]
fn mem_data_rejects_bad_sizes_without_sending() {
    let script = ScriptedTransport::new(vec![]);
    let mut connection = connect(&script);
    let settings = test_settings();
    let mut commands = Commands::new(&mut connection, &settings);

    let err = commands.mem_data(&[], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = commands.mem_data(&vec![0; MAX_RAM_BLOCK + 1], 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = commands.mem_begin(10, 1, 0, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = commands.mem_begin(0x2000, 1, 0x1800, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(script.calls(), vec![TransportCall::Open(115_200)]);
}

#[test]
fn mem_data_carries_checksum_and_header() {
    let script = ScriptedTransport::new(vec![Step::rom(Opcode::MemData, 0, &[])]);
    let mut connection = connect(&script);
    let settings = test_settings();

    Commands::new(&mut connection, &settings)
        .mem_data(&[1, 2, 4], 3)
        .unwrap();
    match &script.calls()[1] {
        TransportCall::Write(packet) => {
            assert_eq!(packet[4..8], (0xEF ^ 0x07u32).to_le_bytes());
            assert_eq!(&packet[8..24], &words(&[3, 3, 0, 0])[..]);
            assert_eq!(&packet[24..], &[1, 2, 4]);
        }
        other => panic!("unexpected call {:?}", other),
    }
}

#[test]
fn upload_splits_into_blocks_and_reports_progress() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::MemBegin, 0, &[]),
        Step::rom(Opcode::MemData, 0, &[]),
        Step::rom(Opcode::MemData, 0, &[]),
    ]);
    let mut connection = connect(&script);
    let settings = test_settings();

    let data = vec![0xAA; MAX_RAM_BLOCK + 16];
    let mut reports = vec![];
    Commands::new(&mut connection, &settings)
        .upload_to_ram(0x4038_0000, &data, &mut |done: usize, total: usize| reports.push((done, total)))
        .unwrap();

    assert_eq!(
        reports,
        vec![(MAX_RAM_BLOCK, data.len()), (data.len(), data.len())]
    );
    script.assert_no_pending_steps();
}

#[test]
fn run_stub_waits_for_greeting_and_switches_mode() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::MemBegin, 0, &[]),
        Step::rom(Opcode::MemData, 0, &[]),
        Step::rom(Opcode::MemEnd, 0, &[]),
        Step::Raw(STUB_GREETING.to_vec()),
    ]);
    let mut connection = connect(&script);
    let settings = test_settings();

    let stub = StubImage::new(0x4038_0400, 0x4038_0000, vec![0x11; 64]);
    Commands::new(&mut connection, &settings)
        .run_stub(&stub, &mut |_, _| {})
        .unwrap();

    assert_eq!(connection.mode(), LoaderMode::Stub);
    script.assert_no_pending_steps();
    assert_eq!(script.written_opcodes(), vec![0x05, 0x07, 0x06]);
}

#[test]
fn run_stub_without_greeting_times_out() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::MemBegin, 0, &[]),
        Step::rom(Opcode::MemData, 0, &[]),
        Step::rom(Opcode::MemEnd, 0, &[]),
    ]);
    let mut connection = connect(&script);
    let settings = test_settings();

    let stub = StubImage::new(0x4038_0400, 0x4038_0000, vec![0x11; 64]);
    let err = Commands::new(&mut connection, &settings)
        .run_stub(&stub, &mut |_, _| {})
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Timeout {
            opcode: Opcode::MemEnd
        }
    ));
    assert_eq!(connection.mode(), LoaderMode::Rom);
}

#[test]
fn change_baud_switches_locally_before_the_ack() {
    let script = ScriptedTransport::new(vec![Step::rom(Opcode::ChangeBaudrate, 0, &[])]);
    let mut connection = connect(&script);
    let settings = test_settings();

    Commands::new(&mut connection, &settings)
        .change_baud(921_600, 115_200)
        .unwrap();

    let calls = script.calls();
    match &calls[1] {
        TransportCall::Write(packet) => assert_eq!(&packet[8..], &words(&[921_600, 0])[..]),
        other => panic!("unexpected call {:?}", other),
    }
    assert_eq!(calls[2], TransportCall::SetBaud(921_600));
}

#[test]
fn change_baud_in_stub_mode_sends_prior_rate() {
    let script = ScriptedTransport::new(vec![Step::stub(Opcode::ChangeBaudrate, 0, &[])]);
    let mut connection = connect(&script);
    connection.set_mode(LoaderMode::Stub);
    let settings = test_settings();

    Commands::new(&mut connection, &settings)
        .change_baud(460_800, 115_200)
        .unwrap();
    match &script.calls()[1] {
        TransportCall::Write(packet) => assert_eq!(&packet[8..], &words(&[460_800, 115_200])[..]),
        other => panic!("unexpected call {:?}", other),
    }
}

#[test]
fn change_baud_tolerates_lost_ack() {
    let script = ScriptedTransport::new(vec![Step::timeout(Opcode::ChangeBaudrate)]);
    let mut connection = connect(&script);
    let settings = test_settings();

    assert!(Commands::new(&mut connection, &settings)
        .change_baud(921_600, 115_200)
        .is_ok());
    script.assert_no_pending_steps();
}

#[test]
fn change_baud_propagates_status_failure() {
    let script = ScriptedTransport::new(vec![Step::response(
        Opcode::ChangeBaudrate,
        0,
        &[],
        &[1, 0x05, 0, 0],
    )]);
    let mut connection = connect(&script);
    let settings = test_settings();

    let err = Commands::new(&mut connection, &settings)
        .change_baud(921_600, 115_200)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumOrStatus);
}

#[test]
fn mac_of_esp32s3() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::ReadReg, 0x1895_6b4c, &[]),
        Step::rom(Opcode::ReadReg, 0x0000_3485, &[]),
    ]);
    let mut connection = connect(&script);
    let settings = test_settings();

    let mac = Commands::new(&mut connection, &settings)
        .read_mac(Chip::Esp32s3)
        .unwrap();
    assert_eq!(mac, "34:85:18:95:6b:4c");
}

#[test]
fn ram_layout_rounds_up_and_rejects_oversized_uploads() {
    assert_eq!(ram_layout(1).unwrap(), (1, 1));
    assert_eq!(ram_layout(MAX_RAM_BLOCK).unwrap(), (MAX_RAM_BLOCK as u32, 1));
    assert_eq!(ram_layout(MAX_RAM_BLOCK + 1).unwrap(), (MAX_RAM_BLOCK as u32 + 1, 2));

    #[cfg(target_pointer_width = "64")]
    assert_eq!(
        ram_layout(u32::MAX as usize + 1).unwrap_err().kind(),
        ErrorKind::Validation
    );
}
