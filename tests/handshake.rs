//! End-to-end handshake scenarios replayed against scripted transcripts.

use std::time::{Duration, Instant};

use espcom::{
    Chip, ErrorKind, LoaderMode, Opcode, ProtocolError, ScriptedTransport, Session, SessionState,
    SettingsBuilder, Stage, StatusEvent, StatusRecorder, Step, StubImage, TransportCall,
};

const SYNC_TIMEOUT: Duration = Duration::from_millis(20);

fn settings() -> SettingsBuilder {
    SettingsBuilder::new()
        .reset_on_connect(false)
        .skip_stub(true)
        .sync_attempts(3)
        .retry_backoff(Duration::from_millis(0))
        .sync_timeout(SYNC_TIMEOUT)
        .command_timeout(Duration::from_millis(200))
        .stub_timeout(Duration::from_millis(200))
        .identity_timeout(Duration::from_millis(200))
}

/// A 20 byte GET_SECURITY_INFO answer with nothing burned.
fn security_info(chip_id: u32) -> Vec<u8> {
    let mut data = vec![0u8; 12];
    data.extend_from_slice(&chip_id.to_le_bytes());
    data.extend_from_slice(&3u32.to_le_bytes());
    data
}

/// Identity queries of an ESP32-S3 answering with `step`.
fn s3_identity(step: fn(Opcode, u32, &[u8]) -> Step) -> Vec<Step> {
    vec![
        step(Opcode::ReadReg, 0x9, &[]),
        step(Opcode::GetSecurityInfo, 0, &security_info(9)),
        step(Opcode::ReadReg, 0x1895_6b4c, &[]),
        step(Opcode::ReadReg, 0x0000_3485, &[]),
    ]
}

fn rom_handshake() -> Vec<Step> {
    let mut steps = vec![Step::rom(Opcode::Sync, 0, &[])];
    steps.extend(s3_identity(Step::rom));
    steps
}

fn written_packet(script: &ScriptedTransport, opcode: Opcode) -> Option<Vec<u8>> {
    script.calls().into_iter().find_map(|call| match call {
        TransportCall::Write(packet) if packet.get(1) == Some(&opcode.code()) => Some(packet),
        _ => None,
    })
}

#[test]
fn handshake_reports_stages_in_order() {
    let mut steps = rom_handshake();
    steps.push(Step::rom(Opcode::ChangeBaudrate, 0, &[]));
    let script = ScriptedTransport::new(steps);
    let recorder = StatusRecorder::new();
    let mut session = Session::new(
        Box::new(script.clone()),
        settings().desired_baud_rate(921_600).finalize(),
    )
    .with_status_sink(recorder.clone());

    let device = session.connect_and_handshake().unwrap();

    assert_eq!(
        recorder.stages(),
        vec![
            Stage::OpeningPort,
            Stage::HandshakingBootloader,
            Stage::LoadingStub,
            Stage::GettingSecurityInfo,
        ]
    );
    let seqs: Vec<u64> = recorder.events().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);

    assert_eq!(device.chip, Chip::Esp32s3);
    assert_eq!(device.chip_name, "ESP32-S3");
    assert_eq!(device.mac_address, "34:85:18:95:6b:4c");
    assert_eq!(device.flash_size, None);
    assert!(!device.security_facts.is_empty());
    assert_eq!(device.loader, LoaderMode::Rom);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.baud_rate(), 921_600);
    assert!(script.calls().contains(&TransportCall::SetBaud(921_600)));
    script.assert_no_pending_steps();

    // ROM loader: prior baud is sent as zero.
    let packet = written_packet(&script, Opcode::ChangeBaudrate).unwrap();
    assert_eq!(&packet[8..12], &921_600u32.to_le_bytes());
    assert_eq!(&packet[12..16], &[0, 0, 0, 0]);
}

#[test]
fn retried_sync_reports_each_stage_once() {
    let mut steps = vec![
        Step::timeout(Opcode::Sync),
        Step::timeout(Opcode::Sync),
        Step::rom(Opcode::Sync, 0, &[]),
    ];
    steps.extend(s3_identity(Step::rom));
    let script = ScriptedTransport::new(steps);
    let recorder = StatusRecorder::new();
    let mut session = Session::new(Box::new(script.clone()), settings().finalize())
        .with_status_sink(recorder.clone());

    session.connect_and_handshake().unwrap();

    assert_eq!(
        recorder.stages(),
        vec![
            Stage::OpeningPort,
            Stage::HandshakingBootloader,
            Stage::LoadingStub,
            Stage::GettingSecurityInfo,
        ]
    );
    let seqs: Vec<u64> = recorder.events().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    assert_eq!(&script.written_opcodes()[..3], &[0x08, 0x08, 0x08]);
    assert_eq!(session.state(), SessionState::Ready);
    script.assert_no_pending_steps();
}

#[test]
fn handshake_survives_byte_by_byte_delivery() {
    let script = ScriptedTransport::new(rom_handshake()).with_chunk_size(1);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    let device = session.connect_and_handshake().unwrap();
    assert_eq!(device.mac_address, "34:85:18:95:6b:4c");
    script.assert_no_pending_steps();
}

#[test]
fn handshake_with_stub_resyncs_in_stub_mode() {
    let mut steps = vec![
        Step::rom(Opcode::Sync, 0, &[]),
        Step::rom(Opcode::MemBegin, 0, &[]),
        Step::rom(Opcode::MemData, 0, &[]),
        Step::rom(Opcode::MemEnd, 0, &[]),
        Step::Raw(b"OHAI".to_vec()),
        Step::stub(Opcode::Sync, 0, &[]),
    ];
    steps.extend(s3_identity(Step::stub));
    let script = ScriptedTransport::new(steps);
    let recorder = StatusRecorder::new();
    let stub = StubImage::new(0x4037_8000, 0x4037_8000, vec![0xAA; 64]);
    let mut session = Session::new(
        Box::new(script.clone()),
        settings().skip_stub(false).finalize(),
    )
    .with_stub(stub)
    .with_status_sink(recorder.clone());

    let device = session.connect_and_handshake().unwrap();

    assert_eq!(
        recorder.stages(),
        vec![
            Stage::OpeningPort,
            Stage::HandshakingBootloader,
            Stage::LoadingStub,
            Stage::ReconnectingStub,
            Stage::GettingSecurityInfo,
        ]
    );
    assert_eq!(device.loader, LoaderMode::Stub);
    assert_eq!(session.loader_mode(), LoaderMode::Stub);
    assert_eq!(device.chip_name, "ESP32-S3");
    script.assert_no_pending_steps();

    let mem_end = written_packet(&script, Opcode::MemEnd).unwrap();
    assert_eq!(&mem_end[8..12], &[0, 0, 0, 0]);
    assert_eq!(&mem_end[12..16], &0x4037_8000u32.to_le_bytes());
}

#[test]
fn missing_stub_fails_validation() {
    let script = ScriptedTransport::new(vec![Step::rom(Opcode::Sync, 0, &[])]);
    let mut session = Session::new(
        Box::new(script.clone()),
        settings().skip_stub(false).finalize(),
    );

    let err = session.connect_and_handshake().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn sync_with_stub_reports_reconnecting() {
    let mut steps = rom_handshake();
    steps.push(Step::rom(Opcode::Sync, 0, &[]));
    let script = ScriptedTransport::new(steps);
    let recorder = StatusRecorder::new();
    let mut session = Session::new(Box::new(script.clone()), settings().finalize())
        .with_status_sink(recorder.clone());

    session.connect_and_handshake().unwrap();
    session.sync_with_stub().unwrap();

    let last = recorder.events().pop().unwrap();
    assert_eq!(last.stage, Stage::ReconnectingStub);
    assert_eq!(last.percent, None);
    assert_eq!(last.seq, 4);
    assert_eq!(session.state(), SessionState::Ready);
    script.assert_no_pending_steps();
}

#[test]
fn failed_resync_forgets_the_device() {
    let mut steps = rom_handshake();
    steps.extend(vec![Step::timeout(Opcode::Sync); 3]);
    let script = ScriptedTransport::new(steps);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    session.connect_and_handshake().unwrap();
    assert!(session.device_info().is_some());

    assert_eq!(session.sync_with_stub().unwrap_err().kind(), ErrorKind::Timeout);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.device_info(), None);
    assert_eq!(script.calls().last(), Some(&TransportCall::Close));
    script.assert_no_pending_steps();
}

#[test]
fn unanswered_sync_times_out() {
    let script = ScriptedTransport::new(vec![
        Step::timeout(Opcode::Sync),
        Step::timeout(Opcode::Sync),
        Step::timeout(Opcode::Sync),
    ]);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    let started = Instant::now();
    let err = session.connect_and_handshake().unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.to_string(), "timed out waiting for a response to SYNC");
    assert!(elapsed >= SYNC_TIMEOUT * 3, "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "hung for {:?}", elapsed);

    script.assert_no_pending_steps();
    assert_eq!(script.written_opcodes(), vec![0x08, 0x08, 0x08]);
    assert_eq!(script.calls().last(), Some(&TransportCall::Close));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.device_info().is_none());
}

#[test]
fn cancellation_stops_before_the_next_phase() {
    let script = ScriptedTransport::new(rom_handshake());
    let session = Session::new(Box::new(script.clone()), settings().finalize());
    let cancel = session.cancel_flag();
    let flag = cancel.clone();
    let mut session = session.with_status_sink(move |event: &StatusEvent| {
        if event.stage == Stage::HandshakingBootloader {
            flag.cancel();
        }
    });

    let err = session.connect_and_handshake().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(session.state(), SessionState::Failed);
    assert!(script.written_opcodes().is_empty());

    // A failed session gets back through a fresh connection cycle.
    let script = ScriptedTransport::new(rom_handshake());
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());
    session.cancel_flag().cancel();
    assert_eq!(
        session.connect_and_handshake().unwrap_err().kind(),
        ErrorKind::Cancelled
    );
    session.cancel_flag().reset();
    session.connect_and_handshake().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    script.assert_no_pending_steps();
}

#[test]
fn failure_status_fails_the_handshake() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::Sync, 0, &[]),
        Step::rom(Opcode::ReadReg, 0x9, &[]),
        Step::response(Opcode::GetSecurityInfo, 0, &[], &[0x01, 0x05, 0x00, 0x00]),
    ]);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    match session.connect_and_handshake().unwrap_err() {
        ProtocolError::Status {
            opcode,
            status,
            detail,
            status_bytes,
        } => {
            assert_eq!(opcode, Opcode::GetSecurityInfo);
            assert_eq!(status, 0x01);
            assert_eq!(detail, 0x05);
            assert_eq!(status_bytes, vec![0x01, 0x05, 0x00, 0x00]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Failed);
    script.assert_no_pending_steps();
}

#[test]
fn unknown_chip_is_unsupported() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::Sync, 0, &[]),
        Step::rom(Opcode::ReadReg, 0xdead_beef, &[]),
        Step::rom(Opcode::GetSecurityInfo, 0, &security_info(999)),
    ]);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    match session.connect_and_handshake().unwrap_err() {
        ProtocolError::UnsupportedChip { magic, chip_id } => {
            assert_eq!(magic, 0xdead_beef);
            assert_eq!(chip_id, Some(999));
        }
        other => panic!("unexpected error {:?}", other),
    }
    script.assert_no_pending_steps();
}

#[test]
fn chip_id_identifies_an_unknown_magic() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::Sync, 0, &[]),
        Step::rom(Opcode::ReadReg, 0x1234_5678, &[]),
        Step::rom(Opcode::GetSecurityInfo, 0, &security_info(5)),
        Step::rom(Opcode::ReadReg, 0x0102_0304, &[]),
        Step::rom(Opcode::ReadReg, 0x0000_0a0b, &[]),
    ]);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    let device = session.connect_and_handshake().unwrap();
    assert_eq!(device.chip, Chip::Esp32c3);
    assert_eq!(device.mac_address, "0a:0b:01:02:03:04");
    script.assert_no_pending_steps();
}

#[test]
fn esp32_skips_the_security_query() {
    let script = ScriptedTransport::new(vec![
        Step::rom(Opcode::Sync, 0, &[]),
        Step::rom(Opcode::ReadReg, 0x00f0_1d83, &[]),
        Step::rom(Opcode::ReadReg, 0x5566_7788, &[]),
        Step::rom(Opcode::ReadReg, 0x0000_3c71, &[]),
    ]);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    let device = session.connect_and_handshake().unwrap();
    assert_eq!(device.chip, Chip::Esp32);
    assert_eq!(device.mac_address, "3c:71:55:66:77:88");
    assert!(device.security_facts.is_empty());
    assert_eq!(device.security_info, None);
    script.assert_no_pending_steps();
}

#[test]
fn ready_session_runs_commands_and_switches_baud() {
    let mut steps = rom_handshake();
    steps.push(Step::rom(Opcode::ReadReg, 0xcafe_f00d, &[]));
    steps.push(Step::timeout(Opcode::ChangeBaudrate));
    let script = ScriptedTransport::new(steps);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    session.connect_and_handshake().unwrap();
    assert_eq!(
        session.connect_and_handshake().unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(session.read_reg(0x6000_0000).unwrap(), 0xcafe_f00d);

    // A lost acknowledgement does not fail the switch.
    session.change_baud(460_800).unwrap();
    assert_eq!(session.baud_rate(), 460_800);
    assert!(script.calls().contains(&TransportCall::SetBaud(460_800)));
    assert_eq!(session.state(), SessionState::Ready);

    // Same baud: nothing to do.
    session.change_baud(460_800).unwrap();
    script.assert_no_pending_steps();

    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn failed_command_fails_the_session() {
    let mut steps = rom_handshake();
    steps.push(Step::timeout(Opcode::ReadReg));
    steps.push(Step::Close);
    let script = ScriptedTransport::new(steps);
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    session.connect_and_handshake().unwrap();
    let err = session.read_reg(0x6000_0000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportClosed);

    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.device_info(), None);
    assert_eq!(script.calls().last(), Some(&TransportCall::Close));
    script.assert_no_pending_steps();

    // A failed session refuses further commands without touching the wire.
    let writes = script.written_opcodes().len();
    assert_eq!(
        session.read_reg(0x6000_0000).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(script.written_opcodes().len(), writes);
}

#[test]
fn rejected_upload_keeps_the_session_ready() {
    let script = ScriptedTransport::new(rom_handshake());
    let mut session = Session::new(Box::new(script.clone()), settings().finalize());

    session.connect_and_handshake().unwrap();
    let err = session
        .upload_to_ram(0x4000_0000, &[], &mut |_, _| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.device_info().is_some());
    assert_ne!(script.calls().last(), Some(&TransportCall::Close));
}
