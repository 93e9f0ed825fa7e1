//! SCSI command transport tests against the scripted target
//!
//! These tests cover:
//! - Data-In placement and completion
//! - Immediate data sizing
//! - R2T-driven Data-Out bursts
//! - SCSI status, sense data and iSCSI-level failures
//! - Task tag / CmdSN bookkeeping

mod common;

use common::*;
use iscsi_initiator::pdu::{IscsiPdu, OpCode, RESERVED_TAG};
use iscsi_initiator::scsi::{sense_key, SenseData};
use iscsi_initiator::{IscsiError, ScsiStatus};

const GOOD: u8 = 0x00;
const CHECK_CONDITION: u8 = 0x02;
const BUSY: u8 = 0x08;

/// Login that leaves the target's receive limit at the 8192 default
fn default_segment_login() -> Script {
    Script::new()
        .login(0, 1, true, b"AuthMethod=None\0")
        .login(1, 3, true, b"")
}

/// Login where the target turns immediate data off
fn no_immediate_data_login(target_segment: &[u8]) -> Script {
    let mut keys = b"ImmediateData=No\0".to_vec();
    keys.extend_from_slice(target_segment);
    Script::new()
        .login(0, 1, true, b"AuthMethod=None\0")
        .login(1, 3, true, &keys)
        .login(1, 3, true, b"")
}

fn data_out_pdus(captured: &Captured) -> Vec<IscsiPdu> {
    captured.pdus_with_opcode(OpCode::ScsiDataOut)
}

fn command_pdus(captured: &Captured) -> Vec<IscsiPdu> {
    captured.pdus_with_opcode(OpCode::ScsiCommand)
}

#[test]
fn test_read_assembles_data_in() {
    let data = pattern(1024);
    let (target, captured) = Script::new()
        .normal_login()
        .data_in(1, 0, 0, false, &data[..512])
        .data_in_status(1, 1, 512, GOOD, &data[512..])
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 1024];
    let read = session.read(0, 0, 2, &mut buf).unwrap();
    assert_eq!(read, 1024);
    assert_eq!(buf, data);

    let commands = command_pdus(&captured);
    assert_eq!(commands.len(), 1);
    let cmd = &commands[0];
    assert_eq!(cmd.flags(), 0xC1, "final, read, simple");
    assert_eq!(cmd.itt(), 1);
    assert_eq!(field_u32(cmd, 20), 1024);
    assert_eq!(field_u32(cmd, 24), 1);
    assert_eq!(field_u32(cmd, 28), 3);
    assert_eq!(rw10_fields(cmd), (0x28, 0, 2));

    assert_eq!(session.state().command_sequence_number(), 2);
    assert_eq!(session.state().current_task_tag(), 2);
}

#[test]
fn test_data_in_placed_at_buffer_offset() {
    let data = pattern(1024);
    let (target, _captured) = Script::new()
        .normal_login()
        .data_in(1, 0, 512, false, &data[512..])
        .data_in_status(1, 1, 0, GOOD, &data[..512])
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 1024];
    assert_eq!(session.read(0, 0, 2, &mut buf).unwrap(), 1024);
    assert_eq!(buf, data);
}

#[test]
fn test_final_data_in_without_status_waits_for_response() {
    let data = pattern(512);
    let (target, _captured) = Script::new()
        .normal_login()
        .data_in(1, 0, 0, true, &data)
        .scsi_response(1, 0, GOOD, b"")
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    assert_eq!(session.read(0, 0, 1, &mut buf).unwrap(), 512);
    assert_eq!(buf, data);
    assert_eq!(
        session.connection().unwrap().expected_status_sequence_number(),
        4
    );
}

#[test]
fn test_counters_advance_per_command() {
    let (target, captured) = Script::new()
        .normal_login()
        .data_in_status(1, 0, 0, GOOD, &pattern(512))
        .data_in_status(2, 0, 0, GOOD, &pattern(512))
        .logout(3, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    session.read(0, 0, 1, &mut buf).unwrap();
    session.read(0, 1, 1, &mut buf).unwrap();

    let commands = command_pdus(&captured);
    assert_eq!(commands[1].itt(), 2);
    assert_eq!(field_u32(&commands[1], 24), 2);
    assert_eq!(field_u32(&commands[1], 28), 4);
    assert_eq!(session.state().command_sequence_number(), 3);
}

#[test]
fn test_write_fits_in_immediate_data() {
    let data = pattern(8192);
    let (target, captured) = Script::new()
        .normal_login()
        .scsi_response(1, 0, GOOD, b"")
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    session.write(0, 4, 16, 512, &data).unwrap();

    let cmd = &command_pdus(&captured)[0];
    assert_eq!(cmd.flags(), 0xA1, "final, write, simple");
    assert_eq!(rw10_fields(cmd), (0x2A, 4, 16));
    assert_eq!(field_u32(cmd, 20), 8192);
    assert_eq!(cmd.data, data);
    assert!(data_out_pdus(&captured).is_empty());
}

#[test]
fn test_immediate_data_limited_by_target_segment_length() {
    let data = pattern(16384);
    let (target, captured) = default_segment_login()
        .r2t(1, 0x1234, 0, 8192, 8192)
        .scsi_response(1, 0, GOOD, b"")
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    session.write(0, 0, 32, 512, &data).unwrap();

    let cmd = &command_pdus(&captured)[0];
    assert_eq!(cmd.data.len(), 8192);
    assert_eq!(field_u32(cmd, 20), 16384);

    let outs = data_out_pdus(&captured);
    assert_eq!(outs.len(), 1);
    let out = &outs[0];
    assert_eq!(out.flags(), 0x80);
    assert_eq!(out.itt(), 1);
    assert_eq!(field_u32(out, 20), 0x1234);
    assert_eq!(field_u32(out, 36), 0);
    assert_eq!(field_u32(out, 40), 8192);
    assert_eq!(out.data, &data[8192..]);
}

#[test]
fn test_no_immediate_data_when_disabled() {
    let data = pattern(4096);
    let (target, captured) = no_immediate_data_login(b"MaxRecvDataSegmentLength=65536\0")
        .r2t(1, 0x20, 0, 0, 4096)
        .scsi_response(1, 0, GOOD, b"")
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    session.write(0, 0, 8, 512, &data).unwrap();

    assert!(command_pdus(&captured)[0].data.is_empty());
    let outs = data_out_pdus(&captured);
    assert_eq!(outs.len(), 1);
    assert_eq!(outs[0].flags(), 0x80);
    assert_eq!(field_u32(&outs[0], 40), 0);
    assert_eq!(outs[0].data, data);
}

#[test]
fn test_r2t_bursts_restart_data_sn() {
    let data = pattern(32768);
    let (target, captured) = no_immediate_data_login(b"")
        .r2t(1, 0x10, 0, 0, 16384)
        .r2t(1, 0x11, 1, 16384, 16384)
        .scsi_response(1, 0, GOOD, b"")
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    session.write(0, 0, 64, 512, &data).unwrap();

    let outs = data_out_pdus(&captured);
    assert_eq!(outs.len(), 4);

    // (TTT, DataSN, BufferOffset, F)
    let expected = [
        (0x10, 0, 0, false),
        (0x10, 1, 8192, true),
        (0x11, 0, 16384, false),
        (0x11, 1, 24576, true),
    ];
    for (out, (ttt, data_sn, offset, last)) in outs.iter().zip(expected) {
        assert_eq!(field_u32(out, 20), ttt);
        assert_eq!(field_u32(out, 36), data_sn);
        assert_eq!(field_u32(out, 40), offset);
        assert_eq!(out.flags() & 0x80 != 0, last);
        assert_eq!(out.data.len(), 8192);
    }

    let sent: Vec<u8> = outs.iter().flat_map(|p| p.data.clone()).collect();
    assert_eq!(sent, data);
}

#[test]
fn test_check_condition_returns_sense() {
    let mut sense = vec![0u8; 18];
    sense[0] = 0x70;
    sense[2] = sense_key::ILLEGAL_REQUEST;
    sense[12] = 0x24;
    let mut segment = vec![0x00, 18];
    segment.extend_from_slice(&sense);

    let (target, _captured) = Script::new()
        .normal_login()
        .scsi_response(1, 0, CHECK_CONDITION, &segment)
        .logout(1, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    let err = session.read(0, 0, 1, &mut buf).unwrap_err();
    match &err {
        IscsiError::ScsiCommand { status, sense_data } => {
            assert_eq!(*status, ScsiStatus::CheckCondition);
            assert_eq!(sense_data.as_deref(), Some(&sense[..]));
        }
        other => panic!("expected SCSI failure, got {:?}", other),
    }

    let decoded = SenseData::parse(err.sense_data().unwrap()).unwrap();
    assert_eq!(decoded.sense_key, sense_key::ILLEGAL_REQUEST);
    assert_eq!(decoded.asc, 0x24);

    // A failed command does not consume a task tag or CmdSN
    assert_eq!(session.state().command_sequence_number(), 1);
    assert_eq!(session.state().current_task_tag(), 1);
}

#[test]
fn test_status_in_data_in() {
    let (target, _captured) = Script::new()
        .normal_login()
        .data_in_status(1, 0, 0, BUSY, b"")
        .logout(1, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    match session.read(0, 0, 1, &mut buf) {
        Err(IscsiError::ScsiCommand { status, sense_data }) => {
            assert_eq!(status, ScsiStatus::Busy);
            assert!(sense_data.is_none());
        }
        other => panic!("expected SCSI failure, got {:?}", other),
    }
}

#[test]
fn test_response_while_waiting_for_r2t() {
    let (target, captured) = default_segment_login()
        .scsi_response(1, 0, CHECK_CONDITION, &[0x00, 0x04, 1, 2, 3, 4])
        .logout(1, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let err = session.write(0, 0, 32, 512, &pattern(16384)).unwrap_err();
    assert_eq!(err.sense_data(), Some(&[1u8, 2, 3, 4][..]));
    assert!(data_out_pdus(&captured).is_empty());
}

#[test]
fn test_r2t_offset_mismatch() {
    let (target, _captured) = default_segment_login()
        .r2t(1, 0x10, 0, 0, 8192)
        .build();
    let mut session = open_normal(target).unwrap();

    let result = session.write(0, 0, 32, 512, &pattern(16384));
    assert!(matches!(result, Err(IscsiError::Protocol(_))));
}

#[test]
fn test_r2t_zero_length() {
    let (target, _captured) = default_segment_login()
        .r2t(1, 0x10, 0, 8192, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let result = session.write(0, 0, 32, 512, &pattern(16384));
    assert!(matches!(result, Err(IscsiError::Protocol(_))));
}

#[test]
fn test_iscsi_response_failure() {
    let (target, _captured) = Script::new()
        .normal_login()
        .scsi_response(1, 0x01, GOOD, b"")
        .logout(1, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    assert!(matches!(
        session.read(0, 0, 1, &mut buf),
        Err(IscsiError::Protocol(_))
    ));
}

#[test]
fn test_reject_during_command() {
    let (target, _captured) = Script::new().normal_login().reject(0x09).build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    match session.read(0, 0, 1, &mut buf) {
        Err(IscsiError::Protocol(message)) => assert!(message.contains("reject")),
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[test]
fn test_unexpected_pdu_during_command() {
    let (target, _captured) = Script::new()
        .normal_login()
        .text(1, true, false, RESERVED_TAG, b"")
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    assert!(matches!(
        session.read(0, 0, 1, &mut buf),
        Err(IscsiError::Protocol(_))
    ));
}

#[test]
fn test_out_of_order_stat_sn() {
    let (target, _captured) = Script::new()
        .normal_login()
        .with_stat_sn(9)
        .scsi_response(1, 0, GOOD, b"")
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    assert!(matches!(
        session.read(0, 0, 1, &mut buf),
        Err(IscsiError::Protocol(_))
    ));
}

#[test]
fn test_data_in_overrun() {
    let (target, _captured) = Script::new()
        .normal_login()
        .data_in_status(1, 0, 0, GOOD, &pattern(1024))
        .build();
    let mut session = open_normal(target).unwrap();

    let mut buf = vec![0u8; 512];
    assert!(matches!(
        session.read(0, 0, 1, &mut buf),
        Err(IscsiError::Protocol(_))
    ));
}

#[test]
fn test_overlapping_data_in_counts_extent() {
    let capacity = [0x00, 0x00, 0x0F, 0xFF, 0x00, 0x00, 0x02, 0x00];
    let (target, _captured) = Script::new()
        .normal_login()
        .data_in(1, 0, 0, false, &[0u8; 8])
        .data_in_status(1, 1, 0, GOOD, &capacity)
        .data_in(2, 0, 0, false, &pattern(512))
        .data_in_status(2, 1, 256, GOOD, &pattern(512)[256..])
        .logout(3, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let capacity = session.get_capacity(0).unwrap();
    assert_eq!(capacity.logical_block_count, 4096);
    assert_eq!(capacity.block_size, 512);

    let mut buf = vec![0u8; 512];
    assert_eq!(session.read(0, 0, 1, &mut buf).unwrap(), 512);
    assert_eq!(buf, pattern(512));
}

#[test]
fn test_get_capacity() {
    let (target, _captured) = Script::new()
        .normal_login()
        .data_in_status(1, 0, 0, GOOD, &[0x00, 0x00, 0x0F, 0xFF, 0x00, 0x00, 0x02, 0x00])
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    let capacity = session.get_capacity(0).unwrap();
    assert_eq!(capacity.logical_block_count, 4096);
    assert_eq!(capacity.block_size, 512);
    assert_eq!(capacity.size_bytes(), 2 * 1024 * 1024);
}

#[test]
fn test_raw_command() {
    let (target, captured) = Script::new()
        .normal_login()
        .scsi_response(1, 0, GOOD, b"")
        .logout(2, 0)
        .build();
    let mut session = open_normal(target).unwrap();

    // TEST UNIT READY
    assert_eq!(session.raw_command(0, &[0u8; 6], &[], &mut []).unwrap(), 0);
    assert!(matches!(
        session.raw_command(0, &[], &[], &mut []),
        Err(IscsiError::Config(_))
    ));

    let cmd = &command_pdus(&captured)[0];
    assert_eq!(cmd.flags(), 0x81);
    assert_eq!(field_u32(cmd, 20), 0);
}

#[test]
fn test_write_buffer_too_short() {
    let (target, captured) = Script::new().normal_login().logout(1, 0).build();
    let mut session = open_normal(target).unwrap();

    let result = session.write(0, 0, 2, 512, &pattern(512));
    assert!(matches!(result, Err(IscsiError::Config(_))));
    assert!(command_pdus(&captured).is_empty());
}
