//! SCSI command execution with R2T flow control (RFC 3720 Section 10.3-10.8)
//!
//! A command carries as much outbound data as immediate data allows; the rest
//! goes out in Data-Out PDUs, one burst per R2T the target issues. Inbound
//! data arrives in Data-In PDUs, each placed at its declared buffer offset,
//! until a PDU carrying final status is read.

use crate::connection::Connection;
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{DataIn, IscsiPdu, OpCode, ReadyToTransfer, ScsiResponse, TargetPdu};
use crate::scsi::{ScsiCommand, ScsiStatus};
use crate::session::SessionState;
use std::io::{Read, Write};

impl<S: Read + Write> Connection<S> {
    /// Execute one SCSI command
    ///
    /// # Arguments
    ///
    /// * `session` - Supplies the task tag and CmdSN; both advance on success
    /// * `cmd` - Target LUN and CDB
    /// * `out` - Data to write (empty for none)
    /// * `input` - Buffer for data read (empty for none)
    ///
    /// # Returns
    ///
    /// Extent of the input buffer the target filled: the highest Data-In end
    /// offset, never more than `input.len()`.
    ///
    /// # Errors
    ///
    /// Returns `IscsiError::ScsiCommand` for a non-Good status; the task tag
    /// and CmdSN are left unchanged in that case.
    pub fn send_command(
        &mut self,
        session: &mut SessionState,
        cmd: &ScsiCommand,
        out: &[u8],
        input: &mut [u8],
    ) -> ScsiResult<usize> {
        let itt = session.current_task_tag;
        let max_segment = self.params.values.max_target_recv_data_segment_length as usize;
        let first_burst = if session.params.values.immediate_data {
            session.params.values.first_burst_length as usize
        } else {
            0
        };

        let immediate = out.len().min(first_burst).min(max_segment);
        let expected_length = if out.is_empty() { input.len() } else { out.len() };

        let pdu = IscsiPdu::scsi_command(
            cmd.lun,
            itt,
            session.command_sequence_number,
            self.expected_stat_sn,
            cmd.cdb_bytes(),
            !input.is_empty(),
            !out.is_empty(),
            expected_length as u32,
            out[..immediate].to_vec(),
        );
        self.send_pdu(&pdu)?;

        let mut sent = immediate;
        while sent < out.len() {
            let r2t = match self.next_command_pdu()? {
                TargetPdu::ReadyToTransfer(r2t) => r2t,
                TargetPdu::ScsiResponse(resp) => {
                    check_response(&resp)?;
                    return Err(IscsiError::Protocol(format!(
                        "Target completed command with {} of {} bytes unsent",
                        out.len() - sent,
                        out.len()
                    )));
                }
                other => {
                    return Err(IscsiError::Protocol(format!(
                        "Unexpected response, expected {}, got {}",
                        OpCode::ReadyToTransfer,
                        other.opcode()
                    )))
                }
            };

            let approved = validate_r2t(&r2t, sent, out.len())?;
            self.send_data_out(cmd.lun, itt, &r2t, &out[sent..sent + approved], sent, max_segment)?;
            sent += approved;
        }

        let mut received = 0;
        loop {
            match self.next_command_pdu()? {
                TargetPdu::ScsiResponse(resp) => {
                    check_response(&resp)?;
                    if resp.final_pdu {
                        break;
                    }
                }
                TargetPdu::DataIn(data) => {
                    if let Some(status) = data.status {
                        if status != ScsiStatus::Good {
                            return Err(IscsiError::ScsiCommand {
                                status,
                                sense_data: None,
                            });
                        }
                    }

                    received = received.max(copy_data_in(&data, input)?);

                    // Without status a SCSI Response still follows
                    if data.final_pdu && data.status.is_some() {
                        break;
                    }
                }
                other => {
                    return Err(IscsiError::Protocol(format!(
                        "Unexpected {} while waiting for command completion",
                        other.opcode()
                    )))
                }
            }
        }

        session.next_task_tag();
        session.next_command_sequence_number();
        Ok(received)
    }

    fn next_command_pdu(&mut self) -> ScsiResult<TargetPdu> {
        let pdu = self.read_pdu()?;
        self.check_status(pdu)
    }

    /// Send one R2T's worth of data, split to the target's segment limit
    fn send_data_out(
        &mut self,
        lun: u64,
        itt: u32,
        r2t: &ReadyToTransfer,
        burst: &[u8],
        base_offset: usize,
        max_segment: usize,
    ) -> ScsiResult<()> {
        let mut offset = 0;
        let mut data_sn = 0u32;
        while offset < burst.len() {
            let len = (burst.len() - offset).min(max_segment);
            let last = offset + len == burst.len();

            let pdu = IscsiPdu::scsi_data_out(
                lun,
                itt,
                r2t.ttt,
                self.expected_stat_sn,
                data_sn,
                (base_offset + offset) as u32,
                last,
                burst[offset..offset + len].to_vec(),
            );
            self.send_pdu(&pdu)?;

            data_sn += 1;
            offset += len;
        }
        Ok(())
    }
}

/// Amount of data an R2T asks for, checked against what remains to send
fn validate_r2t(r2t: &ReadyToTransfer, sent: usize, total: usize) -> ScsiResult<usize> {
    let approved = r2t.desired_transfer_length as usize;
    if approved == 0 || approved > total - sent {
        return Err(IscsiError::Protocol(format!(
            "R2T requested {} bytes with {} bytes remaining",
            approved,
            total - sent
        )));
    }
    if r2t.buffer_offset as usize != sent {
        return Err(IscsiError::Protocol(format!(
            "R2T requested offset {} but {} bytes have been sent",
            r2t.buffer_offset, sent
        )));
    }
    Ok(approved)
}

/// Turn a SCSI Response into an error unless it reports success
fn check_response(resp: &ScsiResponse) -> ScsiResult<()> {
    if resp.response != 0 {
        return Err(IscsiError::Protocol(format!(
            "Target failed to execute command: iSCSI response 0x{:02x}",
            resp.response
        )));
    }

    match resp.status {
        ScsiStatus::Good => Ok(()),
        ScsiStatus::CheckCondition => Err(IscsiError::ScsiCommand {
            status: resp.status,
            sense_data: resp.sense_data(),
        }),
        status => Err(IscsiError::ScsiCommand {
            status,
            sense_data: None,
        }),
    }
}

/// Place a Data-In payload at its buffer offset, returning the end offset
fn copy_data_in(data: &DataIn, input: &mut [u8]) -> ScsiResult<usize> {
    let start = data.buffer_offset as usize;
    let end = start + data.data.len();
    if end > input.len() {
        return Err(IscsiError::Protocol(format!(
            "Data-In at offset {} with {} bytes overruns {} byte buffer",
            start,
            data.data.len(),
            input.len()
        )));
    }
    input[start..end].copy_from_slice(&data.data);
    Ok(end)
}
