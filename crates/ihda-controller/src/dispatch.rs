//! Client command protocol: fixed binary records over a channel.
//!
//! Every request is a 4-byte header (`cmd: u32`, little-endian) plus a
//! command-specific fixed-size payload, read in a single bounded operation.
//! Replies echo the request header unchanged. Validation is strict: short
//! reads, per-command size mismatches, and unknown command ids are all
//! rejected with `InvalidArgs` before any dispatch happens.

use crate::controller::HdaController;
use crate::ddk::Channel;
use crate::error::{HdaError, Result};

pub const CMD_GET_IDS: u32 = 0x1000;
pub const CMD_SNAPSHOT_REGS: u32 = 0x2000;

pub const HDR_SIZE: usize = 4;
pub const GET_IDS_REQ_SIZE: usize = HDR_SIZE;
pub const SNAPSHOT_REGS_REQ_SIZE: usize = HDR_SIZE;
pub const GET_IDS_RESP_SIZE: usize = HDR_SIZE + 8;

/// Upper bound on any request; requests are read into one stack buffer of
/// this size.
pub const MAX_REQUEST_SIZE: usize = 256;

const _: () = assert!(GET_IDS_REQ_SIZE <= MAX_REQUEST_SIZE);
const _: () = assert!(SNAPSHOT_REGS_REQ_SIZE <= MAX_REQUEST_SIZE);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub cmd: u32,
}

impl CommandHeader {
    pub fn encode(self) -> [u8; HDR_SIZE] {
        self.cmd.to_le_bytes()
    }
}

/// A fully-validated inbound request. Decoding is the only place raw bytes
/// are interpreted, and every variant's exact length is checked before the
/// variant exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Request {
    GetIds(CommandHeader),
    SnapshotRegs(CommandHeader),
}

fn decode_request(buf: &[u8]) -> Result<Request> {
    if buf.len() < HDR_SIZE {
        return Err(HdaError::InvalidArgs("request shorter than header"));
    }
    let hdr = CommandHeader {
        cmd: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
    };

    match hdr.cmd {
        CMD_GET_IDS => {
            if buf.len() != GET_IDS_REQ_SIZE {
                return Err(HdaError::InvalidArgs("bad GET_IDS request length"));
            }
            Ok(Request::GetIds(hdr))
        }
        CMD_SNAPSHOT_REGS => {
            if buf.len() != SNAPSHOT_REGS_REQ_SIZE {
                return Err(HdaError::InvalidArgs("bad SNAPSHOT_REGS request length"));
            }
            Ok(Request::SnapshotRegs(hdr))
        }
        _ => Err(HdaError::InvalidArgs("unknown command id")),
    }
}

/// Read, validate, and answer one client request. Each accepted command
/// produces exactly one reply write on the same channel.
pub(crate) fn process_client_request(
    controller: &HdaController,
    channel: &dyn Channel,
) -> Result<()> {
    let mut buf = [0u8; MAX_REQUEST_SIZE];
    let len = channel.read(&mut buf)?;

    match decode_request(&buf[..len])? {
        Request::GetIds(hdr) => {
            let ids = controller.read_ids()?;
            let mut resp = Vec::with_capacity(GET_IDS_RESP_SIZE);
            resp.extend_from_slice(&hdr.encode());
            resp.extend_from_slice(&ids.vendor_id.to_le_bytes());
            resp.extend_from_slice(&ids.device_id.to_le_bytes());
            resp.push(ids.hw_major_version);
            resp.push(ids.hw_minor_version);
            resp.push(ids.revision_id);
            resp.push(ids.stepping_id);
            channel.write(&resp)
        }
        Request::SnapshotRegs(hdr) => {
            let snapshot = controller.snapshot_registers()?;
            let mut resp = Vec::with_capacity(HDR_SIZE + 4 + snapshot.len());
            resp.extend_from_slice(&hdr.encode());
            resp.extend_from_slice(&0i32.to_le_bytes());
            resp.extend_from_slice(&snapshot);
            channel.write(&resp)
        }
    }
}

/// Identification fields returned by `GET_IDS`; vendor/device/revision come
/// from PCI config, the hardware version from live VMAJ/VMIN reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControllerIds {
    pub vendor_id: u16,
    pub device_id: u16,
    pub hw_major_version: u8,
    pub hw_minor_version: u8,
    pub revision_id: u8,
    pub stepping_id: u8,
}
