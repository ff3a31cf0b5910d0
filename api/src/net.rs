use binrw::{binrw, BinRead, BinWrite};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::ProcessId;

pub const WINDOWD_VERSION_0: u8 = 0;

/// Largest payload either side is willing to accept
pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Connection header
///
/// On every connect server sends some initial data.
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct ConnectionHello {
    /// Protocol version
    pub version: u8,
    /// Process serving this endpoint
    pub pid: ProcessId,
}

impl ConnectionHello {
    pub const BYTE_SIZE: usize = 1 + ProcessId::BYTE_SIZE;
}

/// Request command
///
/// Monarch and peasant endpoints share the numbering, each
/// rejects the commands of the other one.
#[derive(FromPrimitive, IntoPrimitive, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[repr(u8)]
pub enum RequestCmd {
    /// Monarch: pid of the leader process
    GetPid = 1,
    /// Monarch: register a peasant, get its id back
    AddPeasant = 2,
    /// Monarch: adjudicate a commandline
    ProposeCommandline = 3,
    /// Monarch: a peasant was activated
    HandleActivatePeasant = 4,
    /// Peasant: id of the peasant
    GetId = 16,
    /// Peasant: run a commandline in this window
    ExecuteCommandline = 17,
    /// Peasant: last activation info
    GetLastActivatedArgs = 18,
    #[default]
    Other,
}

/// Every request starts with this, followed by `payload_len` bytes of
/// MessagePack encoded arguments
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct RequestHeader {
    cmd: u8,
    pub payload_len: u32,
}

impl RequestHeader {
    pub const BYTE_SIZE: usize = 5;

    pub fn new(cmd: RequestCmd, payload_len: u32) -> Self {
        Self {
            cmd: cmd.into(),
            payload_len,
        }
    }

    pub fn cmd(&self) -> RequestCmd {
        RequestCmd::from(self.cmd)
    }
}

#[derive(FromPrimitive, IntoPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum ResponseStatus {
    /// Payload is the MessagePack encoded response
    Ok = 0,
    /// Payload is a MessagePack encoded error message
    Error = 1,
    #[default]
    Other,
}

/// Every response starts with this, followed by `payload_len` bytes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct ResponseHeader {
    status: u8,
    pub payload_len: u32,
}

impl ResponseHeader {
    pub const BYTE_SIZE: usize = 5;

    pub fn new(status: ResponseStatus, payload_len: u32) -> Self {
        Self {
            status: status.into(),
            payload_len,
        }
    }

    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from(self.status)
    }
}

#[test]
fn request_header_layout() {
    use binrw::io::NoSeek;
    use std::io::Cursor;

    let header = RequestHeader::new(RequestCmd::ProposeCommandline, 0x0102_0304);
    let mut buf = vec![];
    header.write(&mut NoSeek::new(&mut buf)).unwrap();

    assert_eq!(buf, [3, 1, 2, 3, 4]);
    assert_eq!(buf.len(), RequestHeader::BYTE_SIZE);

    let read = RequestHeader::read(&mut Cursor::new(&buf)).unwrap();
    assert_eq!(read.cmd(), RequestCmd::ProposeCommandline);
    assert_eq!(read.payload_len, 0x0102_0304);
}

#[test]
fn unknown_cmd_maps_to_other() {
    use std::io::Cursor;

    let read = RequestHeader::read(&mut Cursor::new([0xee, 0, 0, 0, 0])).unwrap();
    assert_eq!(read.cmd(), RequestCmd::Other);

    let read = ResponseHeader::read(&mut Cursor::new([0xee, 0, 0, 0, 1])).unwrap();
    assert_eq!(read.status(), ResponseStatus::Other);
}

#[test]
fn connection_hello_layout() {
    use binrw::io::NoSeek;

    let mut buf = vec![];
    ConnectionHello {
        version: WINDOWD_VERSION_0,
        pid: ProcessId(0x0a0b_0c0d),
    }
    .write(&mut NoSeek::new(&mut buf))
    .unwrap();

    assert_eq!(buf, [0, 0x0a, 0x0b, 0x0c, 0x0d]);
    assert_eq!(buf.len(), ConnectionHello::BYTE_SIZE);
}
