//! Request and response payloads
//!
//! Sent as MessagePack after the binary [`crate::RequestHeader`] /
//! [`crate::ResponseHeader`]. Commands without arguments send an
//! empty payload.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{PeasantId, ProcessId, WindowActivatedArgs};

/// Arguments for [`crate::RequestCmd::AddPeasant`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeasantRequest {
    /// [`PeasantId::UNASSIGNED`] if the peasant never registered before
    pub id: PeasantId,
    pub pid: ProcessId,
    pub name: Option<String>,
    /// Where the peasant accepts requests from the leader
    pub endpoint: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeasantResponse {
    pub id: PeasantId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPidResponse {
    pub pid: ProcessId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeCommandlineResponse {
    /// Should the proposing process create a window and handle the commandline itself
    pub create_window: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIdResponse {
    pub id: PeasantId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastActivatedResponse {
    pub args: Option<WindowActivatedArgs>,
}

#[test]
fn add_peasant_request_msgpack() {
    let req = AddPeasantRequest {
        id: PeasantId::UNASSIGNED,
        pid: ProcessId(1234),
        name: Some("main".into()),
        endpoint: PathBuf::from("/run/user/1000/windowd-peasant-1234.sock"),
    };

    let bytes = rmp_serde::to_vec(&req).unwrap();
    let decoded: AddPeasantRequest = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(decoded, req);
}
