use crate::cia402::Cia402State;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Invalid Node ID ({})", .0)]
    InvalidNodeId(u8),
    #[error("Invalid COB ID ({:03X})", .0)]
    InvalidCobId(u16),
    #[error("Invalid NMT Command (0x{:02X})", .0)]
    InvalidNmtCommand(u8),
    #[error("Invalid data length ({} bytes for {})", .length, .data_type)]
    InvalidDataLength { length: usize, data_type: String },
    #[error("Invalid command specifier ({})", .0)]
    InvalidCommandSpecifier(u8),
    #[error("Invalid expedited object size ({} bytes)", .0)]
    InvalidObjectSize(u8),
    #[error("Unexpected SDO response (command 0x{:02X})", .0)]
    UnexpectedSdoResponse(u8),
    #[error(
        "SDO abort from node {} at 0x{:04X}:{} (abort code 0x{:08X})",
        .node_id, .index, .sub_index, .abort_code
    )]
    SdoAbort {
        node_id: u8,
        index: u16,
        sub_index: u8,
        abort_code: u32,
    },
    #[error("SDO timeout on node {} at 0x{:04X}:{}", .node_id, .index, .sub_index)]
    SdoTimeout { node_id: u8, index: u16, sub_index: u8 },
    #[error("Node {} did not reach OperationEnabled (last state {:?})", .node_id, .last_state)]
    EnableFailed { node_id: u8, last_state: Cia402State },
    #[error("Transport failure ({:?})", .0)]
    Transport(std::io::ErrorKind),
    #[error("Configuration error: {}", .0)]
    Config(String),
    #[error("CAN-FD is not supported")]
    CanFdNotSupported,
    #[error("Not implemented")]
    NotImplemented,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.kind())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
