use crate::error::{Error, Result};
use crate::frame::{CanOpenFrame, ConvertibleFrame};
use crate::id::{CommunicationObject, NodeId};

/// `Tx` is server to client (0x580 + node), `Rx` is client to server (0x600 + node).
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Direction {
    Tx,
    Rx,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum CommandSpecifier {
    AbortTransfer,
    Client(ClientCommandSpecifier),
    Server(ServerCommandSpecifier),
}

impl CommandSpecifier {
    fn new(direction: Direction, value: u8) -> Result<Self> {
        if value == 4 {
            return Ok(Self::AbortTransfer);
        }
        match direction {
            Direction::Tx => Ok(Self::Server(ServerCommandSpecifier::from_num(value)?)),
            Direction::Rx => Ok(Self::Client(ClientCommandSpecifier::from_num(value)?)),
        }
    }

    fn to_num(self) -> u8 {
        match self {
            Self::AbortTransfer => 4,
            Self::Client(ccs) => ccs as u8,
            Self::Server(scs) => scs as u8,
        }
    }

    fn to_byte_fragment(self) -> u8 {
        self.to_num() << 5
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum ClientCommandSpecifier {
    DownloadSegmentRequest = 0,
    InitiateDownloadRequest = 1,
    InitiateUploadRequest = 2,
    UploadSegmentRequest = 3,
    BlockUpload = 5,
    BlockDownload = 6,
}

impl ClientCommandSpecifier {
    fn from_num(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::DownloadSegmentRequest),
            1 => Ok(Self::InitiateDownloadRequest),
            2 => Ok(Self::InitiateUploadRequest),
            3 => Ok(Self::UploadSegmentRequest),
            5 => Ok(Self::BlockUpload),
            6 => Ok(Self::BlockDownload),
            _ => Err(Error::InvalidCommandSpecifier(value)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum ServerCommandSpecifier {
    UploadSegmentResponse = 0,
    DownloadSegmentResponse = 1,
    InitiateUploadResponse = 2,
    InitiateDownloadResponse = 3,
    BlockDownload = 5,
    BlockUpload = 6,
}

impl ServerCommandSpecifier {
    fn from_num(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::UploadSegmentResponse),
            1 => Ok(Self::DownloadSegmentResponse),
            2 => Ok(Self::InitiateUploadResponse),
            3 => Ok(Self::InitiateDownloadResponse),
            5 => Ok(Self::BlockDownload),
            6 => Ok(Self::BlockUpload),
            _ => Err(Error::InvalidCommandSpecifier(value)),
        }
    }
}

/// Payload width of an expedited transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectSize {
    U8 = 1,
    U16 = 2,
    U32 = 4,
}

impl ObjectSize {
    pub fn len(self) -> usize {
        self as usize
    }

    // e = 1, s = 1, n = 4 - size
    fn to_byte_fragment(self) -> u8 {
        (((4 - self.len()) as u8) << 2) & 0b1100 | 0b0011
    }

    fn from_byte_fragment(command: u8) -> Result<Self> {
        if command & 0b0011 != 0b0011 {
            return Err(Error::NotImplemented);
        }
        (4 - ((command & 0b1100) >> 2)).try_into()
    }
}

impl TryFrom<u8> for ObjectSize {
    type Error = Error;
    fn try_from(size: u8) -> Result<Self> {
        match size {
            1 => Ok(Self::U8),
            2 => Ok(Self::U16),
            4 => Ok(Self::U32),
            _ => Err(Error::InvalidObjectSize(size)),
        }
    }
}

#[derive(Debug, PartialEq)]
enum SdoFrameData {
    InitiateDownloadRequest {
        index: u16,
        sub_index: u8,
        size: ObjectSize,
        value: u32,
    },
    InitiateDownloadResponse {
        index: u16,
        sub_index: u8,
    },
    InitiateUploadRequest {
        index: u16,
        sub_index: u8,
    },
    InitiateUploadResponse {
        index: u16,
        sub_index: u8,
        size: ObjectSize,
        value: u32,
    },
    AbortTransfer {
        index: u16,
        sub_index: u8,
        abort_code: u32,
    },
}

fn masked_value(value: u32, size: ObjectSize) -> u32 {
    match size {
        ObjectSize::U8 => value & 0xFF,
        ObjectSize::U16 => value & 0xFFFF,
        ObjectSize::U32 => value,
    }
}

impl SdoFrameData {
    const DATA_SIZE: usize = 8;

    fn write_bytes(&self, buf: &mut [u8]) {
        // cf. https://en.wikipedia.org/wiki/CANopen#Service_Data_Object_(SDO)_protocol
        let (command, index, sub_index, payload) = match *self {
            SdoFrameData::AbortTransfer {
                index,
                sub_index,
                abort_code,
            } => (
                CommandSpecifier::AbortTransfer.to_byte_fragment(),
                index,
                sub_index,
                abort_code,
            ),
            SdoFrameData::InitiateDownloadRequest {
                index,
                sub_index,
                size,
                value,
            } => (
                CommandSpecifier::Client(ClientCommandSpecifier::InitiateDownloadRequest)
                    .to_byte_fragment()
                    + size.to_byte_fragment(),
                index,
                sub_index,
                masked_value(value, size),
            ),
            SdoFrameData::InitiateDownloadResponse { index, sub_index } => (
                CommandSpecifier::Server(ServerCommandSpecifier::InitiateDownloadResponse)
                    .to_byte_fragment(),
                index,
                sub_index,
                0,
            ),
            SdoFrameData::InitiateUploadRequest { index, sub_index } => (
                CommandSpecifier::Client(ClientCommandSpecifier::InitiateUploadRequest)
                    .to_byte_fragment(),
                index,
                sub_index,
                0,
            ),
            SdoFrameData::InitiateUploadResponse {
                index,
                sub_index,
                size,
                value,
            } => (
                CommandSpecifier::Server(ServerCommandSpecifier::InitiateUploadResponse)
                    .to_byte_fragment()
                    + size.to_byte_fragment(),
                index,
                sub_index,
                masked_value(value, size),
            ),
        };
        buf[0] = command;
        buf[1..3].copy_from_slice(&index.to_le_bytes());
        buf[3] = sub_index;
        buf[4..8].copy_from_slice(&payload.to_le_bytes());
    }
}

/// Server reply to an expedited request, as seen by the client.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SdoResponse {
    DownloadConfirmed {
        index: u16,
        sub_index: u8,
    },
    Uploaded {
        index: u16,
        sub_index: u8,
        size: ObjectSize,
        value: u32,
    },
    Aborted {
        index: u16,
        sub_index: u8,
        abort_code: u32,
    },
}

#[derive(Debug, PartialEq)]
pub struct SdoFrame {
    direction: Direction,
    pub node_id: NodeId,
    frame_data: SdoFrameData,
}

impl SdoFrame {
    const FRAME_DATA_SIZE: usize = 8;

    pub fn new_sdo_read_frame(node_id: NodeId, index: u16, sub_index: u8) -> Self {
        Self {
            direction: Direction::Rx,
            node_id,
            frame_data: SdoFrameData::InitiateUploadRequest { index, sub_index },
        }
    }

    pub fn new_sdo_write_frame(
        node_id: NodeId,
        index: u16,
        sub_index: u8,
        value: u32,
        size: ObjectSize,
    ) -> Self {
        Self {
            direction: Direction::Rx,
            node_id,
            frame_data: SdoFrameData::InitiateDownloadRequest {
                index,
                sub_index,
                size,
                value,
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn new_download_response(node_id: NodeId, index: u16, sub_index: u8) -> Self {
        Self {
            direction: Direction::Tx,
            node_id,
            frame_data: SdoFrameData::InitiateDownloadResponse { index, sub_index },
        }
    }

    #[cfg(test)]
    pub(crate) fn new_upload_response(
        node_id: NodeId,
        index: u16,
        sub_index: u8,
        value: u32,
        size: ObjectSize,
    ) -> Self {
        Self {
            direction: Direction::Tx,
            node_id,
            frame_data: SdoFrameData::InitiateUploadResponse {
                index,
                sub_index,
                size,
                value,
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn new_abort_response(node_id: NodeId, index: u16, sub_index: u8, abort_code: u32) -> Self {
        Self {
            direction: Direction::Tx,
            node_id,
            frame_data: SdoFrameData::AbortTransfer {
                index,
                sub_index,
                abort_code,
            },
        }
    }

    pub(crate) fn new_with_bytes(
        direction: Direction,
        node_id: NodeId,
        bytes: &[u8],
    ) -> Result<Self> {
        if bytes.len() < Self::FRAME_DATA_SIZE {
            return Err(Error::InvalidDataLength {
                length: bytes.len(),
                data_type: "SdoFrame".to_owned(),
            });
        }
        let index = u16::from_le_bytes([bytes[1], bytes[2]]);
        let sub_index = bytes[3];
        let payload = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let frame_data = match CommandSpecifier::new(direction, bytes[0] >> 5)? {
            CommandSpecifier::AbortTransfer => SdoFrameData::AbortTransfer {
                index,
                sub_index,
                abort_code: payload,
            },
            CommandSpecifier::Client(ClientCommandSpecifier::InitiateDownloadRequest) => {
                let size = ObjectSize::from_byte_fragment(bytes[0])?;
                SdoFrameData::InitiateDownloadRequest {
                    index,
                    sub_index,
                    size,
                    value: masked_value(payload, size),
                }
            }
            CommandSpecifier::Client(ClientCommandSpecifier::InitiateUploadRequest) => {
                SdoFrameData::InitiateUploadRequest { index, sub_index }
            }
            CommandSpecifier::Server(ServerCommandSpecifier::InitiateDownloadResponse) => {
                SdoFrameData::InitiateDownloadResponse { index, sub_index }
            }
            CommandSpecifier::Server(ServerCommandSpecifier::InitiateUploadResponse) => {
                let size = ObjectSize::from_byte_fragment(bytes[0])?;
                SdoFrameData::InitiateUploadResponse {
                    index,
                    sub_index,
                    size,
                    value: masked_value(payload, size),
                }
            }
            // segmented and block transfers
            _ => return Err(Error::NotImplemented),
        };
        Ok(Self {
            direction,
            node_id,
            frame_data,
        })
    }

    /// The client-visible meaning of a server frame; `None` for requests.
    pub fn response(&self) -> Option<SdoResponse> {
        if self.direction != Direction::Tx {
            return None;
        }
        match self.frame_data {
            SdoFrameData::InitiateDownloadResponse { index, sub_index } => {
                Some(SdoResponse::DownloadConfirmed { index, sub_index })
            }
            SdoFrameData::InitiateUploadResponse {
                index,
                sub_index,
                size,
                value,
            } => Some(SdoResponse::Uploaded {
                index,
                sub_index,
                size,
                value,
            }),
            SdoFrameData::AbortTransfer {
                index,
                sub_index,
                abort_code,
            } => Some(SdoResponse::Aborted {
                index,
                sub_index,
                abort_code,
            }),
            _ => None,
        }
    }

    /// Object address and, for writes, the value, of a client request.
    #[cfg(test)]
    pub(crate) fn request(&self) -> Option<(u16, u8, Option<(u32, ObjectSize)>)> {
        if self.direction != Direction::Rx {
            return None;
        }
        match self.frame_data {
            SdoFrameData::InitiateUploadRequest { index, sub_index } => {
                Some((index, sub_index, None))
            }
            SdoFrameData::InitiateDownloadRequest {
                index,
                sub_index,
                size,
                value,
            } => Some((index, sub_index, Some((value, size)))),
            _ => None,
        }
    }
}

impl From<SdoFrame> for CanOpenFrame {
    fn from(frame: SdoFrame) -> Self {
        CanOpenFrame::SdoFrame(frame)
    }
}

impl ConvertibleFrame for SdoFrame {
    fn communication_object(&self) -> CommunicationObject {
        match self.direction {
            Direction::Tx => CommunicationObject::TxSdo(self.node_id),
            Direction::Rx => CommunicationObject::RxSdo(self.node_id),
        }
    }

    fn set_data<'a>(&self, buf: &'a mut [u8]) -> &'a [u8] {
        self.frame_data.write_bytes(buf);
        &buf[..SdoFrameData::DATA_SIZE]
    }
}
