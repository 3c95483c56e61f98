use std::fmt;

use libc::CAN_MAX_DLEN;

use crate::error::{Error, Result};
use crate::id::CommunicationObject;

pub(crate) trait ConvertibleFrame {
    fn communication_object(&self) -> CommunicationObject;
    fn set_data<'a>(&self, buf: &'a mut [u8]) -> &'a [u8];
}

mod nmt_node_control;
pub use nmt_node_control::{NmtCommand, NmtNodeControlAddress, NmtNodeControlFrame};

pub(crate) mod sdo;
pub use sdo::{ObjectSize, SdoFrame, SdoResponse};

mod pdo;
pub use pdo::{RxPdo2Frame, Tpdo1Snapshot, Tpdo2Snapshot, TxPdo1Frame, TxPdo2Frame};

/// Highest identifier representable in an 11-bit (CAN 2.0A) frame.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// A classic CAN data frame: an 11-bit COB-ID and up to eight payload bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    cob_id: u16,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl CanFrame {
    pub fn new(cob_id: u16, data: &[u8]) -> Result<Self> {
        if cob_id > MAX_STANDARD_ID {
            return Err(Error::InvalidCobId(cob_id));
        }
        if data.len() > CAN_MAX_DLEN {
            return Err(Error::InvalidDataLength {
                length: data.len(),
                data_type: "CanFrame".to_owned(),
            });
        }
        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            cob_id,
            len: data.len() as u8,
            data: buf,
        })
    }

    pub fn cob_id(&self) -> u16 {
        self.cob_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

// cansend notation, e.g. `601#4041600000000000`
impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#", self.cob_id)?;
        for byte in self.data() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame({})", self)
    }
}

pub(crate) fn to_can_frame<T: ConvertibleFrame>(frame: &T) -> CanFrame {
    let mut buf = [0u8; CAN_MAX_DLEN];
    let data = frame.set_data(&mut buf);
    CanFrame::new(frame.communication_object().as_cob_id(), data)
        .expect("Should have failed only when the data length exceeded `CAN_MAX_DLEN`")
}

#[derive(Debug, PartialEq)]
pub enum CanOpenFrame {
    NmtNodeControlFrame(NmtNodeControlFrame),
    SdoFrame(SdoFrame),
    TxPdo1Frame(TxPdo1Frame),
    TxPdo2Frame(TxPdo2Frame),
    RxPdo2Frame(RxPdo2Frame),
}

impl From<CanOpenFrame> for CanFrame {
    fn from(frame: CanOpenFrame) -> Self {
        match frame {
            CanOpenFrame::NmtNodeControlFrame(frame) => to_can_frame(&frame),
            CanOpenFrame::SdoFrame(frame) => to_can_frame(&frame),
            CanOpenFrame::TxPdo1Frame(frame) => to_can_frame(&frame),
            CanOpenFrame::TxPdo2Frame(frame) => to_can_frame(&frame),
            CanOpenFrame::RxPdo2Frame(frame) => to_can_frame(&frame),
        }
    }
}

impl TryFrom<CanFrame> for CanOpenFrame {
    type Error = Error;
    fn try_from(frame: CanFrame) -> Result<Self> {
        let cob: CommunicationObject = frame.cob_id().try_into()?;
        match cob {
            CommunicationObject::NmtNodeControl => {
                Ok(NmtNodeControlFrame::new_with_bytes(frame.data())?.into())
            }
            CommunicationObject::TxSdo(node_id) => Ok(SdoFrame::new_with_bytes(
                sdo::Direction::Tx,
                node_id,
                frame.data(),
            )?
            .into()),
            CommunicationObject::RxSdo(node_id) => Ok(SdoFrame::new_with_bytes(
                sdo::Direction::Rx,
                node_id,
                frame.data(),
            )?
            .into()),
            CommunicationObject::TxPdo1(node_id) => {
                Ok(TxPdo1Frame::new_with_bytes(node_id, frame.data()).into())
            }
            CommunicationObject::TxPdo2(node_id) => {
                Ok(TxPdo2Frame::new_with_bytes(node_id, frame.data()).into())
            }
            CommunicationObject::RxPdo2(node_id) => {
                Ok(RxPdo2Frame::new_with_bytes(node_id, frame.data())?.into())
            }
            _ => Err(Error::NotImplemented),
        }
    }
}
