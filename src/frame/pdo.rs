use crate::error::{Error, Result};
use crate::frame::{CanOpenFrame, ConvertibleFrame};
use crate::id::{CommunicationObject, NodeId};

/// TPDO1 payload: status word (0x6041), actual position (0x6064), actual torque (0x6077).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Tpdo1Snapshot {
    pub status_word: u16,
    pub actual_position: i32,
    pub actual_torque: i16,
}

impl Tpdo1Snapshot {
    /// Fields whose bytes are missing from a short payload stay zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut snapshot = Self::default();
        if bytes.len() >= 2 {
            snapshot.status_word = u16::from_le_bytes([bytes[0], bytes[1]]);
        }
        if bytes.len() >= 6 {
            snapshot.actual_position = i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        }
        if bytes.len() >= 8 {
            snapshot.actual_torque = i16::from_le_bytes([bytes[6], bytes[7]]);
        }
        snapshot
    }

    pub fn is_operation_enabled(&self) -> bool {
        self.status_word & 0x6F == 0x27
    }

    pub fn has_fault(&self) -> bool {
        self.status_word & 0x08 != 0
    }
}

/// TPDO2 payload: actual velocity (0x606C) and mode of operation display (0x6061).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Tpdo2Snapshot {
    pub actual_velocity: i32,
    pub mode_display: u8,
}

impl Tpdo2Snapshot {
    /// Anything shorter than five bytes decodes as all zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() < 5 {
            return Self::default();
        }
        Self {
            actual_velocity: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            mode_display: bytes[4],
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TxPdo1Frame {
    pub node_id: NodeId,
    pub snapshot: Tpdo1Snapshot,
}

impl TxPdo1Frame {
    const FRAME_DATA_SIZE: usize = 8;

    pub fn new(node_id: NodeId, snapshot: Tpdo1Snapshot) -> Self {
        Self { node_id, snapshot }
    }

    pub(crate) fn new_with_bytes(node_id: NodeId, bytes: &[u8]) -> Self {
        Self::new(node_id, Tpdo1Snapshot::from_bytes(bytes))
    }
}

impl From<TxPdo1Frame> for CanOpenFrame {
    fn from(frame: TxPdo1Frame) -> Self {
        CanOpenFrame::TxPdo1Frame(frame)
    }
}

impl ConvertibleFrame for TxPdo1Frame {
    fn communication_object(&self) -> CommunicationObject {
        CommunicationObject::TxPdo1(self.node_id)
    }

    fn set_data<'a>(&self, buf: &'a mut [u8]) -> &'a [u8] {
        buf[0..2].copy_from_slice(&self.snapshot.status_word.to_le_bytes());
        buf[2..6].copy_from_slice(&self.snapshot.actual_position.to_le_bytes());
        buf[6..8].copy_from_slice(&self.snapshot.actual_torque.to_le_bytes());
        &buf[..Self::FRAME_DATA_SIZE]
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TxPdo2Frame {
    pub node_id: NodeId,
    pub snapshot: Tpdo2Snapshot,
}

impl TxPdo2Frame {
    const FRAME_DATA_SIZE: usize = 5;

    pub fn new(node_id: NodeId, snapshot: Tpdo2Snapshot) -> Self {
        Self { node_id, snapshot }
    }

    pub(crate) fn new_with_bytes(node_id: NodeId, bytes: &[u8]) -> Self {
        Self::new(node_id, Tpdo2Snapshot::from_bytes(bytes))
    }
}

impl From<TxPdo2Frame> for CanOpenFrame {
    fn from(frame: TxPdo2Frame) -> Self {
        CanOpenFrame::TxPdo2Frame(frame)
    }
}

impl ConvertibleFrame for TxPdo2Frame {
    fn communication_object(&self) -> CommunicationObject {
        CommunicationObject::TxPdo2(self.node_id)
    }

    fn set_data<'a>(&self, buf: &'a mut [u8]) -> &'a [u8] {
        buf[0..4].copy_from_slice(&self.snapshot.actual_velocity.to_le_bytes());
        buf[4] = self.snapshot.mode_display;
        &buf[..Self::FRAME_DATA_SIZE]
    }
}

/// RPDO2 as mapped by this crate: target velocity (0x60FF) and mode of operation (0x6060).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RxPdo2Frame {
    pub node_id: NodeId,
    pub target_velocity: i32,
    pub mode: i8,
}

impl RxPdo2Frame {
    const FRAME_DATA_SIZE: usize = 5;

    pub fn new(node_id: NodeId, target_velocity: i32, mode: i8) -> Self {
        Self {
            node_id,
            target_velocity,
            mode,
        }
    }

    pub(crate) fn new_with_bytes(node_id: NodeId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::FRAME_DATA_SIZE {
            return Err(Error::InvalidDataLength {
                length: bytes.len(),
                data_type: "RxPdo2Frame".to_owned(),
            });
        }
        Ok(Self::new(
            node_id,
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            bytes[4] as i8,
        ))
    }
}

impl From<RxPdo2Frame> for CanOpenFrame {
    fn from(frame: RxPdo2Frame) -> Self {
        CanOpenFrame::RxPdo2Frame(frame)
    }
}

impl ConvertibleFrame for RxPdo2Frame {
    fn communication_object(&self) -> CommunicationObject {
        CommunicationObject::RxPdo2(self.node_id)
    }

    fn set_data<'a>(&self, buf: &'a mut [u8]) -> &'a [u8] {
        buf[0..4].copy_from_slice(&self.target_velocity.to_le_bytes());
        buf[4] = self.mode as u8;
        &buf[..Self::FRAME_DATA_SIZE]
    }
}
