use std::fmt;

use crate::error::{Error, Result};

/// Address of one CANopen device on the bus (1..=127). Zero is reserved for
/// NMT broadcast and never names a device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u8);

impl NodeId {
    pub const MAX: u8 = 0x7F;

    pub fn new(raw_id: u8) -> Result<Self> {
        match raw_id {
            1..=Self::MAX => Ok(Self(raw_id)),
            _ => Err(Error::InvalidNodeId(raw_id)),
        }
    }

    pub fn as_raw(&self) -> u8 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for NodeId {
    type Error = Error;
    fn try_from(raw_id: u8) -> std::result::Result<Self, Self::Error> {
        NodeId::new(raw_id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommunicationObject {
    NmtNodeControl,
    GlobalFailsafeCommand,
    Sync,
    Emergency(NodeId),
    TimeStamp,
    TxPdo1(NodeId),
    RxPdo1(NodeId),
    TxPdo2(NodeId),
    RxPdo2(NodeId),
    TxPdo3(NodeId),
    RxPdo3(NodeId),
    TxPdo4(NodeId),
    RxPdo4(NodeId),
    TxSdo(NodeId),
    RxSdo(NodeId),
    NmtNodeMonitoring(NodeId),
    TxLss,
    RxLss,
}

impl CommunicationObject {
    fn raw_id_to_node_id(cob_id: u16) -> Result<NodeId> {
        ((cob_id & 0x7F) as u8)
            .try_into()
            .map_err(|_| Error::InvalidCobId(cob_id))
    }

    pub fn new(id: u16) -> Result<Self> {
        if id & !0x07FF != 0 {
            return Err(Error::InvalidCobId(id));
        }
        match id & 0x0780 {
            0x000 => match id {
                0 => Ok(CommunicationObject::NmtNodeControl),
                1 => Ok(CommunicationObject::GlobalFailsafeCommand),
                _ => Err(Error::InvalidCobId(id)),
            },
            0x080 => match id & 0x007F {
                0 => Ok(CommunicationObject::Sync),
                _ => Ok(CommunicationObject::Emergency(Self::raw_id_to_node_id(id)?)),
            },
            0x100 => Ok(CommunicationObject::TimeStamp),
            0x180 => Ok(CommunicationObject::TxPdo1(Self::raw_id_to_node_id(id)?)),
            0x200 => Ok(CommunicationObject::RxPdo1(Self::raw_id_to_node_id(id)?)),
            0x280 => Ok(CommunicationObject::TxPdo2(Self::raw_id_to_node_id(id)?)),
            0x300 => Ok(CommunicationObject::RxPdo2(Self::raw_id_to_node_id(id)?)),
            0x380 => Ok(CommunicationObject::TxPdo3(Self::raw_id_to_node_id(id)?)),
            0x400 => Ok(CommunicationObject::RxPdo3(Self::raw_id_to_node_id(id)?)),
            0x480 => Ok(CommunicationObject::TxPdo4(Self::raw_id_to_node_id(id)?)),
            0x500 => Ok(CommunicationObject::RxPdo4(Self::raw_id_to_node_id(id)?)),
            0x580 => Ok(CommunicationObject::TxSdo(Self::raw_id_to_node_id(id)?)),
            0x600 => Ok(CommunicationObject::RxSdo(Self::raw_id_to_node_id(id)?)),
            0x700 => Ok(CommunicationObject::NmtNodeMonitoring(
                Self::raw_id_to_node_id(id)?,
            )),
            0x780 => match id {
                0x7E4 => Ok(CommunicationObject::TxLss),
                0x7E5 => Ok(CommunicationObject::RxLss),
                _ => Err(Error::InvalidCobId(id)),
            },
            _ => Err(Error::InvalidCobId(id)),
        }
    }

    pub fn as_cob_id(&self) -> u16 {
        match self {
            CommunicationObject::NmtNodeControl => 0x000,
            CommunicationObject::GlobalFailsafeCommand => 0x001,
            CommunicationObject::Sync => 0x080,
            CommunicationObject::Emergency(node_id) => 0x080 + node_id.as_raw() as u16,
            CommunicationObject::TimeStamp => 0x100,
            CommunicationObject::TxPdo1(node_id) => 0x180 + node_id.as_raw() as u16,
            CommunicationObject::RxPdo1(node_id) => 0x200 + node_id.as_raw() as u16,
            CommunicationObject::TxPdo2(node_id) => 0x280 + node_id.as_raw() as u16,
            CommunicationObject::RxPdo2(node_id) => 0x300 + node_id.as_raw() as u16,
            CommunicationObject::TxPdo3(node_id) => 0x380 + node_id.as_raw() as u16,
            CommunicationObject::RxPdo3(node_id) => 0x400 + node_id.as_raw() as u16,
            CommunicationObject::TxPdo4(node_id) => 0x480 + node_id.as_raw() as u16,
            CommunicationObject::RxPdo4(node_id) => 0x500 + node_id.as_raw() as u16,
            CommunicationObject::TxSdo(node_id) => 0x580 + node_id.as_raw() as u16,
            CommunicationObject::RxSdo(node_id) => 0x600 + node_id.as_raw() as u16,
            CommunicationObject::NmtNodeMonitoring(node_id) => 0x700 + node_id.as_raw() as u16,
            CommunicationObject::TxLss => 0x7E4,
            CommunicationObject::RxLss => 0x7E5,
        }
    }
}

impl TryFrom<u16> for CommunicationObject {
    type Error = Error;
    fn try_from(id: u16) -> Result<Self> {
        CommunicationObject::new(id)
    }
}
