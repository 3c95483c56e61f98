use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;

use crate::bus::{CanInterface, FrameBus, SubscriptionId};
use crate::error::Result;
use crate::frame::{
    to_can_frame, CanFrame, CanOpenFrame, ObjectSize, RxPdo2Frame, Tpdo1Snapshot, Tpdo2Snapshot,
};
use crate::id::NodeId;
use crate::sdo_client::SdoClient;

const TPDO1_COB_IDS: std::ops::RangeInclusive<u16> = 0x180..=0x1FF;
const TPDO2_COB_IDS: std::ops::RangeInclusive<u16> = 0x280..=0x2FF;

/// Latest process data received from one node.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeTelemetry {
    pub tpdo1: Tpdo1Snapshot,
    pub tpdo1_updated: Option<SystemTime>,
    pub tpdo2: Tpdo2Snapshot,
    pub tpdo2_updated: Option<SystemTime>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TelemetryEvent {
    Tpdo1 {
        node_id: NodeId,
        snapshot: Tpdo1Snapshot,
    },
    Tpdo2 {
        node_id: NodeId,
        snapshot: Tpdo2Snapshot,
    },
}

type Observer = dyn Fn(&TelemetryEvent) + Send + Sync;

/// Telemetry arena indexed by node id.
///
/// The receiver task is the only writer. Each update swaps in a whole new
/// [`NodeTelemetry`] record, so readers on other tasks never see a record
/// that mixes two frames.
pub struct PdoStore {
    nodes: [ArcSwap<NodeTelemetry>; NodeId::MAX as usize + 1],
    observers: ArcSwap<Vec<Arc<Observer>>>,
}

impl Default for PdoStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PdoStore {
    pub fn new() -> Self {
        Self {
            nodes: std::array::from_fn(|_| ArcSwap::from_pointee(NodeTelemetry::default())),
            observers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Feeds every inbound TPDO1/TPDO2 frame on `bus` into this store.
    pub fn attach<I>(self: &Arc<Self>, bus: &FrameBus<I>) -> SubscriptionId {
        let store = Arc::clone(self);
        bus.subscribe(
            |cob_id| TPDO1_COB_IDS.contains(&cob_id) || TPDO2_COB_IDS.contains(&cob_id),
            move |frame| store.handle_frame(frame),
        )
    }

    /// Registers an observer called inline, on the receiving task, after each update.
    pub fn observe<F>(&self, observer: F)
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        let observer: Arc<Observer> = Arc::new(observer);
        self.observers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&observer));
            next
        });
    }

    pub fn handle_frame(&self, frame: &CanFrame) {
        let event = match CanOpenFrame::try_from(*frame) {
            Ok(CanOpenFrame::TxPdo1Frame(pdo)) => {
                self.nodes[pdo.node_id.index()].rcu(|current| NodeTelemetry {
                    tpdo1: pdo.snapshot,
                    tpdo1_updated: Some(SystemTime::now()),
                    ..**current
                });
                TelemetryEvent::Tpdo1 {
                    node_id: pdo.node_id,
                    snapshot: pdo.snapshot,
                }
            }
            Ok(CanOpenFrame::TxPdo2Frame(pdo)) => {
                self.nodes[pdo.node_id.index()].rcu(|current| NodeTelemetry {
                    tpdo2: pdo.snapshot,
                    tpdo2_updated: Some(SystemTime::now()),
                    ..**current
                });
                TelemetryEvent::Tpdo2 {
                    node_id: pdo.node_id,
                    snapshot: pdo.snapshot,
                }
            }
            Ok(_) => return,
            Err(err) => {
                log::trace!("ignored {}: {}", frame, err);
                return;
            }
        };
        for observer in self.observers.load().iter() {
            observer(&event);
        }
    }

    pub fn telemetry(&self, node_id: NodeId) -> NodeTelemetry {
        **self.nodes[node_id.index()].load()
    }

    pub fn tpdo1(&self, node_id: NodeId) -> Tpdo1Snapshot {
        self.telemetry(node_id).tpdo1
    }

    pub fn tpdo2(&self, node_id: NodeId) -> Tpdo2Snapshot {
        self.telemetry(node_id).tpdo2
    }

    /// RPDO2 carrying target velocity (counts/s) and mode of operation.
    pub fn build_rpdo2(node_id: NodeId, target_velocity: i32, mode: i8) -> CanFrame {
        to_can_frame(&RxPdo2Frame::new(node_id, target_velocity, mode))
    }
}

/// One entry of a PDO mapping table.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MappedObject {
    pub index: u16,
    pub sub_index: u8,
    pub bits: u8,
}

impl MappedObject {
    const fn new(index: u16, sub_index: u8, bits: u8) -> Self {
        Self {
            index,
            sub_index,
            bits,
        }
    }

    /// Mapping descriptor as written to 0x16xx/0x1Axx, e.g. `0x60FF0020`.
    pub fn descriptor(&self) -> u32 {
        (self.index as u32) << 16 | (self.sub_index as u32) << 8 | self.bits as u32
    }
}

/// A dynamic PDO: its communication parameter object, mapping object, COB-ID
/// base and mapped contents.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PdoMapping {
    pub name: &'static str,
    pub communication_index: u16,
    pub mapping_index: u16,
    pub cob_id_base: u16,
    pub objects: &'static [MappedObject],
}

/// Bit 31 of a PDO COB-ID entry: PDO does not exist / is not valid.
const PDO_DISABLED: u32 = 0x8000_0000;

pub const RPDO2_MAPPING: PdoMapping = PdoMapping {
    name: "RPDO2",
    communication_index: 0x1401,
    mapping_index: 0x1601,
    cob_id_base: 0x300,
    objects: &[
        MappedObject::new(0x60FF, 0, 32),
        MappedObject::new(0x6060, 0, 8),
    ],
};

pub const TPDO1_MAPPING: PdoMapping = PdoMapping {
    name: "TPDO1",
    communication_index: 0x1800,
    mapping_index: 0x1A00,
    cob_id_base: 0x180,
    objects: &[
        MappedObject::new(0x6041, 0, 16),
        MappedObject::new(0x6064, 0, 32),
        MappedObject::new(0x6077, 0, 16),
    ],
};

pub const TPDO2_MAPPING: PdoMapping = PdoMapping {
    name: "TPDO2",
    communication_index: 0x1801,
    mapping_index: 0x1A01,
    cob_id_base: 0x280,
    objects: &[
        MappedObject::new(0x606C, 0, 32),
        MappedObject::new(0x6061, 0, 8),
    ],
};

pub const DRIVE_MAPPINGS: [PdoMapping; 3] = [RPDO2_MAPPING, TPDO1_MAPPING, TPDO2_MAPPING];

impl PdoMapping {
    /// The SDO writes, in order, that install this mapping on `node_id`.
    pub fn writes(&self, node_id: NodeId) -> Vec<(u16, u8, u32, ObjectSize)> {
        let cob_id = (self.cob_id_base + node_id.as_raw() as u16) as u32;
        let mut writes = Vec::with_capacity(self.objects.len() + 4);
        writes.push((self.communication_index, 1, PDO_DISABLED | cob_id, ObjectSize::U32));
        writes.push((self.mapping_index, 0, 0, ObjectSize::U8));
        for (n, object) in self.objects.iter().enumerate() {
            writes.push((
                self.mapping_index,
                n as u8 + 1,
                object.descriptor(),
                ObjectSize::U32,
            ));
        }
        writes.push((
            self.mapping_index,
            0,
            self.objects.len() as u32,
            ObjectSize::U8,
        ));
        writes.push((self.communication_index, 1, cob_id, ObjectSize::U32));
        writes
    }

    /// Installs the mapping. Stops at the first failed write, leaving the PDO disabled.
    pub async fn apply<I>(&self, sdo: &SdoClient<I>, node_id: NodeId) -> Result<()>
    where
        I: Send + Sync + CanInterface + 'static,
    {
        for (index, sub_index, value, size) in self.writes(node_id) {
            sdo.write(node_id, index, sub_index, value, size).await?;
        }
        log::debug!("{} mapped on node {}", self.name, node_id);
        Ok(())
    }
}
