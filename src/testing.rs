//! Loopback link layer and a simulated CiA 402 drive for unit tests.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::bus::CanInterface;
use crate::error::{Error, Result};
use crate::frame::{CanFrame, CanOpenFrame, ObjectSize, SdoFrame};
use crate::id::NodeId;

type Responder = Box<dyn Fn(&CanFrame) -> Vec<CanFrame> + Send + Sync>;

pub(crate) struct LoopbackInterface {
    sent: Arc<Mutex<Vec<CanFrame>>>,
    responder: Responder,
    inbound_tx: UnboundedSender<Result<CanFrame>>,
    inbound_rx: tokio::sync::Mutex<UnboundedReceiver<Result<CanFrame>>>,
    fail_sends: Arc<AtomicBool>,
}

impl LoopbackInterface {
    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CanFrame) -> Vec<CanFrame> + Send + Sync + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            responder: Box::new(responder),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            fail_sends: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn silent() -> Self {
        Self::with_responder(|_| Vec::new())
    }

    pub(crate) fn with_drives(drives: Vec<Arc<SimulatedDrive>>) -> Self {
        Self::with_responder(move |frame| {
            drives
                .iter()
                .filter_map(|drive| drive.respond(frame))
                .collect()
        })
    }

    pub(crate) fn sent_frames(&self) -> Arc<Mutex<Vec<CanFrame>>> {
        Arc::clone(&self.sent)
    }

    /// Feeds frames, or read errors, to `wait_for_frame`.
    pub(crate) fn injector(&self) -> UnboundedSender<Result<CanFrame>> {
        self.inbound_tx.clone()
    }

    pub(crate) fn send_failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_sends)
    }
}

#[async_trait]
impl CanInterface for LoopbackInterface {
    async fn send_frame(&self, frame: CanFrame) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport(ErrorKind::BrokenPipe));
        }
        self.sent.lock().unwrap().push(frame);
        for response in (self.responder)(&frame) {
            let _ = self.inbound_tx.send(Ok(response));
        }
        Ok(())
    }

    async fn wait_for_frame(&self) -> Result<CanFrame> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(Error::Transport(ErrorKind::UnexpectedEof)))
    }
}

pub(crate) const STATUS_SWITCH_ON_DISABLED: u16 = 0x0240;
pub(crate) const STATUS_READY_TO_SWITCH_ON: u16 = 0x0221;
pub(crate) const STATUS_SWITCHED_ON: u16 = 0x0223;
pub(crate) const STATUS_OPERATION_ENABLED: u16 = 0x0627;
pub(crate) const STATUS_FAULT: u16 = 0x0208;

const ABORT_OBJECT_DOES_NOT_EXIST: u32 = 0x0602_0000;

#[derive(Default)]
struct DriveModel {
    status_word: u16,
    objects: HashMap<(u16, u8), u32>,
    writes: Vec<(u16, u8, u32, ObjectSize)>,
    rpdo_velocities: Vec<(i32, i8)>,
    frozen: bool,
    muted: bool,
    abort_index: Option<u16>,
}

/// Answers expedited SDO traffic for one node the way a CiA 402 servo does,
/// including the power state machine driven by control word writes.
pub(crate) struct SimulatedDrive {
    node_id: NodeId,
    model: Mutex<DriveModel>,
}

impl SimulatedDrive {
    pub(crate) fn new(raw_node_id: u8) -> Arc<Self> {
        Arc::new(Self {
            node_id: raw_node_id.try_into().unwrap(),
            model: Mutex::new(DriveModel {
                status_word: STATUS_SWITCH_ON_DISABLED,
                ..Default::default()
            }),
        })
    }

    pub(crate) fn set_status_word(&self, status_word: u16) {
        self.model.lock().unwrap().status_word = status_word;
    }

    pub(crate) fn status_word(&self) -> u16 {
        self.model.lock().unwrap().status_word
    }

    /// Control words are acknowledged but no longer move the state machine.
    pub(crate) fn freeze(&self) {
        self.model.lock().unwrap().frozen = true;
    }

    /// Stops answering SDO requests altogether.
    pub(crate) fn mute(&self) {
        self.model.lock().unwrap().muted = true;
    }

    pub(crate) fn abort_on(&self, index: u16) {
        self.model.lock().unwrap().abort_index = Some(index);
    }

    pub(crate) fn set_object(&self, index: u16, sub_index: u8, value: u32) {
        self.model
            .lock()
            .unwrap()
            .objects
            .insert((index, sub_index), value);
    }

    pub(crate) fn object(&self, index: u16, sub_index: u8) -> Option<u32> {
        self.model
            .lock()
            .unwrap()
            .objects
            .get(&(index, sub_index))
            .copied()
    }

    pub(crate) fn writes(&self) -> Vec<(u16, u8, u32, ObjectSize)> {
        self.model.lock().unwrap().writes.clone()
    }

    pub(crate) fn control_words(&self) -> Vec<u32> {
        self.writes()
            .into_iter()
            .filter(|(index, _, _, _)| *index == 0x6040)
            .map(|(_, _, value, _)| value)
            .collect()
    }

    pub(crate) fn rpdo_velocities(&self) -> Vec<(i32, i8)> {
        self.model.lock().unwrap().rpdo_velocities.clone()
    }

    fn respond(&self, frame: &CanFrame) -> Option<CanFrame> {
        match CanOpenFrame::try_from(*frame).ok()? {
            CanOpenFrame::SdoFrame(sdo) if sdo.node_id == self.node_id => {
                let (index, sub_index, write) = sdo.request()?;
                let response = self.handle_sdo(index, sub_index, write)?;
                Some(CanOpenFrame::from(response).into())
            }
            CanOpenFrame::RxPdo2Frame(pdo) if pdo.node_id == self.node_id => {
                let mut model = self.model.lock().unwrap();
                model.rpdo_velocities.push((pdo.target_velocity, pdo.mode));
                model.objects.insert((0x606C, 0), pdo.target_velocity as u32);
                None
            }
            _ => None,
        }
    }

    fn handle_sdo(
        &self,
        index: u16,
        sub_index: u8,
        write: Option<(u32, ObjectSize)>,
    ) -> Option<SdoFrame> {
        let mut model = self.model.lock().unwrap();
        if model.muted {
            return None;
        }
        if model.abort_index == Some(index) {
            return Some(SdoFrame::new_abort_response(
                self.node_id,
                index,
                sub_index,
                ABORT_OBJECT_DOES_NOT_EXIST,
            ));
        }
        match write {
            Some((value, size)) => {
                model.writes.push((index, sub_index, value, size));
                match index {
                    0x6040 if !model.frozen => {
                        model.status_word = next_status(model.status_word, value as u16);
                    }
                    0x6040 => {}
                    0x60FF => {
                        // velocity loop settles instantly
                        model.objects.insert((0x60FF, 0), value);
                        model.objects.insert((0x606C, 0), value);
                    }
                    0x6060 => {
                        model.objects.insert((0x6060, 0), value);
                        model.objects.insert((0x6061, 0), value);
                    }
                    _ => {
                        model.objects.insert((index, sub_index), value);
                    }
                }
                Some(SdoFrame::new_download_response(self.node_id, index, sub_index))
            }
            None => {
                let (value, size) = match index {
                    0x6041 => (model.status_word as u32, ObjectSize::U16),
                    0x6061 => (*model.objects.get(&(0x6061, 0)).unwrap_or(&0), ObjectSize::U8),
                    _ => match model.objects.get(&(index, sub_index)) {
                        Some(value) => (*value, ObjectSize::U32),
                        None => {
                            return Some(SdoFrame::new_abort_response(
                                self.node_id,
                                index,
                                sub_index,
                                ABORT_OBJECT_DOES_NOT_EXIST,
                            ))
                        }
                    },
                };
                Some(SdoFrame::new_upload_response(
                    self.node_id,
                    index,
                    sub_index,
                    value,
                    size,
                ))
            }
        }
    }
}

fn next_status(status_word: u16, control_word: u16) -> u16 {
    match (status_word, control_word) {
        (STATUS_FAULT, 0x80) => STATUS_SWITCH_ON_DISABLED,
        (STATUS_FAULT, _) => STATUS_FAULT,
        (_, 0x06) => STATUS_READY_TO_SWITCH_ON,
        (STATUS_READY_TO_SWITCH_ON, 0x07) | (STATUS_OPERATION_ENABLED, 0x07) => STATUS_SWITCHED_ON,
        (STATUS_SWITCHED_ON, 0x0F) | (STATUS_OPERATION_ENABLED, 0x0F) => STATUS_OPERATION_ENABLED,
        (current, _) => current,
    }
}
