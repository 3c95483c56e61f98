use socketcan::EmbeddedFrame;

use crate::error::{Error, Result};
use crate::frame::CanFrame;

impl From<CanFrame> for socketcan::CanFrame {
    fn from(frame: CanFrame) -> Self {
        let id = socketcan::StandardId::new(frame.cob_id())
            .expect("CanFrame never holds a COB-ID beyond 11 bits");
        socketcan::CanFrame::new(id, frame.data())
            .expect("CanFrame never holds more than `CAN_MAX_DLEN` bytes")
    }
}

/// Remote and error frames are not CANopen traffic and map to `NotImplemented`.
impl TryFrom<socketcan::CanFrame> for CanFrame {
    type Error = Error;
    fn try_from(frame: socketcan::CanFrame) -> Result<Self> {
        match frame {
            socketcan::CanFrame::Data(frame) => match frame.id() {
                socketcan::Id::Standard(id) => CanFrame::new(id.as_raw(), frame.data()),
                socketcan::Id::Extended(_id) => Err(Error::CanFdNotSupported),
            },
            socketcan::CanFrame::Remote(_) => Err(Error::NotImplemented),
            socketcan::CanFrame::Error(_) => Err(Error::NotImplemented),
        }
    }
}
