use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bus::{CanInterface, FrameBus, FrameTap, DEFAULT_TAP_CAPACITY};
use crate::error::{Error, Result};
use crate::frame::sdo::Direction;
use crate::frame::{CanFrame, ObjectSize, SdoFrame, SdoResponse};
use crate::id::{CommunicationObject, NodeId};

pub const DEFAULT_SDO_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_SDO_POLL_INTERVAL: Duration = Duration::from_millis(1);

const COMMAND_ABORT: u8 = 0x80;
const COMMAND_DOWNLOAD_CONFIRMED: u8 = 0x60;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Transfer {
    Read,
    Write,
}

/// Expedited SDO client shared by every node on the bus.
///
/// Responses are matched on COB-ID alone, so the transaction lock is held for
/// the whole request/response exchange (including its timeout) and at most
/// one transaction is outstanding on the bus. Failed transactions are never
/// retried here.
pub struct SdoClient<I> {
    bus: FrameBus<I>,
    responses: Mutex<FrameTap>,
    timeout: Duration,
    poll_interval: Duration,
}

impl<I> SdoClient<I>
where
    I: Send + Sync + CanInterface + 'static,
{
    pub fn new(bus: FrameBus<I>) -> Self {
        Self::with_timing(
            bus,
            DEFAULT_SDO_TIMEOUT,
            DEFAULT_SDO_POLL_INTERVAL,
            DEFAULT_TAP_CAPACITY,
        )
    }

    pub fn with_timing(
        bus: FrameBus<I>,
        timeout: Duration,
        poll_interval: Duration,
        tap_capacity: usize,
    ) -> Self {
        let responses = bus.tap(0x581..=0x5FF, tap_capacity);
        Self {
            bus,
            responses: Mutex::new(responses),
            timeout,
            poll_interval,
        }
    }

    pub async fn write(
        &self,
        node_id: NodeId,
        index: u16,
        sub_index: u8,
        value: u32,
        size: ObjectSize,
    ) -> Result<()> {
        let request = SdoFrame::new_sdo_write_frame(node_id, index, sub_index, value, size);
        self.transact(node_id, index, sub_index, Transfer::Write, request)
            .await
            .map(|_| ())
            .map_err(|err| {
                log::warn!(
                    "SDO write 0x{:04X}:{} = 0x{:X} on node {} failed: {}",
                    index,
                    sub_index,
                    value,
                    node_id,
                    err
                );
                err
            })
    }

    /// Reads an expedited object; 1- and 2-byte values are zero-extended.
    pub async fn read(&self, node_id: NodeId, index: u16, sub_index: u8) -> Result<u32> {
        let request = SdoFrame::new_sdo_read_frame(node_id, index, sub_index);
        self.transact(node_id, index, sub_index, Transfer::Read, request)
            .await
            .map_err(|err| {
                log::warn!(
                    "SDO read 0x{:04X}:{} on node {} failed: {}",
                    index,
                    sub_index,
                    node_id,
                    err
                );
                err
            })
    }

    async fn transact(
        &self,
        node_id: NodeId,
        index: u16,
        sub_index: u8,
        transfer: Transfer,
        request: SdoFrame,
    ) -> Result<u32> {
        let responses = self.responses.lock().await;
        responses.clear();
        self.bus.send_canopen(request).await?;

        let expected = CommunicationObject::TxSdo(node_id).as_cob_id();
        let started = Instant::now();
        while started.elapsed() < self.timeout {
            while let Some(frame) = responses.try_pop() {
                if frame.cob_id() != expected || frame.data().is_empty() {
                    continue;
                }
                if let Some(value) = interpret(transfer, node_id, index, sub_index, &frame)? {
                    return Ok(value);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(Error::SdoTimeout {
            node_id: node_id.as_raw(),
            index,
            sub_index,
        })
    }
}

/// `Ok(None)` means keep waiting.
fn interpret(
    transfer: Transfer,
    node_id: NodeId,
    index: u16,
    sub_index: u8,
    frame: &CanFrame,
) -> Result<Option<u32>> {
    let command = frame.data()[0];
    if command == COMMAND_ABORT {
        let abort_code = match frame.data() {
            [_, _, _, _, a, b, c, d, ..] => u32::from_le_bytes([*a, *b, *c, *d]),
            _ => 0,
        };
        return Err(Error::SdoAbort {
            node_id: node_id.as_raw(),
            index,
            sub_index,
            abort_code,
        });
    }
    match transfer {
        Transfer::Write => Ok((command == COMMAND_DOWNLOAD_CONFIRMED).then_some(0)),
        Transfer::Read => match SdoFrame::new_with_bytes(Direction::Tx, node_id, frame.data())
            .ok()
            .and_then(|frame| frame.response())
        {
            Some(SdoResponse::Uploaded { value, .. }) => Ok(Some(value)),
            _ => Err(Error::UnexpectedSdoResponse(command)),
        },
    }
}
