use async_trait::async_trait;
use socketcan::async_io::CanSocket;

use crate::bus::CanInterface;
use crate::error::Result;
use crate::frame::CanFrame;

pub struct SocketCanInterface(CanSocket);

impl SocketCanInterface {
    /// Binds to an interface that is already up, e.g. `can0` or `vcan0`.
    pub fn open(interface_name: &str) -> Result<Self> {
        let socket = CanSocket::open(interface_name)?;
        log::info!("opened CAN interface {}", interface_name);
        Ok(Self(socket))
    }
}

#[async_trait]
impl CanInterface for SocketCanInterface {
    async fn send_frame(&self, frame: CanFrame) -> Result<()> {
        Ok(self
            .0
            .write_frame::<socketcan::CanFrame>(&frame.into())
            .await?)
    }

    async fn wait_for_frame(&self) -> Result<CanFrame> {
        self.0.read_frame().await?.try_into()
    }
}
