//! Linux SocketCAN link layer.

mod frame;
mod interface;

pub use interface::SocketCanInterface;
