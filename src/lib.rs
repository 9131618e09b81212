pub mod constants;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod packet;
pub mod queue;
pub mod session;
pub mod transport;

pub use crypto::{Keyring, Token};
pub use device::{DeviceConfig, MiIoDevice, MiIoEvent, ResponseResult};
pub use discovery::{DiscoveredDevice, Discovery};
pub use error::{MiIoError, Result};
pub use packet::Packet;
pub use transport::SocketRegistry;
