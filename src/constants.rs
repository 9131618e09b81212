// Protocol constants for the MiIO wire format

use std::net::Ipv4Addr;
use std::time::Duration;

/// Magic word at the start of every MiIO packet
pub const MAGIC: u16 = 0x2131;

/// Size of the fixed packet header (32 bytes)
pub const HEADER_SIZE: usize = 32;

/// Size of the checksum/token field (16 bytes)
pub const CHECKSUM_SIZE: usize = 16;

/// Size of a device token (16 bytes)
pub const TOKEN_SIZE: usize = 16;

/// UDP port devices listen on for commands and discovery
pub const COMMAND_PORT: u16 = 54321;

/// Multicast address probed during discovery in addition to
/// the per-interface broadcast addresses
pub const MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// Maximum properties per get_prop request; devices truncate
/// or reject larger batches
pub const MAX_PROPERTIES: usize = 5;

/// Ceiling on outstanding requests before periodic refresh
/// sends are shed for the cycle
pub const MAX_PENDING_REQUESTS: usize = 5;

/// Receive buffer size; MiIO datagrams are well below this
pub const BUFFER_LENGTH: usize = 1024;

/// How long to wait for a handshake reply
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pending requests older than this are purged opportunistically
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Window during which discovery collects replies per target
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a handshake stamp stays usable before the session
/// re-handshakes to refresh the device clock
pub const STAMP_TTL: Duration = Duration::from_secs(120);
