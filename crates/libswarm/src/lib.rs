pub mod bandwidth;
mod clock;
pub mod config;
pub mod error;
pub mod peer;
pub mod portfwd;
pub mod session;
pub mod web;

pub use bandwidth::{BandwidthTree, Direction, NodeId, RateMeter, SpeedKind};
pub use config::SessionConfig;
pub use error::SwarmError;
pub use peer::{PeerIo, Priority};
pub use portfwd::{MappingStatus, PortMappingBackend, PortSupervisor};
pub use session::Session;
pub use web::{BandwidthGate, CloseMode, DoneFunc, TorrentId, WebDone, WebTransport};
