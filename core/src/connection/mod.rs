/// Live session connections
pub mod manager;
pub mod socket;
pub mod transport;

pub use manager::ConnectionManager;
pub use socket::{ConnectionState, SessionSocket, SocketMachine};
pub use transport::{Connector, MemoryConnector, MemoryPeer, TransportEvent, TransportLink, WebSocketConnector};
