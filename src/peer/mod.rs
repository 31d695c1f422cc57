//! Соединения с собеседниками: транспорт, кандидаты, арена соединений.

pub mod connection;
pub mod ice;
pub mod link;
pub mod manager;
pub mod media;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::RtcTransportFactory;
pub use link::PeerLink;
pub use manager::{CloseReason, ClosedLink, LinkSummary, LinkUpdate, PeerManager};
pub use media::{LocalStream, RemotePacket, RemoteStream};
pub use state::LinkState;
pub use transport::{
    LinkEvent, LinkEventKind, MediaTransport, SignalingState, TransportEvent, TransportEventSink, TransportFactory,
    TransportState,
};
pub use types::{IceCandidate, Role, SdpKind, ServerConfig, SessionDescription};
