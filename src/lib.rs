pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod mesh;
pub mod relay;
pub mod rtc;
pub mod session;
pub mod sessions;
pub mod signaling;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod wsproto;

pub mod daemon;

pub use mesh::{MeshHandle, MeshOptions};
pub use types::{ParticipantId, Role};
