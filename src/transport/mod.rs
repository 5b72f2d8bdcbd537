//! Wire protocol and the connection to the remote agent.

pub mod bridge;
pub mod endpoint;
pub mod frame;

pub use bridge::{LinkState, RemoteBridge};
pub use endpoint::{ExecEndpoint, ExecStream};
pub use frame::{FrameCodec, TransportFrame};
