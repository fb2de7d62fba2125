//! Buffer Sidecar / Relay (C8, spec §4.8): runs inside the same pod/group
//! as the user container, bridging named pipes and relay sockets to
//! buffers via the Data-Plane Client (C7).
//!
//! - [`pipe::PipeBridge`] — read/write pipe modes
//! - [`relay::SocketRelay`] — relay input/output mode over the run's
//!   socket relay topology
//! - [`socket_adapt`] — socket-adapt mode's bounded-retry dial plus
//!   bidirectional file copy
//! - [`presence::MainContainerPresence`] — the shared "don't hang if the
//!   main container never starts" gate every pipe-bridging mode uses

pub mod pipe;
pub mod presence;
pub mod relay;
pub mod socket_adapt;

pub use pipe::PipeBridge;
pub use presence::MainContainerPresence;
pub use relay::SocketRelay;
