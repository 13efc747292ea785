//! Network subsystem: sockets, control channel, receivers and jitter buffers

pub mod buffer;
pub mod control;
pub mod receiver;
pub mod resolve;
pub mod tcp;
pub mod udp;

pub use buffer::{JitterBuffer, JitterBufferStats, JitterEntry, SharedJitterBuffer};
pub use control::ControlClient;
pub use receiver::{ReceiverCounters, ReceiverStats, StreamReceiver};
pub use resolve::{detect_local_ip, resolve_host};
pub use tcp::probe_tcp;
pub use udp::open_udp;
