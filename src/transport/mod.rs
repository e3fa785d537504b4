pub mod memory;
pub mod tcp;
pub mod traits;

pub use memory::{MemoryRemote, MemoryTransport};
pub use tcp::TcpTransport;
pub use traits::{FrameHandler, Transport};
