mod buffer;
pub mod maid;
pub mod node;
mod path;
pub mod slab;
pub mod util;
mod value;

pub use buffer::{Buffer, BufferFactory, PortType, TimedEvent};
pub use maid::{Maid, MaidHandle};
pub use path::{InvalidPath, Path};
pub use value::{Properties, Value};

/// The default number of frames in one processing cycle.
///
/// Drivers may use any cycle size, this is only used when nothing else
/// is configured.
pub const DEFAULT_CYCLE_SIZE: usize = 256;

/// The maximum number of input or output ports a single node may have.
pub const MAX_PORTS: usize = 64;
