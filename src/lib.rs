pub use patchbay_core::*;
pub use patchbay_graph::*;
