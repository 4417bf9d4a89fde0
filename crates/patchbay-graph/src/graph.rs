mod compiler;
mod object;
mod store;

use std::fmt::Debug;

pub use self::compiler::{CompiledPatch, IoRange, Step};
pub(crate) use self::compiler::{
    compile_patch, connection_patch, creates_cycle, valid_endpoints, CompiledOutput, VoiceBuffers,
};

pub use self::object::{
    Connection, GraphObject, GraphObjectKind, NodeData, ObjectType, PatchData, PortData,
};
pub use self::store::GraphObjectStore;

macro_rules! handle_type {
    ($(#[$attr:meta])* $name:ident, $debug_name:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) thunderdome::Index);

        impl $name {
            pub const DANGLING: Self = Self(thunderdome::Index::DANGLING);
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    "{}-{}-{}",
                    $debug_name,
                    self.0.slot(),
                    self.0.generation()
                )
            }
        }
    };
}

handle_type!(
    /// The realtime handle of a node or patch.
    NodeHandle,
    "node"
);
handle_type!(
    /// The realtime handle of one voice buffer of a port or connection.
    BufferId,
    "buf"
);
handle_type!(
    /// The realtime handle of a transfer queue between execution contexts.
    QueueId,
    "queue"
);
