//! Typed front-ends over the raw [`Handle`] used to index arenas.
//!
//! Per the design note on cyclic graphs: pages, mappers, tasks, threads and
//! regions never hold references to one another, only one of these ids,
//! resolved through the owning [`HandleMap`](super::HandleMap) under the
//! [`crate::Kernel`] handle.

use super::Handle;

macro_rules! handle_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(Handle);

        impl $name {
            /// Wraps a raw handle minted by a [`super::HandleMap`].
            #[must_use]
            pub const fn from_raw(handle: Handle) -> Self {
                Self(handle)
            }

            /// The raw handle, for passing back into the owning arena.
            #[must_use]
            pub const fn raw(self) -> Handle {
                self.0
            }
        }

        impl From<Handle> for $name {
            fn from(handle: Handle) -> Self {
                Self(handle)
            }
        }

        impl From<$name> for Handle {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

handle_id!(
    /// Identifies a [`crate::memory::page::Page`] in the kernel's page arena.
    PageId
);
handle_id!(
    /// Identifies a [`crate::memory::mapper::Mapper`] in the kernel's mapper arena.
    MapperId
);
handle_id!(
    /// Identifies a [`crate::process::task::Task`] in the kernel's task arena.
    TaskId
);
handle_id!(
    /// Identifies a [`crate::process::thread::Thread`] in the kernel's thread arena.
    ThreadId
);
handle_id!(
    /// Identifies a [`crate::memory::vmm::Region`] in a task's region arena.
    RegionId
);
