//! The syscall-boundary error projection.
//!
//! Every module keeps its own closed `snafu`-derived `Error` enum describing
//! the ways *that* operation can fail; [`Errno`] is what crosses into user
//! space, built by a `From<module::Error> for Errno` impl per module so the
//! mapping is exhaustive and checked by the compiler rather than by
//! convention.

/// POSIX-flavored error codes returned to user space at the syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Errno {
    EAGAIN,
    EINVAL,
    ENOMEM,
    ENOSPC,
    EBADFD,
    EPERM,
    ESRCH,
    EIO,
    ERANGE,
    EOVERFLOW,
    ENOSYS,
    EBUSY,
    EDEADLK,
}

impl From<crate::memory::Error> for Errno {
    fn from(err: crate::memory::Error) -> Self {
        match err {
            crate::memory::Error::OutOfMemory => Errno::ENOMEM,
            crate::memory::Error::InvalidSize => Errno::EINVAL,
            crate::memory::Error::UnknownPtr => Errno::EINVAL,
        }
    }
}

impl From<crate::memory::ppm::Error> for Errno {
    fn from(err: crate::memory::ppm::Error) -> Self {
        match err {
            crate::memory::ppm::Error::OutOfMemory => Errno::ENOMEM,
            crate::memory::ppm::Error::InvalidOrder => Errno::EINVAL,
            crate::memory::ppm::Error::UnknownBlock => Errno::EINVAL,
        }
    }
}

impl From<crate::memory::mapper::Error> for Errno {
    fn from(err: crate::memory::mapper::Error) -> Self {
        match err {
            crate::memory::mapper::Error::BackingStore { .. } => Errno::EIO,
            crate::memory::mapper::Error::OutOfMemory => Errno::ENOMEM,
            crate::memory::mapper::Error::InvalidIndex => Errno::EINVAL,
        }
    }
}

impl From<crate::memory::vmm::Error> for Errno {
    fn from(err: crate::memory::vmm::Error) -> Self {
        match err {
            crate::memory::vmm::Error::Overlap | crate::memory::vmm::Error::NoSuchRegion => {
                Errno::EINVAL
            }
            crate::memory::vmm::Error::OutOfMemory => Errno::ENOMEM,
            crate::memory::vmm::Error::PermissionDenied => Errno::EPERM,
        }
    }
}

impl From<crate::collections::handle_allocator::Error> for Errno {
    fn from(err: crate::collections::handle_allocator::Error) -> Self {
        match err {
            crate::collections::handle_allocator::Error::OutOfBounds
            | crate::collections::handle_allocator::Error::NotAllocated => Errno::EINVAL,
        }
    }
}

impl From<crate::memory::pmm::Error> for Errno {
    fn from(err: crate::memory::pmm::Error) -> Self {
        match err {
            crate::memory::pmm::Error::InvalidAttrs => Errno::EINVAL,
            crate::memory::pmm::Error::Contended => Errno::EAGAIN,
        }
    }
}

impl From<crate::process::task::Error> for Errno {
    fn from(err: crate::process::task::Error) -> Self {
        match err {
            crate::process::task::Error::NoFreePid => Errno::ENOSPC,
            crate::process::task::Error::TooManyThreads => Errno::EAGAIN,
            crate::process::task::Error::TooManyOpenFiles => Errno::EBADFD,
            crate::process::task::Error::BadFd => Errno::EBADFD,
            crate::process::task::Error::NoSuchTask => Errno::ESRCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_error_mapping() {
        assert_eq!(Errno::from(crate::memory::Error::OutOfMemory), Errno::ENOMEM);
        assert_eq!(Errno::from(crate::memory::Error::InvalidSize), Errno::EINVAL);
    }
}
