use crate::vmm::BackingError;
use kernel_vmem::WalkError;

/// Failure of a virtual memory operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("range overlaps an existing mapping")]
    Collision,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("address is not mapped")]
    NotMapped,
    #[error("page is not a copy-on-write mapping")]
    NotCopyOnWrite,
    #[error("page is not demand paged")]
    NotDemandPaged,
    #[error("permission denied")]
    PermissionDenied,
    #[error("backing store failed: {0}")]
    Backing(#[from] BackingError),
}

impl From<WalkError> for VmError {
    fn from(value: WalkError) -> Self {
        match value {
            WalkError::OutOfMemory => Self::OutOfMemory,
            WalkError::KernelHalf(_) => Self::InvalidArgument,
        }
    }
}
