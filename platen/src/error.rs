use std::fmt;

use crate::MemoryError;

/// Error kinds surfaced by the core to the operator layer. Each maps onto a
/// language-level error name via its `Display` rendering.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The arena cannot grow to satisfy an allocation.
    OutOfMemory,
    /// A byte access fell outside an entry's recorded bounds.
    AddressRange,
    /// An index or pop exceeded the current stack depth.
    StackUnderflow,
    /// A caller-supplied count or index is structurally invalid.
    RangeCheck,
    /// An operand's tag does not match the operator's declared pattern.
    TypeCheck,
    /// No operator is registered under the requested name.
    Undefined,
    /// The named context does not exist, or was already joined or detached.
    InvalidContext,
    /// A lock operation was attempted by a context that does not hold it.
    LockNotHeld,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmError::OutOfMemory => "VMerror",
            VmError::AddressRange => "rangecheck",
            VmError::StackUnderflow => "stackunderflow",
            VmError::RangeCheck => "rangecheck",
            VmError::TypeCheck => "typecheck",
            VmError::Undefined => "undefined",
            VmError::InvalidContext => "invalidcontext",
            VmError::LockNotHeld => "invalidaccess",
        };
        f.write_str(name)
    }
}

impl From<MemoryError> for VmError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory => VmError::OutOfMemory,
            MemoryError::AddressRange => VmError::AddressRange,
            MemoryError::BadHandle => VmError::AddressRange,
        }
    }
}
