mod context;
mod error;
mod free;
mod memory;
mod object;
mod ops;
mod scheduler;
mod stack;
mod vm;

pub use context::*;
pub use error::*;
pub use memory::*;
pub use object::*;
pub use ops::*;
pub use scheduler::*;
pub use stack::*;
pub use vm::*;
