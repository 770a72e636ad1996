//! bytelox: a bytecode compiler and virtual machine for Lox.
//!
//! Source code goes through the [scanner], is compiled in a single pass by the [compiler] into a
//! [chunk::Chunk], which is then executed by the [vm::VM].

#[macro_use]
pub mod with_try_from_u8;

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod error;
pub mod object;
pub mod scanner;
pub mod value;
pub mod vm;

pub use error::InterpretationError;

/// Result type for anything that compiles or runs Lox code.
pub type Result<T> = std::result::Result<T, InterpretationError>;

/// Re-exports common items.
pub mod prelude {
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::error::InterpretationError;
    pub use crate::object::Heap;
    pub use crate::value::Value;
    pub use crate::vm::VM;
}
