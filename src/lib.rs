//! A bytecode compiler and virtual machine for the Von programming language.
//!
//! Von source code is compiled in a single pass — the Pratt parser in
//! [compiler] emits bytecode as it reads tokens from [scanner] — and the
//! resulting [chunk::Chunk]s execute on the stack machine in [vm], over a
//! garbage-collected [heap].
//!
//! ```
//! use von::vm::Vm;
//!
//! let mut vm = Vm::with_output(Vec::new());
//! vm.interpret("print 1 + 2 * 3;").unwrap();
//! assert_eq!(b"7\n".to_vec(), vm.into_output());
//! ```

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod error;
pub mod heap;
pub mod object;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

mod with_try_from_u8;

/// The type returned by various functions that parse, compile, and run Von code.
/// This is the standard [std::result::Result], but the error is always
/// [error::InterpretationError]. This type alias is generic for the return type, however.
///
/// ```
/// fn compile() -> von::Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, error::InterpretationError>;

/// Re-exports common items.
///
/// The scanner, compiler, and VM form one pipeline with shared data
/// contracts (tokens, opcodes, values), so the names that cross module
/// boundaries are collected here:
pub mod prelude {
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::error::InterpretationError;
    pub use crate::scanner::{Lexeme, Scanner, Token};
    pub use crate::value::Value;
    pub use crate::vm::Vm;
}
