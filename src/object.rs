//! The heap-allocated object variants of Von.
//!
//! Values on the stack are plain [Value]s; everything bigger lives in the
//! [crate::heap::Heap] arena and is referred to by [ObjRef] handle. The arena
//! plus handles stand in for the raw object pointers a C interpreter would
//! use: handles stay valid across collections because the arena never moves
//! entries, and the garbage collector works purely in terms of handles.

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A handle to an object in the [crate::heap::Heap].
///
/// Handles are plain indices; dereferencing one requires the heap. Two
/// handles are equal iff they name the same heap object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One heap object. Every variant is reachable from the VM roots or dies at
/// the next sweep.
#[derive(Debug)]
pub enum Obj {
    Str(Str),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// An immutable, interned string with its FNV-1a hash precomputed at
/// allocation. Interning guarantees at most one `Str` per distinct content.
#[derive(Debug)]
pub struct Str {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: its code, how many arguments it takes, and how many
/// upvalues its closures will carry.
///
/// The chunk is behind an [Rc] so call frames can hold it without borrowing
/// the heap for the whole dispatch loop; it is frozen once compilation of the
/// function body ends.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
    /// Interned name, or `None` for the top-level script.
    pub name: Option<ObjRef>,
}

/// A function paired with its captured upvalues. All runtime calls go
/// through closures, even for functions that capture nothing.
#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable cell.
///
/// While the variable is still live on the operand stack the upvalue is
/// `Open` and records the stack slot; when the variable leaves the stack the
/// VM copies it into the cell, making it `Closed`.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

impl Upvalue {
    /// The stack slot this upvalue points at, if it is still open.
    #[inline]
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }
}

/// A class: a name and a method table mapping interned method names to
/// closures.
#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    pub methods: Table,
}

/// An instance of a class, with its own field table.
#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method that has been pulled off an instance: the receiver is packaged
/// with the closure so the pair can be called later.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

impl Obj {
    /// A coarse byte count for the garbage collector's allocation pressure
    /// heuristic. Exactness doesn't matter; monotonicity with payload size
    /// does.
    pub fn heap_size(&self) -> usize {
        let payload = match self {
            Obj::Str(s) => s.chars.len(),
            Obj::Function(f) => f.chunk.byte_size(),
            Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            Obj::Upvalue(_) => 0,
            Obj::Class(c) => c.methods.byte_size(),
            Obj::Instance(i) => i.fields.byte_size(),
            Obj::BoundMethod(_) => 0,
        };
        std::mem::size_of::<Obj>() + payload
    }
}
