//! The Von heap: an object arena with string interning and a mark-sweep
//! garbage collector.
//!
//! All heap objects live in one arena owned by the VM and are named by
//! [ObjRef] handles. Entries never move, so handles stay valid until the
//! object is swept. The live objects are additionally threaded on an
//! intrusive chain of handles (`head` → `Slot::next`) which is what the
//! sweep phase walks; swept slots go on a free list and are reused by later
//! allocations.
//!
//! Collection is two-phase: mark from the [Roots] through a gray worklist,
//! then sweep the chain. The intern table is weak — between the phases, any
//! interned string that was not marked is dropped from the table so the
//! sweep can free it.
//!
//! Allocation itself never collects. The VM asks [Heap::should_collect] at
//! its allocation points and passes its roots explicitly; the compiler
//! allocates freely, because everything it creates is reachable from the
//! function it ultimately returns.

use tracing::debug;

use crate::object::{Class, Function, Obj, ObjRef, Str, Upvalue};
use crate::table::Table;
use crate::value::Value;

/// After a collection, allow the heap to double before collecting again.
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Bytes of allocation before the very first collection.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// An arena entry: the object plus its link in the live-object chain.
#[derive(Debug)]
struct Slot {
    obj: Obj,
    next: Option<ObjRef>,
}

/// The set of handles the collector must keep alive, borrowed from the VM at
/// the moment of collection.
pub struct Roots<'a> {
    /// Every value on the operand stack.
    pub stack: &'a [Value],
    /// The closure of every active call frame.
    pub closures: &'a [ObjRef],
    /// Every open upvalue.
    pub open_upvalues: &'a [ObjRef],
    /// The globals table.
    pub globals: &'a Table,
    /// Handles the VM itself holds on to (e.g. the interned `"init"`).
    pub extra: &'a [ObjRef],
}

/// The object heap. Owned by the VM; threaded into the compiler so literals
/// and function objects land in the same arena the VM traces.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    /// Mark bits, parallel to `slots`. Only set during a collection.
    marks: Vec<bool>,
    /// Indices of swept slots, ready for reuse.
    free: Vec<u32>,
    /// Head of the intrusive live-object chain.
    head: Option<ObjRef>,
    /// The intern set: every live string, keyed by itself.
    strings: Table,
    /// Gray worklist for the mark phase.
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            next_gc: FIRST_GC_THRESHOLD,
            ..Heap::default()
        }
    }

    ///////////////////////////////////////// Allocation /////////////////////////////////////////

    /// Intern a string, returning the handle of the canonical copy.
    ///
    /// If an equal string is already on the heap, no allocation happens and
    /// its handle is returned; content equality between interned strings is
    /// therefore handle equality.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = fnv1a(chars.as_bytes());

        let slots = &self.slots;
        if let Some(existing) = self
            .strings
            .find_string(hash, |key| str_of(slots, key) == chars)
        {
            return existing;
        }

        let reference = self.alloc(Obj::Str(Str {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(reference, hash, Value::Nil);
        reference
    }

    pub fn alloc_obj(&mut self, obj: Obj) -> ObjRef {
        self.alloc(obj)
    }

    /// Whether enough has been allocated that the owner should arrange a
    /// collection. The caller supplies roots via [Heap::collect].
    #[inline]
    pub fn should_collect(&self) -> bool {
        if cfg!(feature = "stress_gc") {
            return true;
        }
        self.bytes_allocated > self.next_gc
    }

    //////////////////////////////////////// Dereferencing ////////////////////////////////////////

    /// Dereference a handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle's object has been swept. The VM's rooting
    /// discipline guarantees this cannot happen for reachable objects.
    #[inline]
    pub fn get(&self, reference: ObjRef) -> &Obj {
        &self.slot(reference).obj
    }

    #[inline]
    pub fn get_mut(&mut self, reference: ObjRef) -> &mut Obj {
        &mut self.slots[reference.index()]
            .as_mut()
            .expect("dereferenced a swept object")
            .obj
    }

    /// The text of an interned string.
    ///
    /// # Panics
    ///
    /// Panics when the handle is not a string.
    #[inline]
    pub fn as_str(&self, reference: ObjRef) -> &str {
        match self.get(reference) {
            Obj::Str(s) => &s.chars,
            other => panic!("expected a string object, found {other:?}"),
        }
    }

    /// The precomputed hash of an interned string.
    #[inline]
    pub fn str_hash(&self, reference: ObjRef) -> u32 {
        match self.get(reference) {
            Obj::Str(s) => s.hash,
            other => panic!("expected a string object, found {other:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics when the handle is not a function.
    #[inline]
    pub fn function(&self, reference: ObjRef) -> &Function {
        match self.get(reference) {
            Obj::Function(f) => f,
            other => panic!("expected a function object, found {other:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics when the handle is not a class.
    #[inline]
    pub fn class(&self, reference: ObjRef) -> &Class {
        match self.get(reference) {
            Obj::Class(c) => c,
            other => panic!("expected a class object, found {other:?}"),
        }
    }

    /// Render a value for `print` and error messages.
    pub fn show_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(reference) => self.show_object(reference),
        }
    }

    fn show_object(&self, reference: ObjRef) -> String {
        match self.get(reference) {
            Obj::Str(s) => s.chars.to_string(),
            Obj::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.as_str(name)),
                None => "<script>".to_string(),
            },
            Obj::Closure(c) => self.show_object(c.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.as_str(c.name).to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.as_str(self.class(i.class).name))
            }
            Obj::BoundMethod(b) => self.show_object(b.method),
        }
    }

    /// How many objects are currently live (on the sweep chain).
    pub fn live_objects(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(reference) = cursor {
            count += 1;
            cursor = self.slot(reference).next;
        }
        count
    }

    ////////////////////////////////////////// Collection //////////////////////////////////////////

    /// Run a full mark-sweep collection with the given roots.
    pub fn collect(&mut self, roots: &Roots) {
        let before = self.bytes_allocated;

        for &value in roots.stack {
            self.mark_value(value);
        }
        for &closure in roots.closures {
            self.mark_object(closure);
        }
        for &upvalue in roots.open_upvalues {
            self.mark_object(upvalue);
        }
        for (key, value) in roots.globals.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
        for &reference in roots.extra {
            self.mark_object(reference);
        }

        self.trace_references();
        self.remove_white_strings();
        let freed = self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        debug!(
            bytes_before = before,
            bytes_after = self.bytes_allocated,
            freed,
            next_gc = self.next_gc,
            "collected garbage"
        );
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(reference) = value {
            self.mark_object(reference);
        }
    }

    fn mark_object(&mut self, reference: ObjRef) {
        Self::mark(&mut self.marks, &mut self.gray, reference);
    }

    /// Set the mark bit and queue the object for child tracing. Split out as
    /// an associated function so [Heap::blacken] can call it while borrowing
    /// an object from `slots`.
    fn mark(marks: &mut [bool], gray: &mut Vec<ObjRef>, reference: ObjRef) {
        let index = reference.index();
        if !marks[index] {
            marks[index] = true;
            gray.push(reference);
        }
    }

    /// Drain the gray worklist, marking each object's children.
    fn trace_references(&mut self) {
        while let Some(reference) = self.gray.pop() {
            self.blacken(reference);
        }
    }

    fn blacken(&mut self, reference: ObjRef) {
        let Heap {
            slots,
            marks,
            gray,
            ..
        } = self;
        let obj = &slots[reference.index()]
            .as_ref()
            .expect("gray object must be live")
            .obj;

        let mark_value = |marks: &mut Vec<bool>, gray: &mut Vec<ObjRef>, value: Value| {
            if let Value::Obj(child) = value {
                Self::mark(marks, gray, child);
            }
        };

        match obj {
            Obj::Str(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    Self::mark(marks, gray, name);
                }
                for &constant in f.chunk.constants() {
                    mark_value(marks, gray, constant);
                }
            }
            Obj::Closure(c) => {
                Self::mark(marks, gray, c.function);
                for &upvalue in &c.upvalues {
                    Self::mark(marks, gray, upvalue);
                }
            }
            Obj::Upvalue(u) => {
                if let Upvalue::Closed(value) = u {
                    mark_value(marks, gray, *value);
                }
            }
            Obj::Class(c) => {
                Self::mark(marks, gray, c.name);
                for (key, value) in c.methods.iter() {
                    Self::mark(marks, gray, key);
                    mark_value(marks, gray, value);
                }
            }
            Obj::Instance(i) => {
                Self::mark(marks, gray, i.class);
                for (key, value) in i.fields.iter() {
                    Self::mark(marks, gray, key);
                    mark_value(marks, gray, value);
                }
            }
            Obj::BoundMethod(b) => {
                mark_value(marks, gray, b.receiver);
                Self::mark(marks, gray, b.method);
            }
        }
    }

    /// The intern table holds strings weakly: forget any that the mark phase
    /// did not reach, so the sweep can free them.
    fn remove_white_strings(&mut self) {
        let marks = &self.marks;
        self.strings.retain(|key| marks[key.index()]);
    }

    /// Walk the live chain, unlinking and freeing every unmarked object and
    /// clearing the mark on every survivor. Returns the number freed.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut previous: Option<ObjRef> = None;
        let mut cursor = self.head;

        while let Some(reference) = cursor {
            let index = reference.index();
            let next = self.slot(reference).next;

            if self.marks[index] {
                self.marks[index] = false;
                previous = Some(reference);
            } else {
                let slot = self.slots[index].take().expect("chained object must be live");
                // Class and instance tables grow after allocation, so the
                // release can be larger than what was charged; saturate.
                self.bytes_allocated = self.bytes_allocated.saturating_sub(slot.obj.heap_size());
                self.free.push(reference.0);
                freed += 1;

                match previous {
                    Some(p) => {
                        self.slots[p.index()]
                            .as_mut()
                            .expect("chained object must be live")
                            .next = next;
                    }
                    None => self.head = next,
                }
            }

            cursor = next;
        }

        freed
    }

    ////////////////////////////////////////// Internals //////////////////////////////////////////

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.heap_size();

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(Slot {
                    obj,
                    next: self.head,
                });
                index
            }
            None => {
                self.slots.push(Some(Slot {
                    obj,
                    next: self.head,
                }));
                self.marks.push(false);
                (self.slots.len() - 1) as u32
            }
        };

        let reference = ObjRef(index);
        self.head = Some(reference);
        reference
    }

    #[inline]
    fn slot(&self, reference: ObjRef) -> &Slot {
        self.slots[reference.index()]
            .as_ref()
            .expect("dereferenced a swept object")
    }
}

/// 32-bit FNV-1a, matching the hash stored on every interned string.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

fn str_of<'a>(slots: &'a [Option<Slot>], reference: ObjRef) -> &'a str {
    match &slots[reference.index()].as_ref().expect("interned string must be live").obj {
        Obj::Str(s) => &s.chars,
        other => panic!("intern table key must be a string, found {other:?}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object::{Instance, Obj};

    fn empty_roots(globals: &Table) -> Roots {
        Roots {
            stack: &[],
            closures: &[],
            open_upvalues: &[],
            globals,
            extra: &[],
        }
    }

    #[test]
    fn interning_deduplicates() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(2, heap.live_objects());
        assert_eq!("hello", heap.as_str(a));
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        heap.intern("doomed");
        let survivor = heap.intern("kept");
        assert_eq!(2, heap.live_objects());

        let globals = Table::new();
        let stack = [Value::Obj(survivor)];
        heap.collect(&Roots {
            stack: &stack,
            ..empty_roots(&globals)
        });

        assert_eq!(1, heap.live_objects());
        assert_eq!("kept", heap.as_str(survivor));
    }

    #[test]
    fn swept_strings_leave_the_intern_table() {
        let mut heap = Heap::new();
        let doomed = heap.intern("transient");
        let globals = Table::new();
        heap.collect(&empty_roots(&globals));

        // Interning the text again must produce a fresh object, not the
        // stale handle.
        let fresh = heap.intern("transient");
        assert_eq!(1, heap.live_objects());
        assert_eq!("transient", heap.as_str(fresh));
        // The old slot may be reused, but nothing dangles: the fresh handle
        // dereferences to a live string.
        let _ = doomed; // swept; must not be dereferenced
    }

    #[test]
    fn marking_traces_object_graphs() {
        let mut heap = Heap::new();
        let class_name = heap.intern("Point");
        let class = heap.alloc_obj(Obj::Class(Class {
            name: class_name,
            methods: Table::new(),
        }));
        let field_name = heap.intern("x");
        let field_hash = heap.str_hash(field_name);
        let mut fields = Table::new();
        fields.set(field_name, field_hash, Value::Number(7.0));
        let instance = heap.alloc_obj(Obj::Instance(Instance { class, fields }));

        // Root only the instance: the class, both strings, and the field
        // value must all survive through tracing.
        let globals = Table::new();
        let stack = [Value::Obj(instance)];
        heap.collect(&Roots {
            stack: &stack,
            ..empty_roots(&globals)
        });

        assert_eq!(4, heap.live_objects());
        assert_eq!("Point", heap.as_str(heap.class(class).name));
    }

    #[test]
    fn slots_are_reused_after_sweep() {
        let mut heap = Heap::new();
        for n in 0..32 {
            heap.intern(&format!("garbage {n}"));
        }
        let globals = Table::new();
        heap.collect(&empty_roots(&globals));
        assert_eq!(0, heap.live_objects());

        let reference = heap.intern("phoenix");
        assert_eq!(1, heap.live_objects());
        assert_eq!("phoenix", heap.as_str(reference));
    }

    #[test]
    fn collection_is_idempotent_on_live_data() {
        let mut heap = Heap::new();
        let s = heap.intern("stable");
        let globals = Table::new();
        let stack = [Value::Obj(s)];
        for _ in 0..3 {
            heap.collect(&Roots {
                stack: &stack,
                ..empty_roots(&globals)
            });
            assert_eq!("stable", heap.as_str(s));
            assert_eq!(1, heap.live_objects());
        }
    }
}
