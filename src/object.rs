//! Heap-allocated objects and the string intern table.
//!
//! All objects live in a [Heap], which owns them for the lifetime of a VM. Everything else
//! (values on the stack, constants in a chunk, keys in the globals table) refers to an object
//! through a copyable [ObjRef] handle. Nothing is freed individually: the whole heap is reclaimed
//! in one sweep by [Heap::free_objects] (or simply by dropping it).

use std::collections::HashMap;
use std::fmt;

extern crate static_assertions as sa;

/// A handle to an object owned by a [Heap].
///
/// Handles are only meaningful for the heap that created them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

sa::assert_eq_size!(ObjRef, u32);

/// Any object that lives on the heap. Currently, only strings.
#[derive(Debug)]
pub enum HeapObject {
    String(LoxString),
}

/// An immutable, interned string.
#[derive(Debug)]
pub struct LoxString {
    chars: Box<str>,
    hash: u32,
    /// Constants come from the source code (literals and identifiers); everything else was built
    /// while the program was running.
    is_constant: bool,
}

/// The registry of every heap object, plus the intern table for strings.
///
/// ```
/// # use bytelox::object::Heap;
/// let mut heap = Heap::new();
/// let a = heap.intern_constant("hello");
/// let b = heap.take_string(String::from("hello"));
/// let c = heap.intern_constant("world");
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// assert_eq!(2, heap.len());
/// ```
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    /// Interned strings, bucketed by their FNV-1a hash.
    strings: HashMap<u32, Vec<ObjRef>>,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Heap {
    /// Returns an empty heap.
    pub fn new() -> Self {
        Heap::default()
    }

    /// Interns a string that appears in source code (a literal or an identifier).
    ///
    /// The content is copied only if it hasn't been interned before.
    pub fn intern_constant(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(interned) = self.find_string(chars, hash) {
            return interned;
        }

        self.allocate_string(chars.into(), hash, true)
    }

    /// Interns a string constructed at runtime, taking ownership of it.
    ///
    /// If equal content is already interned, `owned` is dropped and the existing object is
    /// returned.
    pub fn take_string(&mut self, owned: String) -> ObjRef {
        let hash = hash_string(&owned);
        if let Some(interned) = self.find_string(&owned, hash) {
            return interned;
        }

        self.allocate_string(owned.into_boxed_str(), hash, false)
    }

    /// Finds the interned string with the given contents, without interning anything.
    pub fn lookup(&self, chars: &str) -> Option<ObjRef> {
        self.find_string(chars, hash_string(chars))
    }

    /// Returns the object behind the handle.
    pub fn get(&self, object: ObjRef) -> Option<&HeapObject> {
        self.objects.get(object.index())
    }

    /// Returns the contents of a string object.
    pub fn as_str(&self, object: ObjRef) -> Option<&str> {
        match self.get(object)? {
            HeapObject::String(string) => Some(string.as_str()),
        }
    }

    /// Returns how many objects are currently allocated.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no objects are allocated.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterates over every object in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &HeapObject)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(index, object)| (ObjRef::from_index(index), object))
    }

    /// Reclaims every object in one sweep. Returns how many objects were freed.
    ///
    /// Every [ObjRef] handed out before this call is invalidated.
    pub fn free_objects(&mut self) -> usize {
        let constants = self
            .iter()
            .filter(|(_, object)| object.is_constant())
            .count();
        let freed = self.objects.len();

        self.strings.clear();
        self.objects.clear();

        log::debug!("freed {freed} heap objects ({constants} constant strings)");
        freed
    }

    /// Looks up an already interned string.
    fn find_string(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        self.strings
            .get(&hash)?
            .iter()
            .copied()
            .find(|&candidate| self.as_str(candidate) == Some(chars))
    }

    /// Registers a brand new string in both the object registry and the intern table.
    fn allocate_string(&mut self, chars: Box<str>, hash: u32, is_constant: bool) -> ObjRef {
        let object = ObjRef::from_index(self.objects.len());
        self.objects.push(HeapObject::String(LoxString {
            chars,
            hash,
            is_constant,
        }));
        self.strings.entry(hash).or_default().push(object);

        object
    }
}

impl ObjRef {
    #[inline(always)]
    fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> Self {
        ObjRef(u32::try_from(index).expect("heap exceeded the number of addressable objects"))
    }
}

impl HeapObject {
    /// Returns true if this object was created from the source code.
    pub fn is_constant(&self) -> bool {
        match self {
            HeapObject::String(string) => string.is_constant,
        }
    }
}

impl LoxString {
    /// Returns the contents of the string.
    pub fn as_str(&self) -> &str {
        &self.chars
    }

    /// Returns the length in bytes.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// Returns true for the empty string.
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Returns the cached FNV-1a hash of the contents.
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl fmt::Display for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeapObject::String(string) => write!(f, "{}", string.as_str()),
        }
    }
}

/// 32-bit FNV-1a.
///
/// See: <http://www.isthe.com/chongo/tech/comp/fnv/>
pub fn hash_string(chars: &str) -> u32 {
    chars.bytes().fold(2166136261u32, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(16777619)
    })
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fnv1a_known_values() {
        assert_eq!(0x811c9dc5, hash_string(""));
        assert_eq!(0xe40c292c, hash_string("a"));
        assert_eq!(0xbf9cf968, hash_string("foobar"));
    }

    #[test]
    fn interning_deduplicates_by_content() {
        let mut heap = Heap::new();
        let first = heap.intern_constant("🦀");
        let second = heap.intern_constant("🦀");
        let other = heap.intern_constant("🍕");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(2, heap.len());
        assert_eq!(Some("🦀"), heap.as_str(first));
    }

    #[test]
    fn runtime_strings_reuse_constants() {
        let mut heap = Heap::new();
        let constant = heap.intern_constant("ab");
        let built = heap.take_string(format!("{}{}", "a", "b"));
        assert_eq!(constant, built);

        let fresh = heap.take_string("abc".to_owned());
        assert_eq!(2, heap.len());
        assert!(!heap.get(fresh).unwrap().is_constant());
        assert!(heap.get(constant).unwrap().is_constant());
    }

    #[test]
    fn strings_remember_their_hash() {
        let mut heap = Heap::new();
        let s = heap.intern_constant("foobar");
        let HeapObject::String(string) = heap.get(s).unwrap();
        assert_eq!(hash_string("foobar"), string.hash());
        assert_eq!(6, string.len());
    }

    #[test]
    fn free_objects_reclaims_everything() {
        let mut heap = Heap::new();
        heap.intern_constant("one");
        heap.take_string("two".to_owned());
        assert_eq!(2, heap.free_objects());
        assert!(heap.is_empty());

        // The intern table is empty too, so this is a fresh allocation.
        let again = heap.intern_constant("one");
        assert_eq!(1, heap.len());
        assert_eq!(Some("one"), heap.as_str(again));
    }

    #[test]
    fn stale_handles_resolve_to_nothing() {
        let mut heap = Heap::new();
        let s = heap.intern_constant("gone");
        heap.free_objects();
        assert!(heap.get(s).is_none());
    }
}
