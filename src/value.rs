//! Representation of runtime values.

use std::fmt;

use crate::object::{Heap, ObjRef};

extern crate static_assertions as sa;

/// A runtime value.
///
/// Numbers ([f64]), booleans, and nil are stored inline. Strings live on the [Heap]; a value only
/// holds an [ObjRef] handle to them.
///
/// You can create a value from its equivalent Rust type:
///
/// ```
/// # use bytelox::object::Heap;
/// # use bytelox::value::Value;
/// let heap = Heap::new();
///
/// let float: f64 = 0.5;
/// let v: Value = float.into();
/// assert_eq!("0.5", v.display(&heap).to_string());
///
/// let switch = false;
/// let v: Value = switch.into();
/// assert_eq!("false", v.display(&heap).to_string());
/// ```
///
/// This even works with `Option<T>`: `None` turns into [Value::Nil].
///
/// ```
/// # use bytelox::object::Heap;
/// # use bytelox::value::Value;
/// # let heap = Heap::new();
/// let option = Some(0.25);
/// let v: Value = option.into();
/// assert_eq!("0.25", v.display(&heap).to_string());
///
/// let option: Option<f64> = None;
/// let v: Value = option.into();
/// assert_eq!("nil", v.display(&heap).to_string());
/// ```
///
/// # Strings
///
/// String data is owned by a [Heap]. Printing a string value requires that same heap:
///
/// ```
/// # use bytelox::object::Heap;
/// # use bytelox::value::Value;
/// let mut heap = Heap::new();
/// let v: Value = heap.intern_constant("Hello").into();
/// assert!(v.is_obj());
/// assert!(!v.is_falsy());
/// assert_eq!("Hello", v.display(&heap).to_string());
/// ```
#[derive(Debug, Default, Copy, Clone)]
pub enum Value {
    /// Nil. Doing anything with this is usually an error.
    #[default]
    Nil,
    /// A boolean.
    Boolean(bool),
    /// All numbers are 64-bit floating point.
    Number(f64),
    /// A reference to an object on the [Heap].
    Object(ObjRef),
}

sa::assert_eq_size!(Value, [u64; 2]);

/// A collection of values. Used as the constant pool.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct ValueArray {
    values: Vec<Value>,
}

/// Renders a [Value], resolving heap objects. Returned by [Value::display].
pub struct ValueDisplay<'a> {
    value: Value,
    heap: &'a Heap,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Value {
    /// Returns true if this value is a boolean.
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Boolean(_))
    }

    /// Returns true if this value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns true if this value refers to a heap object.
    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Returns true if this value is a number.
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    /// Returns true if this value is "falsy": only nil and false are.
    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Returns the number, if this value is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(num) => Some(*num),
            _ => None,
        }
    }

    /// Returns the object handle, if this value refers to one.
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Object(object) => Some(*object),
            _ => None,
        }
    }

    /// Applies the language's rules for equality, returning a Rust bool.
    ///
    /// Numbers follow IEEE 754 (so `NaN` is not equal to itself). Strings are interned, so
    /// comparing their handles is enough. Values of different types are never equal.
    #[inline]
    pub fn equal(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Number(a), Number(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Nil, Nil) => true,
            (Object(a), Object(b)) => a == b,
            _ => false,
        }
    }

    /// Returns something that can be printed, looking up strings in the given heap.
    pub fn display(self, heap: &Heap) -> ValueDisplay<'_> {
        ValueDisplay { value: self, heap }
    }
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.value {
            Value::Nil => write!(f, "nil"),
            Value::Number(num) => write!(f, "{num}"),
            Value::Boolean(value) => write!(f, "{value}"),
            Value::Object(object) => match self.heap.get(object) {
                Some(object) => write!(f, "{object}"),
                None => write!(f, "<dangling {object:?}>"),
            },
        }
    }
}

/// Structural equality, for Rust code (tests, mostly). Unlike [Value::equal], NaNs are equal.
impl PartialEq for Value {
    fn eq(&self, rhs: &Value) -> bool {
        use Value::*;
        match (self, rhs) {
            (Number(a), Number(b)) => compare_with_nans_eq(*a, *b),
            _ => self.equal(rhs),
        }
    }
}

/// Compares floats, but, unlike IEEE 754, NaNs are considered equal.
fn compare_with_nans_eq(a: f64, b: f64) -> bool {
    match (a.is_nan(), b.is_nan()) {
        (false, false) => a == b,
        (true, true) => true,
        _ => false,
    }
}

// Convert any Rust float into a value.
impl From<f64> for Value {
    #[inline(always)]
    fn from(float: f64) -> Value {
        Value::Number(float)
    }
}

// Convert any Rust bool into a value.
impl From<bool> for Value {
    #[inline(always)]
    fn from(value: bool) -> Value {
        Value::Boolean(value)
    }
}

impl From<ObjRef> for Value {
    #[inline(always)]
    fn from(object: ObjRef) -> Value {
        Value::Object(object)
    }
}

// Convert any Rust option to a value.
impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    #[inline]
    fn from(option: Option<T>) -> Value {
        option.map(Into::into).unwrap_or(Value::Nil)
    }
}

impl ValueArray {
    /// Return an empty [ValueArray].
    pub fn new() -> Self {
        ValueArray::default()
    }

    /// Returns a [Value] at the given index. If the index is out of bounds, this returns `None`.
    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.values.get(index).copied()
    }

    /// Add a new [Value] to the array, returning its index.
    pub fn write(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    /// Returns how many values are in the pool.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(Value::Nil.is_falsy());
        assert!(Value::from(false).is_falsy());
        assert!(!Value::from(true).is_falsy());
        assert!(!Value::from(0.0).is_falsy());

        let mut heap = Heap::new();
        let empty: Value = heap.intern_constant("").into();
        assert!(!empty.is_falsy());
    }

    #[test]
    fn equality_rules() {
        let nan: Value = f64::NAN.into();
        assert!(!nan.equal(&nan));
        // ...but Rust-side equality is reflexive.
        assert_eq!(nan, nan);

        assert!(Value::Nil.equal(&Value::Nil));
        assert!(!Value::Nil.equal(&false.into()));
        assert!(!Value::from(0.0).equal(&false.into()));
        assert!(Value::from(1.5).equal(&1.5.into()));
        assert!(Value::from(-0.0).equal(&0.0.into()));

        let mut heap = Heap::new();
        let a: Value = heap.intern_constant("same").into();
        let b: Value = heap.take_string("sa".to_owned() + "me").into();
        let c: Value = heap.intern_constant("different").into();
        assert!(a.equal(&b));
        assert!(!a.equal(&c));
    }

    #[test]
    fn numbers_print_without_trailing_zeros() {
        let heap = Heap::new();
        assert_eq!("7", Value::from(7.0).display(&heap).to_string());
        assert_eq!("-2.5", Value::from(-2.5).display(&heap).to_string());
    }

    #[test]
    fn value_array_returns_indices() {
        let mut array = ValueArray::new();
        assert!(array.is_empty());
        assert_eq!(0, array.write(1.0.into()));
        assert_eq!(1, array.write(true.into()));
        assert_eq!(Some(Value::Boolean(true)), array.get(1));
        assert_eq!(None, array.get(2));
        assert_eq!(2, array.iter().count());
    }
}
