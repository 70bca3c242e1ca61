//! Logical addresses.
//!
//! An [`Address`] names a byte in the store; its integer value is the
//! absolute byte offset from the start of the file.  [`TypedAddress`] adds a
//! compile-time tag recording the type the addressed bytes represent.  The
//! tag exists purely for readability at call sites and has no effect on
//! layout: a typed address is exactly eight bytes on disk.

use std::{fmt, marker::PhantomData};

/// A 64-bit logical address into the store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    /// The null address.  Nothing user-addressable ever lives at offset zero
    /// (the file header does), so zero doubles as the "no address" sentinel
    /// in trailer links and index-root slots.
    pub const NULL: Address = Address(0);

    pub const fn new(absolute: u64) -> Self {
        Address(absolute)
    }

    /// The absolute byte offset this address names.
    pub const fn absolute(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An [`Address`] tagged with the type of the value it points at.
pub struct TypedAddress<T> {
    addr: Address,
    _type: PhantomData<T>,
}

impl<T> TypedAddress<T> {
    pub const NULL: TypedAddress<T> = TypedAddress {
        addr: Address::NULL,
        _type: PhantomData,
    };

    pub const fn new(addr: Address) -> Self {
        TypedAddress {
            addr,
            _type: PhantomData,
        }
    }

    pub const fn make(absolute: u64) -> Self {
        Self::new(Address::new(absolute))
    }

    pub const fn to_address(self) -> Address {
        self.addr
    }

    pub const fn absolute(self) -> u64 {
        self.addr.absolute()
    }

    pub const fn is_null(self) -> bool {
        self.addr.is_null()
    }
}

// Derived impls would put a `T: Copy` bound on these; the tag is phantom, so
// implement them by hand.
impl<T> Clone for TypedAddress<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedAddress<T> {}

impl<T> PartialEq for TypedAddress<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> Eq for TypedAddress<T> {}

impl<T> fmt::Debug for TypedAddress<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedAddress({:#x})", self.addr.absolute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero() {
        assert_eq!(Address::NULL.absolute(), 0);
        assert!(Address::NULL.is_null());
        assert!(!Address::new(1).is_null());
    }

    #[test]
    fn typed_address_compares_by_offset() {
        struct Marker;
        let a = TypedAddress::<Marker>::make(128);
        let b = TypedAddress::<Marker>::make(128);
        assert_eq!(a, b);
        assert_eq!(a.to_address(), Address::new(128));
    }
}
