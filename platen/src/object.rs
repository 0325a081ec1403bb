use std::fmt;

use bitflags::bitflags;

use crate::{Blob, Handle};

/// Primary type tag of an [`Object`], decoded from the raw kind byte with
/// `Invalid` as the fallback for unknown encodings.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tag {
    Invalid = 0,
    Integer,
    Real,
    Boolean,
    Mark,
    Name,
    Operator,
    Array,
    Dictionary,
    String,
    File,
    Save,
    Stack,
    Context,
    Lock,
    Condition,
}

impl Tag {
    #[must_use]
    pub fn from_raw(raw: u8) -> Tag {
        match raw {
            1 => Tag::Integer,
            2 => Tag::Real,
            3 => Tag::Boolean,
            4 => Tag::Mark,
            5 => Tag::Name,
            6 => Tag::Operator,
            7 => Tag::Array,
            8 => Tag::Dictionary,
            9 => Tag::String,
            10 => Tag::File,
            11 => Tag::Save,
            12 => Tag::Stack,
            13 => Tag::Context,
            14 => Tag::Lock,
            15 => Tag::Condition,
            _ => Tag::Invalid,
        }
    }

    /// Composite tags carry a handle to backing storage in the memory file.
    #[must_use]
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Tag::Array | Tag::Dictionary | Tag::String | Tag::File | Tag::Save | Tag::Stack
        )
    }
}

/// Access-control sub-field. File objects ignore this in favor of the
/// independent [`ObjectFlags::FILE_READ`]/[`ObjectFlags::FILE_WRITE`] bits.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    None = 0,
    ExecuteOnly = 1,
    ReadOnly = 2,
    Unlimited = 3,
}

const ACCESS_MASK: u8 = 0b11;

bitflags! {
    /// Flag bits above the 2-bit access field.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        const EXECUTABLE = 1 << 2;
        const FILE_READ = 1 << 3;
        const FILE_WRITE = 1 << 4;
    }
}

/// A fixed-width tagged value: type tag, packed flags, composite extent and
/// a 64-bit payload. Scalars live inline in the payload; composites carry
/// the table index of their backing storage plus an element window. The
/// payload means nothing without the tag.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Object {
    kind: u8,
    flags: u8,
    off: u16,
    len: u16,
    _pad: u16,
    payload: u64,
}

pub const OBJECT_SIZE: usize = std::mem::size_of::<Object>();

// SAFETY: every field tolerates any bit pattern (the kind byte decodes
// through Tag::from_raw) and repr(C) with the explicit pad leaves no
// compiler-inserted padding
unsafe impl Blob for Object {}

impl Object {
    fn new(tag: Tag, flags: u8, off: u16, len: u16, payload: u64) -> Self {
        Self {
            kind: tag as u8,
            flags,
            off,
            len,
            _pad: 0,
            payload,
        }
    }

    fn literal_flags() -> u8 {
        Access::Unlimited as u8
    }

    /// The "no object" sentinel. Never a real operand; popping an empty
    /// stack yields it, and consumers must treat it as underflow.
    #[must_use]
    pub fn invalid() -> Self {
        Self::new(Tag::Invalid, 0, 0, 0, 0)
    }

    #[must_use]
    pub fn integer(value: i64) -> Self {
        Self::new(
            Tag::Integer,
            Self::literal_flags(),
            0,
            0,
            value.cast_unsigned(),
        )
    }

    #[must_use]
    pub fn real(value: f64) -> Self {
        Self::new(Tag::Real, Self::literal_flags(), 0, 0, value.to_bits())
    }

    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Self::new(Tag::Boolean, Self::literal_flags(), 0, 0, u64::from(value))
    }

    #[must_use]
    pub fn mark() -> Self {
        Self::new(Tag::Mark, Self::literal_flags(), 0, 0, 0)
    }

    /// A name by interned index. The symbol table itself lives outside this
    /// core; only the index flows through it.
    #[must_use]
    pub fn name(id: u32) -> Self {
        Self::new(Tag::Name, Self::literal_flags(), 0, 0, u64::from(id))
    }

    /// An operator by dispatch-table index. Executable by construction.
    #[must_use]
    pub fn operator(index: u32) -> Self {
        let flags = Self::literal_flags() | ObjectFlags::EXECUTABLE.bits();
        Self::new(Tag::Operator, flags, 0, 0, u64::from(index))
    }

    #[must_use]
    pub fn array(handle: Handle, off: u16, len: u16) -> Self {
        Self::new(
            Tag::Array,
            Self::literal_flags(),
            off,
            len,
            u64::from(handle.index()),
        )
    }

    #[must_use]
    pub fn string(handle: Handle, off: u16, len: u16) -> Self {
        Self::new(
            Tag::String,
            Self::literal_flags(),
            off,
            len,
            u64::from(handle.index()),
        )
    }

    #[must_use]
    pub fn dictionary(handle: Handle, len: u16) -> Self {
        Self::new(
            Tag::Dictionary,
            Self::literal_flags(),
            0,
            len,
            u64::from(handle.index()),
        )
    }

    /// File objects carry independent read/write bits instead of the access
    /// field; fresh files are open both ways.
    #[must_use]
    pub fn file(handle: Handle) -> Self {
        let flags = (ObjectFlags::FILE_READ | ObjectFlags::FILE_WRITE).bits();
        Self::new(Tag::File, flags, 0, 0, u64::from(handle.index()))
    }

    #[must_use]
    pub fn save(handle: Handle) -> Self {
        Self::new(Tag::Save, Self::literal_flags(), 0, 0, u64::from(handle.index()))
    }

    #[must_use]
    pub fn stack(handle: Handle) -> Self {
        Self::new(Tag::Stack, Self::literal_flags(), 0, 0, u64::from(handle.index()))
    }

    #[must_use]
    pub fn context(ident: u64) -> Self {
        Self::new(Tag::Context, Self::literal_flags(), 0, 0, ident)
    }

    #[must_use]
    pub fn lock(ident: u32) -> Self {
        Self::new(Tag::Lock, Self::literal_flags(), 0, 0, u64::from(ident))
    }

    #[must_use]
    pub fn condition(ident: u32) -> Self {
        Self::new(Tag::Condition, Self::literal_flags(), 0, 0, u64::from(ident))
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        Tag::from_raw(self.kind)
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.tag() == Tag::Invalid
    }

    #[must_use]
    pub fn access(&self) -> Access {
        match self.flags & ACCESS_MASK {
            0 => Access::None,
            1 => Access::ExecuteOnly,
            2 => Access::ReadOnly,
            _ => Access::Unlimited,
        }
    }

    pub fn set_access(&mut self, access: Access) {
        self.flags = (self.flags & !ACCESS_MASK) | access as u8;
    }

    #[must_use]
    pub fn object_flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags)
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.object_flags().contains(ObjectFlags::EXECUTABLE)
    }

    #[must_use]
    pub fn is_literal(&self) -> bool {
        !self.is_executable()
    }

    pub fn set_executable(&mut self, executable: bool) {
        let mut flags = self.object_flags();
        flags.set(ObjectFlags::EXECUTABLE, executable);
        self.flags = (self.flags & ACCESS_MASK) | flags.bits();
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        (self.tag() == Tag::Integer).then(|| self.payload.cast_signed())
    }

    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        (self.tag() == Tag::Real).then(|| f64::from_bits(self.payload))
    }

    #[must_use]
    pub fn as_boolean(&self) -> Option<bool> {
        (self.tag() == Tag::Boolean).then(|| self.payload != 0)
    }

    /// Backing-storage handle of a composite object.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.tag().is_composite().then(|| Handle(self.payload as u32))
    }

    #[must_use]
    pub fn window_offset(&self) -> u16 {
        self.off
    }

    #[must_use]
    pub fn window_len(&self) -> u16 {
        self.len
    }

    #[must_use]
    pub fn operator_index(&self) -> Option<u32> {
        (self.tag() == Tag::Operator).then(|| self.payload as u32)
    }

    #[must_use]
    pub fn context_ident(&self) -> Option<u64> {
        (self.tag() == Tag::Context).then_some(self.payload)
    }

    #[must_use]
    pub fn lock_ident(&self) -> Option<u32> {
        (self.tag() == Tag::Lock).then(|| self.payload as u32)
    }

    #[must_use]
    pub fn condition_ident(&self) -> Option<u32> {
        (self.tag() == Tag::Condition).then(|| self.payload as u32)
    }
}

/// Structural equality: scalars by payload, composites by `(tag, handle)`
/// identity of their backing storage. The invalid sentinel equals nothing,
/// itself included.
impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        let tag = self.tag();
        if tag != other.tag() || tag == Tag::Invalid {
            return false;
        }
        self.payload == other.payload
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Invalid => f.write_str("--invalid--"),
            Tag::Integer => write!(f, "{}", self.payload.cast_signed()),
            Tag::Real => write!(f, "{}", f64::from_bits(self.payload)),
            Tag::Boolean => write!(f, "{}", self.payload != 0),
            Tag::Mark => f.write_str("mark"),
            Tag::Name => write!(f, "/name#{}", self.payload),
            Tag::Operator => write!(f, "--operator#{}--", self.payload),
            Tag::Array => write!(f, "<array ent {} len {}>", self.payload, self.len),
            Tag::Dictionary => write!(f, "<dict ent {}>", self.payload),
            Tag::String => write!(f, "<string ent {} len {}>", self.payload, self.len),
            Tag::File => write!(f, "<file ent {}>", self.payload),
            Tag::Save => write!(f, "<save ent {}>", self.payload),
            Tag::Stack => write!(f, "<stack ent {}>", self.payload),
            Tag::Context => write!(f, "<context {}>", self.payload),
            Tag::Lock => write!(f, "<lock {}>", self.payload),
            Tag::Condition => write!(f, "<condition {}>", self.payload),
        }
    }
}
