use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::fmt::Write as _;

use cw_utils::TypeIdMap;
use cw_utils::hash::HashMap;

use crate::cell::RefSlot;

// -----------------------------------------------------------------------------
// DataTypeId

/// Identifier of an interned host datatype.
///
/// Ids index an append-only table owned by the heap; a descriptor, once
/// interned, lives as long as the heap. Primitive types occupy fixed ids so
/// they can be named as constants without a lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DataTypeId(u32);

impl DataTypeId {
    pub const BOOL: Self = Self(0);
    pub const CHAR: Self = Self(1);
    pub const I8: Self = Self(2);
    pub const I16: Self = Self(3);
    pub const I32: Self = Self(4);
    pub const I64: Self = Self(5);
    pub const U8: Self = Self(6);
    pub const U16: Self = Self(7);
    pub const U32: Self = Self(8);
    pub const U64: Self = Self(9);
    pub const F32: Self = Self(10);
    pub const F64: Self = Self(11);
    pub const UNIT: Self = Self(12);

    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Position of this type in the heap's datatype table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// -----------------------------------------------------------------------------
// DataTypeKind

/// Shape of a host datatype.
///
/// The kind fixes how array slots of the type are stored: primitives and
/// `Bits` live inline; every other kind is held behind a [`RefSlot`].
#[derive(Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum DataTypeKind {
    Bool,
    Char,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Unit,

    /// A mirrored native composite stored as raw bytes.
    Bits { layout: Layout },

    /// An opaque wrapped native type. Cells of this type hold a pointer to
    /// a native value the heap owns via a type-erased destructor.
    Foreign,

    /// Reference-wrapper element descriptor produced by resolution for
    /// wrapped element types.
    ForeignRef { target: DataTypeId },

    /// Abstract static annotation; a value's dynamic type is always one of
    /// the members.
    Union { members: Box<[DataTypeId]> },

    /// Dense array of `elem` with the given rank.
    Array { elem: DataTypeId, rank: u32 },

    /// Immutable record with one type per field.
    Record { fields: Box<[DataTypeId]> },

    /// Record whose `len` fields all share one element type.
    Repeat { elem: DataTypeId, len: usize },
}

impl DataTypeKind {
    /// Whether values of this type are stored inline in array slots.
    pub fn is_inline(&self) -> bool {
        !matches!(
            self,
            DataTypeKind::Foreign
                | DataTypeKind::ForeignRef { .. }
                | DataTypeKind::Union { .. }
                | DataTypeKind::Array { .. }
                | DataTypeKind::Record { .. }
                | DataTypeKind::Repeat { .. }
        )
    }

    /// Layout of one array slot of this type.
    pub fn slot_layout(&self) -> Layout {
        match self {
            DataTypeKind::Bool | DataTypeKind::I8 | DataTypeKind::U8 => Layout::new::<u8>(),
            DataTypeKind::I16 | DataTypeKind::U16 => Layout::new::<u16>(),
            DataTypeKind::Char | DataTypeKind::I32 | DataTypeKind::U32 | DataTypeKind::F32 => {
                Layout::new::<u32>()
            }
            DataTypeKind::I64 | DataTypeKind::U64 | DataTypeKind::F64 => Layout::new::<u64>(),
            DataTypeKind::Unit => Layout::new::<()>(),
            DataTypeKind::Bits { layout } => *layout,
            _ => Layout::new::<RefSlot>(),
        }
    }
}

// -----------------------------------------------------------------------------
// DataType

/// An interned host datatype descriptor: a display name plus its kind.
#[derive(Clone, Debug)]
pub struct DataType {
    name: Cow<'static, str>,
    kind: DataTypeKind,
}

impl DataType {
    pub(crate) fn new(name: impl Into<Cow<'static, str>>, kind: DataTypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &DataTypeKind {
        &self.kind
    }
}

// -----------------------------------------------------------------------------
// TypeTable

/// Append-only interning table for datatype descriptors, plus the binding
/// table from native `TypeId`s to host types.
pub(crate) struct TypeTable {
    descs: Vec<DataType>,
    arrays: HashMap<(DataTypeId, u32), DataTypeId>,
    records: HashMap<Box<[DataTypeId]>, DataTypeId>,
    repeats: HashMap<(DataTypeId, usize), DataTypeId>,
    refs: HashMap<DataTypeId, DataTypeId>,
    pub(crate) bindings: TypeIdMap<DataTypeId>,
}

impl TypeTable {
    /// Builds a table with the primitive types pre-interned at their fixed
    /// ids.
    pub(crate) fn with_primitives() -> Self {
        let mut table = Self {
            descs: Vec::with_capacity(32),
            arrays: HashMap::default(),
            records: HashMap::default(),
            repeats: HashMap::default(),
            refs: HashMap::default(),
            bindings: TypeIdMap::new(),
        };

        let primitives = [
            ("Bool", DataTypeKind::Bool),
            ("Char", DataTypeKind::Char),
            ("I8", DataTypeKind::I8),
            ("I16", DataTypeKind::I16),
            ("I32", DataTypeKind::I32),
            ("I64", DataTypeKind::I64),
            ("U8", DataTypeKind::U8),
            ("U16", DataTypeKind::U16),
            ("U32", DataTypeKind::U32),
            ("U64", DataTypeKind::U64),
            ("F32", DataTypeKind::F32),
            ("F64", DataTypeKind::F64),
            ("Unit", DataTypeKind::Unit),
        ];
        for (name, kind) in primitives {
            table.push(DataType::new(name, kind));
        }
        debug_assert_eq!(table.descs[DataTypeId::UNIT.index()].name(), "Unit");

        table
    }

    /// Number of interned descriptors.
    pub(crate) fn len(&self) -> usize {
        self.descs.len()
    }

    pub(crate) fn get(&self, id: DataTypeId) -> &DataType {
        &self.descs[id.index()]
    }

    pub(crate) fn push(&mut self, desc: DataType) -> DataTypeId {
        let id = DataTypeId::new(self.descs.len() as u32);
        self.descs.push(desc);
        id
    }

    /// Interns the array type over `elem` with the given rank.
    ///
    /// Returns the id and whether the descriptor is new.
    pub(crate) fn intern_array(&mut self, elem: DataTypeId, rank: u32) -> (DataTypeId, bool) {
        if let Some(&id) = self.arrays.get(&(elem, rank)) {
            return (id, false);
        }
        let name = format!("Array<{}, {rank}>", self.descs[elem.index()].name());
        let id = self.push(DataType::new(name, DataTypeKind::Array { elem, rank }));
        self.arrays.insert((elem, rank), id);
        (id, true)
    }

    /// Interns the record type with exactly `fields` as its field types.
    pub(crate) fn intern_record(&mut self, fields: &[DataTypeId]) -> (DataTypeId, bool) {
        if let Some(&id) = self.records.get(fields) {
            return (id, false);
        }
        let name = self.listed_name("Record", fields);
        let boxed: Box<[DataTypeId]> = fields.into();
        let id = self.push(DataType::new(
            name,
            DataTypeKind::Record {
                fields: boxed.clone(),
            },
        ));
        self.records.insert(boxed, id);
        (id, true)
    }

    /// Interns the homogeneous record type `len × elem`.
    pub(crate) fn intern_repeat(&mut self, elem: DataTypeId, len: usize) -> (DataTypeId, bool) {
        if let Some(&id) = self.repeats.get(&(elem, len)) {
            return (id, false);
        }
        let name = format!("Repeat<{}, {len}>", self.descs[elem.index()].name());
        let id = self.push(DataType::new(name, DataTypeKind::Repeat { elem, len }));
        self.repeats.insert((elem, len), id);
        (id, true)
    }

    /// Interns the reference-wrapper element type for `target`.
    pub(crate) fn intern_foreign_ref(&mut self, target: DataTypeId) -> (DataTypeId, bool) {
        if let Some(&id) = self.refs.get(&target) {
            return (id, false);
        }
        let name = format!("Ref<{}>", self.descs[target.index()].name());
        let id = self.push(DataType::new(name, DataTypeKind::ForeignRef { target }));
        self.refs.insert(target, id);
        (id, true)
    }

    /// Whether a value whose dynamic type is `value_ty` may be stored in a
    /// slot declared as `slot_ty`.
    pub(crate) fn assignable(&self, value_ty: DataTypeId, slot_ty: DataTypeId) -> bool {
        if value_ty == slot_ty {
            return true;
        }
        match self.get(slot_ty).kind() {
            DataTypeKind::ForeignRef { target } => *target == value_ty,
            DataTypeKind::Union { members } => members.contains(&value_ty),
            _ => false,
        }
    }

    fn listed_name(&self, head: &str, ids: &[DataTypeId]) -> String {
        let mut name = String::from(head);
        name.push('<');
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                name.push_str(", ");
            }
            // Writing to a String cannot fail.
            let _ = write!(name, "{}", self.descs[id.index()].name());
        }
        name.push('>');
        name
    }
}

// -----------------------------------------------------------------------------
// Tests
