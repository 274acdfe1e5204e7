use alloc::alloc::dealloc;
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::alloc::Layout;
use core::any::TypeId;
use core::cell::RefCell;
use core::cmp;
use core::mem;
use core::ptr;
use core::ptr::NonNull;

use slotmap::SlotMap;
use smallvec::{SmallVec, smallvec};

use crate::cell::{
    ArrayCell, BufferOwner, CellBody, CellKey, Dropper, ElemKind, HeapCell, RefSlot,
};
use crate::config::{CollectMode, HeapConfig};
use crate::error::{CellShape, HeapError};
use crate::roots::{RootFrames, RootGuard};
use crate::stats::HeapStats;
use crate::storage::{RawStore, array_layout};
use crate::types::{DataType, DataTypeId, DataTypeKind, TypeTable};

// -----------------------------------------------------------------------------
// Graveyard

/// Allocations detached by the sweep phase, freed only at heap teardown.
///
/// Sweeping makes a cell's handle stale but never returns its memory to the
/// allocator while the heap lives. Stale raw pointers that escaped into
/// native code therefore keep pointing at quarantined bytes instead of freed
/// ones, and foreign destructors all run at one well-defined point.
struct Graveyard {
    /// Raw array storage waiting for `dealloc`.
    allocations: Vec<(NonNull<u8>, Layout)>,
    /// Foreign values waiting for their destructor.
    holds: Vec<(NonNull<u8>, Dropper)>,
}

impl Graveyard {
    const fn new() -> Self {
        Self {
            allocations: Vec::new(),
            holds: Vec::new(),
        }
    }

    /// Detaches everything in `cell` that outlives the sweep.
    fn retire(&mut self, cell: &mut HeapCell) {
        match &mut cell.body {
            CellBody::Foreign { ptr, dropper } => self.holds.push((*ptr, *dropper)),
            CellBody::Array(arr) => {
                if let Some(allocation) = arr.store.take_allocation() {
                    match arr.owner {
                        BufferOwner::Host => self.allocations.push(allocation),
                        // Native code owns wrapped storage; detaching is enough.
                        BufferOwner::Native => {}
                    }
                }
            }
            CellBody::Bits(_) | CellBody::Record(_) => {}
        }
    }
}

/// Escalates a panicking foreign destructor during teardown into an abort;
/// unwinding out of `Heap::drop` would leak the rest of the graveyard.
struct TeardownGuard;

impl Drop for TeardownGuard {
    #[cold]
    fn drop(&mut self) {
        panic!("foreign destructor panicked during heap teardown");
    }
}

// -----------------------------------------------------------------------------
// Heap

struct HeapInner {
    types: TypeTable,
    cells: SlotMap<CellKey, HeapCell>,
    roots: RootFrames,
    retired: Graveyard,
    stats: HeapStats,
}

/// A managed cell heap with interned datatypes and mark-sweep collection.
///
/// The heap models the managed side of a native/managed boundary: values
/// live in cells addressed by generational [`CellKey`]s, datatypes are
/// interned once and live forever, and a collection sweeps every cell not
/// reachable from a pinned root. Handles to swept cells do not dangle; they
/// answer [`HeapError::StaleHandle`] from then on.
///
/// All operations take `&self`. The heap is single-threaded and not `Sync`;
/// one mutation is in flight at a time.
///
/// # Collection points
///
/// Only allocation and type synthesis can trigger a collection, and only in
/// [`CollectMode::Stress`], where every such point collects first. Run tests
/// under stress to turn a missing [`pin`](RootGuard::pin) into a
/// deterministic [`HeapError::StaleHandle`] instead of silent luck.
///
/// # Examples
///
/// ```
/// use cw_heap::{DataTypeId, Heap};
///
/// let heap = Heap::new();
/// let array = heap.alloc_array(DataTypeId::F64, 3);
///
/// let roots = heap.root_scope();
/// roots.pin(array);
/// heap.collect();
///
/// // Pinned, so the collection left it alone.
/// assert_eq!(heap.array_len(array), Ok(3));
/// ```
pub struct Heap {
    config: HeapConfig,
    inner: RefCell<HeapInner>,
}

impl Heap {
    /// Creates a heap with the default configuration.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::new())
    }

    /// Creates a heap collecting at every allocation point.
    ///
    /// Shorthand for [`Heap::with_config`] with [`HeapConfig::stress`].
    pub fn stress() -> Self {
        Self::with_config(HeapConfig::stress())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let types = TypeTable::with_primitives();
        let stats = HeapStats {
            types_interned: types.len() as u64,
            ..HeapStats::default()
        };
        let cells = SlotMap::with_capacity_and_key(config.initial_cells);
        Self {
            config,
            inner: RefCell::new(HeapInner {
                types,
                cells,
                roots: RootFrames::new(),
                retired: Graveyard::new(),
                stats,
            }),
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// A snapshot of the allocation and collection counters.
    pub fn stats(&self) -> HeapStats {
        self.inner.borrow().stats
    }

    /// Number of cells currently alive.
    pub fn live_cells(&self) -> usize {
        self.inner.borrow().cells.len()
    }

    /// Whether `key` still refers to a live cell.
    pub fn is_live(&self, key: CellKey) -> bool {
        self.inner.borrow().cells.contains_key(key)
    }

    // -------------------------------------------------------------------------
    // Collection

    /// Opens a pin scope; see [`RootGuard`].
    pub fn root_scope(&self) -> RootGuard<'_> {
        RootGuard::new(self)
    }

    pub(crate) fn push_root_frame(&self) -> usize {
        self.inner.borrow_mut().roots.push_frame()
    }

    pub(crate) fn pin_in_frame(&self, frame: usize, key: CellKey) {
        self.inner.borrow_mut().roots.pin(frame, key);
    }

    pub(crate) fn release_root_frame(&self, frame: usize) {
        self.inner.borrow_mut().roots.release(frame);
    }

    /// Runs a full mark-sweep collection and returns the number of cells
    /// swept.
    ///
    /// Marking starts from every pinned key and follows record fields and
    /// reference-slot array elements. Swept cells turn their handles stale;
    /// their backing memory moves to the graveyard and is reclaimed when the
    /// heap drops.
    pub fn collect(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let mut work: Vec<CellKey> = inner.roots.pinned().collect();
        while let Some(key) = work.pop() {
            let Some(cell) = inner.cells.get_mut(key) else {
                continue;
            };
            if cell.marked {
                continue;
            }
            cell.marked = true;
            match &cell.body {
                CellBody::Record(fields) => work.extend_from_slice(fields),
                CellBody::Array(arr) if arr.kind == ElemKind::Refs => {
                    for index in 0..arr.len {
                        // In bounds: `len <= cap` is an `ArrayCell` invariant.
                        let slot = unsafe { arr.store.slot(index).cast::<RefSlot>().read() };
                        if let Some(target) = slot.key() {
                            work.push(target);
                        }
                    }
                }
                _ => {}
            }
        }

        let retired = &mut inner.retired;
        let mut swept = 0u64;
        inner.cells.retain(|_, cell| {
            if cell.marked {
                cell.marked = false;
                true
            } else {
                retired.retire(cell);
                swept += 1;
                false
            }
        });

        inner.stats.collections += 1;
        inner.stats.cells_swept += swept;
        if swept != 0 {
            log::trace!("collect: swept {swept} cells, {} live", inner.cells.len());
        }
        swept
    }

    /// Collects first when running under [`CollectMode::Stress`].
    ///
    /// Every allocation and type-synthesis entry point passes through here,
    /// so stress runs surface unpinned handles deterministically.
    fn stress_collect(&self) {
        if self.config.collect == CollectMode::Stress {
            self.collect();
        }
    }

    // -------------------------------------------------------------------------
    // Datatypes

    /// Interns the array type over `elem` with the given rank.
    pub fn array_type(&self, elem: DataTypeId, rank: u32) -> DataTypeId {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let (id, newly) = inner.types.intern_array(elem, rank);
        if newly {
            inner.stats.types_interned += 1;
        }
        id
    }

    /// Interns the record type with exactly these field types.
    ///
    /// Interning is structural: two calls with equal field lists return the
    /// same id, so record types compare by identity.
    pub fn record_type(&self, fields: &[DataTypeId]) -> DataTypeId {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let (id, newly) = inner.types.intern_record(fields);
        if newly {
            inner.stats.types_interned += 1;
        }
        id
    }

    /// Interns the record type of `len` fields all typed `elem`.
    pub fn repeat_type(&self, elem: DataTypeId, len: usize) -> DataTypeId {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let (id, newly) = inner.types.intern_repeat(elem, len);
        if newly {
            inner.stats.types_interned += 1;
        }
        id
    }

    /// Interns the reference-wrapper element type for a wrapped `target`.
    ///
    /// Arrays of non-mirrored types store these: their slots hold cell
    /// references rather than inline values, and a slot accepts any cell
    /// whose type is `target` itself.
    pub fn foreign_ref_type(&self, target: DataTypeId) -> DataTypeId {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let (id, newly) = inner.types.intern_foreign_ref(target);
        if newly {
            inner.stats.types_interned += 1;
        }
        id
    }

    /// The kind of an interned type.
    pub fn type_kind(&self, id: DataTypeId) -> DataTypeKind {
        self.inner.borrow().types.get(id).kind().clone()
    }

    /// The display name of an interned type.
    pub fn type_name(&self, id: DataTypeId) -> String {
        self.inner.borrow().types.get(id).name().to_string()
    }

    /// Layout of one array slot holding values of type `id`.
    pub fn slot_layout(&self, id: DataTypeId) -> Layout {
        self.inner.borrow().types.get(id).kind().slot_layout()
    }

    /// Whether values of type `id` are stored inline in array slots.
    pub fn is_inline_type(&self, id: DataTypeId) -> bool {
        self.inner.borrow().types.get(id).kind().is_inline()
    }

    /// Whether a value of dynamic type `value` may occupy a slot declared as
    /// `slot`: the types are identical, `slot` is the reference wrapper over
    /// `value`, or `slot` is a union listing `value` as a member.
    pub fn assignable(&self, value: DataTypeId, slot: DataTypeId) -> bool {
        self.inner.borrow().types.assignable(value, slot)
    }

    // -------------------------------------------------------------------------
    // Bindings

    /// The type id previously bound to the native type `T`, if any.
    pub fn binding<T: ?Sized + 'static>(&self) -> Option<DataTypeId> {
        self.inner.borrow().types.bindings.get_type::<T>().copied()
    }

    /// Binds the native type `T` to a host type, registering at most once.
    ///
    /// When `T` has no binding yet, `register` runs with the borrow released
    /// so it may synthesize types and bind other natives reentrantly. If a
    /// nested call bound `T` first, that earlier binding wins and the id
    /// `register` produced is left as an unused descriptor.
    pub fn bind<T: 'static>(&self, register: impl FnOnce(&Self) -> DataTypeId) -> DataTypeId {
        if let Some(id) = self.binding::<T>() {
            return id;
        }
        let registered = register(self);

        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let mut newly = false;
        let id = *inner.types.bindings.get_or_insert(TypeId::of::<T>(), || {
            newly = true;
            registered
        });
        if newly {
            inner.stats.bindings_registered += 1;
            log::debug!("bound `{}` to type {id:?}", core::any::type_name::<T>());
        }
        id
    }

    /// Binds `T` as a mirrored composite stored as `size_of::<T>()` raw
    /// bytes.
    pub fn bind_bits<T: 'static>(&self, name: &'static str) -> DataTypeId {
        self.bind::<T>(|heap| {
            heap.push_named(
                name,
                DataTypeKind::Bits {
                    layout: Layout::new::<T>(),
                },
            )
        })
    }

    /// Binds `T` as an opaque wrapped type held behind cell references.
    pub fn bind_foreign<T: 'static>(&self, name: &'static str) -> DataTypeId {
        self.bind::<T>(|heap| heap.push_named(name, DataTypeKind::Foreign))
    }

    /// Binds `T` to an abstract union over `members`.
    ///
    /// Values never carry the union type itself; their dynamic type is one
    /// of the members, and slots declared with the union accept any of
    /// them.
    pub fn bind_union<T: 'static>(&self, name: &'static str, members: &[DataTypeId]) -> DataTypeId {
        self.bind::<T>(|heap| {
            heap.push_named(
                name,
                DataTypeKind::Union {
                    members: members.into(),
                },
            )
        })
    }

    fn push_named(&self, name: &'static str, kind: DataTypeKind) -> DataTypeId {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        inner.stats.types_interned += 1;
        let id = inner.types.push(DataType::new(name, kind));
        log::trace!("interned `{name}` as {id:?}");
        id
    }

    // -------------------------------------------------------------------------
    // Boxes

    /// Boxes a mirrored value from its raw bytes into a fresh cell.
    ///
    /// `bytes` must be exactly one slot of `ty` long; the caller obtains the
    /// length from [`Heap::slot_layout`] or statically.
    pub fn alloc_bits(&self, ty: DataTypeId, bytes: &[u8]) -> CellKey {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        debug_assert!(inner.types.get(ty).kind().is_inline());
        debug_assert_eq!(bytes.len(), inner.types.get(ty).kind().slot_layout().size());
        inner.stats.cells_allocated += 1;
        inner.stats.boxes_allocated += 1;
        inner.cells.insert(HeapCell {
            ty,
            marked: false,
            body: CellBody::Bits(bytes.into()),
        })
    }

    /// Moves a native value into a heap-owned cell of the wrapped type `ty`.
    ///
    /// The heap runs `T`'s destructor when the cell's memory is reclaimed at
    /// teardown.
    pub fn alloc_foreign<T: 'static>(&self, ty: DataTypeId, value: T) -> CellKey {
        self.stress_collect();
        let ptr = NonNull::from(Box::leak(Box::new(value))).cast::<u8>();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        debug_assert!(matches!(
            inner.types.get(ty).kind(),
            DataTypeKind::Foreign
        ));
        inner.stats.cells_allocated += 1;
        inner.stats.boxes_allocated += 1;
        inner.cells.insert(HeapCell {
            ty,
            marked: false,
            body: CellBody::Foreign {
                ptr,
                dropper: Dropper::of::<T>(),
            },
        })
    }

    /// The dynamic type of the cell behind `key`.
    pub fn cell_type(&self, key: CellKey) -> Result<DataTypeId, HeapError> {
        let inner = self.inner.borrow();
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        Ok(cell.ty)
    }

    /// Copies a boxed mirrored value's bytes into `dst`.
    pub fn bits_copy(&self, key: CellKey, dst: &mut [u8]) -> Result<(), HeapError> {
        let inner = self.inner.borrow();
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        match &cell.body {
            CellBody::Bits(bytes) => {
                if bytes.len() != dst.len() {
                    return Err(HeapError::BitsSizeMismatch {
                        expect: dst.len(),
                        found: bytes.len(),
                    });
                }
                dst.copy_from_slice(bytes);
                Ok(())
            }
            other => Err(HeapError::NotBits(shape_of(other))),
        }
    }

    /// Pointer to the native value owned by a wrapped cell.
    ///
    /// The pointee stays valid until the heap drops; after the cell is
    /// swept the handle answers [`HeapError::StaleHandle`] instead.
    pub fn foreign_ptr(&self, key: CellKey) -> Result<NonNull<u8>, HeapError> {
        let inner = self.inner.borrow();
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        match &cell.body {
            CellBody::Foreign { ptr, .. } => Ok(*ptr),
            other => Err(HeapError::NotForeign(shape_of(other))),
        }
    }

    // -------------------------------------------------------------------------
    // Records

    /// Allocates an immutable record of `ty` holding `fields`.
    ///
    /// `ty` must be a record or repeat type of matching arity, every field
    /// must be live, and each field's dynamic type must be assignable to the
    /// declared field type.
    ///
    /// This is an allocation point: under stress it collects first, so the
    /// caller pins `fields` beforehand.
    pub fn alloc_record(&self, ty: DataTypeId, fields: &[CellKey]) -> Result<CellKey, HeapError> {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let declared: SmallVec<[DataTypeId; 8]> = match inner.types.get(ty).kind() {
            DataTypeKind::Record { fields } => fields.iter().copied().collect(),
            DataTypeKind::Repeat { elem, len } => SmallVec::from_elem(*elem, *len),
            _ => return Err(HeapError::NotARecordType(ty)),
        };
        if fields.len() != declared.len() {
            return Err(HeapError::ArityMismatch {
                expect: declared.len(),
                found: fields.len(),
            });
        }
        for (&field, &slot_ty) in fields.iter().zip(&declared) {
            let field_ty = inner
                .cells
                .get(field)
                .ok_or(HeapError::StaleHandle)?
                .ty;
            if !inner.types.assignable(field_ty, slot_ty) {
                return Err(HeapError::SlotTypeMismatch {
                    expect: slot_ty,
                    found: field_ty,
                });
            }
        }

        inner.stats.cells_allocated += 1;
        Ok(inner.cells.insert(HeapCell {
            ty,
            marked: false,
            body: CellBody::Record(fields.into()),
        }))
    }

    /// Number of fields in the record behind `key`.
    pub fn record_arity(&self, key: CellKey) -> Result<usize, HeapError> {
        let inner = self.inner.borrow();
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        match &cell.body {
            CellBody::Record(fields) => Ok(fields.len()),
            other => Err(HeapError::NotARecord(shape_of(other))),
        }
    }

    /// The cell held in field `index` of the record behind `key`.
    pub fn record_field(&self, key: CellKey, index: usize) -> Result<CellKey, HeapError> {
        let inner = self.inner.borrow();
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        match &cell.body {
            CellBody::Record(fields) => {
                fields
                    .get(index)
                    .copied()
                    .ok_or(HeapError::FieldOutOfBounds {
                        index,
                        arity: fields.len(),
                    })
            }
            other => Err(HeapError::NotARecord(shape_of(other))),
        }
    }

    // -------------------------------------------------------------------------
    // Arrays

    /// Allocates a rank-1 array of `len` elements of type `elem`.
    ///
    /// Inline slots start zeroed; reference slots start vacant.
    pub fn alloc_array(&self, elem: DataTypeId, len: usize) -> CellKey {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let (ty, newly) = inner.types.intern_array(elem, 1);
        if newly {
            inner.stats.types_interned += 1;
        }
        let elem_kind = inner.types.get(elem).kind();
        let slot_layout = elem_kind.slot_layout();
        let kind = if elem_kind.is_inline() {
            ElemKind::Inline
        } else {
            ElemKind::Refs
        };

        let store = RawStore::alloc(slot_layout, len);
        fill_slots(&store, kind, 0, len);
        inner.stats.array_bytes_allocated += array_layout(slot_layout, len).size() as u64;
        inner.stats.cells_allocated += 1;
        inner.cells.insert(HeapCell {
            ty,
            marked: false,
            body: CellBody::Array(ArrayCell {
                elem,
                rank: 1,
                dims: smallvec![len],
                len,
                kind,
                owner: BufferOwner::Host,
                wrapped: false,
                store,
            }),
        })
    }

    /// Builds an array object over an existing native buffer without
    /// copying.
    ///
    /// The array's extent is `dims` (row-major, rank `dims.len()`), its
    /// element type `elem` must be stored inline, and it can never grow.
    /// With [`BufferOwner::Host`] the heap frees the allocation at teardown;
    /// with [`BufferOwner::Native`] it never does.
    ///
    /// # Safety
    ///
    /// `data` must point to storage valid for the product of `dims` slots of
    /// `elem`'s slot layout, properly aligned, and must stay valid for every
    /// access made through the returned cell. For [`BufferOwner::Host`] the
    /// allocation must have come from the global allocator with the array
    /// layout over exactly that many slots.
    pub unsafe fn wrap_buffer(
        &self,
        elem: DataTypeId,
        data: NonNull<u8>,
        dims: &[usize],
        owner: BufferOwner,
    ) -> CellKey {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let rank = dims.len() as u32;
        let (ty, newly) = inner.types.intern_array(elem, rank);
        if newly {
            inner.stats.types_interned += 1;
        }
        let elem_kind = inner.types.get(elem).kind();
        debug_assert!(elem_kind.is_inline(), "wrapped buffers hold mirrored slots");

        let len = dims.iter().product();
        let store = unsafe { RawStore::wrap(elem_kind.slot_layout(), data, len) };
        inner.stats.cells_allocated += 1;
        inner.cells.insert(HeapCell {
            ty,
            marked: false,
            body: CellBody::Array(ArrayCell {
                elem,
                rank,
                dims: SmallVec::from_slice(dims),
                len,
                kind: ElemKind::Inline,
                owner,
                wrapped: true,
                store,
            }),
        })
    }

    /// Element count of the array behind `key`.
    pub fn array_len(&self, key: CellKey) -> Result<usize, HeapError> {
        self.with_array(key, |arr| arr.len)
    }

    /// Element type of the array behind `key`.
    pub fn array_elem_type(&self, key: CellKey) -> Result<DataTypeId, HeapError> {
        self.with_array(key, |arr| arr.elem)
    }

    pub fn array_rank(&self, key: CellKey) -> Result<u32, HeapError> {
        self.with_array(key, |arr| arr.rank)
    }

    /// Extent along each dimension, row-major.
    pub fn array_dims(&self, key: CellKey) -> Result<Box<[usize]>, HeapError> {
        self.with_array(key, |arr| Box::from(arr.dims.as_slice()))
    }

    pub fn array_owner(&self, key: CellKey) -> Result<BufferOwner, HeapError> {
        self.with_array(key, |arr| arr.owner)
    }

    /// Base pointer of the array's slot storage.
    ///
    /// Valid until the array grows or the heap drops. After the cell is
    /// swept the old storage still holds its last bytes (quarantined, not
    /// freed), but the handle answers [`HeapError::StaleHandle`].
    pub fn array_data(&self, key: CellKey) -> Result<NonNull<u8>, HeapError> {
        self.with_array(key, |arr| arr.store.data())
    }

    /// Extends a rank-1 array by `extra` elements.
    ///
    /// New slots are zeroed or vacant like [`Heap::alloc_array`]'s. When
    /// capacity is exhausted the elements move to a fresh buffer and the old
    /// one is quarantined until teardown, so previously taken data pointers
    /// read stale bytes rather than freed memory.
    ///
    /// This is an allocation point: under stress it collects first, so the
    /// caller pins the array beforehand.
    pub fn array_grow(&self, key: CellKey, extra: usize) -> Result<(), HeapError> {
        self.stress_collect();
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let cell = inner.cells.get_mut(key).ok_or(HeapError::StaleHandle)?;
        let arr = match &mut cell.body {
            CellBody::Array(arr) => arr,
            other => return Err(HeapError::NotAnArray(shape_of(other))),
        };
        if arr.wrapped {
            return Err(HeapError::GrowWrapped);
        }
        if arr.rank != 1 {
            return Err(HeapError::GrowRank(arr.rank));
        }
        if extra == 0 {
            return Ok(());
        }

        let new_len = arr
            .len
            .checked_add(extra)
            .unwrap_or_else(|| capacity_overflow());
        if new_len > arr.store.cap() {
            let new_cap = cmp::max(new_len, cmp::max(4, arr.store.cap().saturating_mul(2)));
            if let Some(old) = arr.store.grow(arr.len, new_cap) {
                inner.retired.allocations.push(old);
            }
            inner.stats.array_bytes_allocated +=
                array_layout(arr.store.elem_layout(), new_cap).size() as u64;
        }
        fill_slots(&arr.store, arr.kind, arr.len, new_len);
        arr.len = new_len;
        arr.dims[0] = new_len;
        Ok(())
    }

    /// Stores a cell reference into slot `index` of a reference-slot array.
    ///
    /// The value must be live and assignable to the array's element type.
    /// This never allocates and never collects.
    pub fn array_set_ref(
        &self,
        key: CellKey,
        index: usize,
        value: CellKey,
    ) -> Result<(), HeapError> {
        let inner = self.inner.borrow();
        let value_ty = inner.cells.get(value).ok_or(HeapError::StaleHandle)?.ty;
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        match &cell.body {
            CellBody::Array(arr) => {
                if arr.kind != ElemKind::Refs {
                    return Err(HeapError::NotRefSlots);
                }
                if index >= arr.len {
                    return Err(HeapError::IndexOutOfBounds {
                        index,
                        len: arr.len,
                    });
                }
                if !inner.types.assignable(value_ty, arr.elem) {
                    return Err(HeapError::SlotTypeMismatch {
                        expect: arr.elem,
                        found: value_ty,
                    });
                }
                // The slot buffer is a separate allocation; writing through
                // it does not alias the cell table borrow.
                unsafe {
                    arr.store
                        .slot(index)
                        .cast::<RefSlot>()
                        .write(RefSlot::occupied(value));
                }
                Ok(())
            }
            other => Err(HeapError::NotAnArray(shape_of(other))),
        }
    }

    /// Reads the reference in slot `index` of a reference-slot array.
    pub fn array_get_ref(&self, key: CellKey, index: usize) -> Result<RefSlot, HeapError> {
        let inner = self.inner.borrow();
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        match &cell.body {
            CellBody::Array(arr) => {
                if arr.kind != ElemKind::Refs {
                    return Err(HeapError::NotRefSlots);
                }
                if index >= arr.len {
                    return Err(HeapError::IndexOutOfBounds {
                        index,
                        len: arr.len,
                    });
                }
                Ok(unsafe { arr.store.slot(index).cast::<RefSlot>().read() })
            }
            other => Err(HeapError::NotAnArray(shape_of(other))),
        }
    }

    fn with_array<R>(
        &self,
        key: CellKey,
        project: impl FnOnce(&ArrayCell) -> R,
    ) -> Result<R, HeapError> {
        let inner = self.inner.borrow();
        let cell = inner.cells.get(key).ok_or(HeapError::StaleHandle)?;
        match &cell.body {
            CellBody::Array(arr) => Ok(project(arr)),
            other => Err(HeapError::NotAnArray(shape_of(other))),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.roots.is_balanced() {
            log::warn!("heap dropped with root scopes still open");
        }

        let HeapInner {
            cells, retired, ..
        } = inner;
        for (_, mut cell) in cells.drain() {
            retired.retire(&mut cell);
        }
        for (ptr, dropper) in retired.holds.drain(..) {
            let guard = TeardownGuard;
            unsafe { dropper.call(ptr) };
            mem::forget(guard);
        }
        for (ptr, layout) in retired.allocations.drain(..) {
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Initializes slots `[from, to)`: zeroed for inline storage, vacant for
/// reference storage.
fn fill_slots(store: &RawStore, kind: ElemKind, from: usize, to: usize) {
    debug_assert!(from <= to && to <= store.cap());
    match kind {
        ElemKind::Inline => unsafe {
            if store.elem_size() != 0 && to > from {
                ptr::write_bytes(
                    store.slot(from).as_ptr(),
                    0,
                    (to - from) * store.elem_size(),
                );
            }
        },
        ElemKind::Refs => {
            for index in from..to {
                unsafe { store.slot(index).cast::<RefSlot>().write(RefSlot::vacant()) };
            }
        }
    }
}

fn shape_of(body: &CellBody) -> CellShape {
    match body {
        CellBody::Bits(_) => CellShape::Bits,
        CellBody::Foreign { .. } => CellShape::Foreign,
        CellBody::Record(_) => CellShape::Record,
        CellBody::Array(_) => CellShape::Array,
    }
}

#[cold]
#[inline(never)]
fn capacity_overflow() -> ! {
    panic!("array length overflows the address space");
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use core::cell::Cell;

    use super::*;

    fn boxed_i64(heap: &Heap, value: i64) -> CellKey {
        heap.alloc_bits(DataTypeId::I64, &value.to_ne_bytes())
    }

    fn read_i64(heap: &Heap, key: CellKey) -> i64 {
        let mut bytes = [0u8; 8];
        heap.bits_copy(key, &mut bytes).unwrap();
        i64::from_ne_bytes(bytes)
    }

    #[test]
    fn unrooted_cells_are_swept() {
        let heap = Heap::new();
        let key = boxed_i64(&heap, 7);
        assert!(heap.is_live(key));

        assert_eq!(heap.collect(), 1);
        assert!(!heap.is_live(key));
        assert_eq!(heap.cell_type(key), Err(HeapError::StaleHandle));
    }

    #[test]
    fn pinned_cells_survive() {
        let heap = Heap::new();
        let key = boxed_i64(&heap, 7);

        let roots = heap.root_scope();
        roots.pin(key);
        assert_eq!(heap.collect(), 0);
        assert_eq!(read_i64(&heap, key), 7);

        drop(roots);
        assert_eq!(heap.collect(), 1);
        assert!(!heap.is_live(key));
    }

    #[test]
    fn records_keep_their_fields_alive() {
        let heap = Heap::new();
        let a = boxed_i64(&heap, 1);
        let b = boxed_i64(&heap, 2);
        let ty = heap.record_type(&[DataTypeId::I64, DataTypeId::I64]);
        let record = heap.alloc_record(ty, &[a, b]).unwrap();

        let roots = heap.root_scope();
        roots.pin(record);
        heap.collect();

        assert!(heap.is_live(a) && heap.is_live(b));
        assert_eq!(heap.record_field(record, 1), Ok(b));
        assert_eq!(read_i64(&heap, b), 2);
    }

    #[test]
    fn ref_arrays_keep_stored_elements_alive() {
        let heap = Heap::new();
        let elem_ty = heap.bind_foreign::<&'static str>("Label");
        let ref_ty = heap.foreign_ref_type(elem_ty);
        let array = heap.alloc_array(ref_ty, 2);
        let value = heap.alloc_foreign(elem_ty, "hello");
        heap.array_set_ref(array, 0, value).unwrap();

        let roots = heap.root_scope();
        roots.pin(array);
        heap.collect();

        assert!(heap.is_live(value));
        assert_eq!(heap.array_get_ref(array, 0).unwrap().key(), Some(value));
        assert!(heap.array_get_ref(array, 1).unwrap().is_vacant());
    }

    #[test]
    fn stress_mode_collects_at_allocation_points() {
        let heap = Heap::stress();
        let first = boxed_i64(&heap, 1);
        let second = boxed_i64(&heap, 2);

        // Allocating `second` collected first and swept the unpinned cell.
        assert!(!heap.is_live(first));
        assert!(heap.is_live(second));
    }

    #[test]
    fn stress_mode_spares_pinned_cells() {
        let heap = Heap::stress();
        let roots = heap.root_scope();
        let first = boxed_i64(&heap, 1);
        roots.pin(first);
        let _second = boxed_i64(&heap, 2);

        assert_eq!(read_i64(&heap, first), 1);
    }

    #[test]
    fn grow_extends_and_preserves_elements() {
        let heap = Heap::new();
        let array = heap.alloc_array(DataTypeId::I64, 2);
        let data = heap.array_data(array).unwrap().cast::<i64>();
        unsafe {
            data.write(11);
            data.add(1).write(22);
        }

        heap.array_grow(array, 3).unwrap();
        assert_eq!(heap.array_len(array), Ok(5));
        assert_eq!(heap.array_dims(array).unwrap().as_ref(), &[5]);

        let data = heap.array_data(array).unwrap().cast::<i64>();
        unsafe {
            assert_eq!(data.read(), 11);
            assert_eq!(data.add(1).read(), 22);
            // Fresh slots are zeroed.
            assert_eq!(data.add(4).read(), 0);
        }
    }

    #[test]
    fn grow_relocates_once_capacity_runs_out() {
        let heap = Heap::new();
        let array = heap.alloc_array(DataTypeId::U8, 1);
        let before = heap.array_data(array).unwrap();
        heap.array_grow(array, 64).unwrap();
        let after = heap.array_data(array).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn wrapped_buffers_never_grow() {
        let heap = Heap::new();
        let mut native = [1.0f64, 2.0, 3.0];
        let array = unsafe {
            heap.wrap_buffer(
                DataTypeId::F64,
                NonNull::new(native.as_mut_ptr().cast()).unwrap(),
                &[3],
                BufferOwner::Native,
            )
        };
        assert_eq!(heap.array_grow(array, 1), Err(HeapError::GrowWrapped));
        assert_eq!(heap.array_len(array), Ok(3));
        assert_eq!(heap.array_owner(array), Ok(BufferOwner::Native));
        drop(heap);
        // Teardown left the native buffer alone.
        assert_eq!(native, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn wrap_reports_rank_and_dims() {
        let heap = Heap::new();
        let mut grid = [0i32; 6];
        let array = unsafe {
            heap.wrap_buffer(
                DataTypeId::I32,
                NonNull::new(grid.as_mut_ptr().cast()).unwrap(),
                &[2, 3],
                BufferOwner::Native,
            )
        };
        assert_eq!(heap.array_rank(array), Ok(2));
        assert_eq!(heap.array_dims(array).unwrap().as_ref(), &[2, 3]);
        assert_eq!(heap.array_len(array), Ok(6));
        assert_eq!(heap.array_grow(array, 1), Err(HeapError::GrowWrapped));
    }

    #[test]
    fn record_checks_arity_and_field_types() {
        let heap = Heap::new();
        let ty = heap.record_type(&[DataTypeId::I64, DataTypeId::F64]);
        let a = boxed_i64(&heap, 1);
        let f = heap.alloc_bits(DataTypeId::F64, &1.5f64.to_ne_bytes());

        assert_eq!(
            heap.alloc_record(ty, &[a]),
            Err(HeapError::ArityMismatch {
                expect: 2,
                found: 1
            })
        );
        assert_eq!(
            heap.alloc_record(ty, &[f, a]),
            Err(HeapError::SlotTypeMismatch {
                expect: DataTypeId::I64,
                found: DataTypeId::F64,
            })
        );
        let record = heap.alloc_record(ty, &[a, f]).unwrap();
        assert_eq!(heap.record_arity(record), Ok(2));
        assert_eq!(heap.record_field(record, 0), Ok(a));
        assert_eq!(
            heap.record_field(record, 2),
            Err(HeapError::FieldOutOfBounds { index: 2, arity: 2 })
        );
    }

    #[test]
    fn union_slots_accept_members_only() {
        let heap = Heap::new();
        struct IntOrFloat;
        let union = heap.bind_union::<IntOrFloat>(
            "IntOrFloat",
            &[DataTypeId::I64, DataTypeId::F64],
        );
        let array = heap.alloc_array(union, 2);

        let int = boxed_i64(&heap, 3);
        let float = heap.alloc_bits(DataTypeId::F64, &2.5f64.to_ne_bytes());
        let boolean = heap.alloc_bits(DataTypeId::BOOL, &[1]);

        heap.array_set_ref(array, 0, int).unwrap();
        heap.array_set_ref(array, 1, float).unwrap();
        assert_eq!(
            heap.array_set_ref(array, 0, boolean),
            Err(HeapError::SlotTypeMismatch {
                expect: union,
                found: DataTypeId::BOOL,
            })
        );

        // Elements keep their concrete dynamic type.
        assert_eq!(heap.cell_type(int), Ok(DataTypeId::I64));
    }

    #[test]
    fn set_ref_rejects_inline_arrays_and_stale_values() {
        let heap = Heap::new();
        let inline = heap.alloc_array(DataTypeId::I64, 1);
        let value = boxed_i64(&heap, 9);
        assert_eq!(
            heap.array_set_ref(inline, 0, value),
            Err(HeapError::NotRefSlots)
        );

        let ref_elem = heap.foreign_ref_type(DataTypeId::I64);
        let refs = heap.alloc_array(ref_elem, 1);
        let roots = heap.root_scope();
        roots.pin(refs);
        heap.collect();
        assert_eq!(
            heap.array_set_ref(refs, 0, value),
            Err(HeapError::StaleHandle)
        );
    }

    #[test]
    fn bits_copy_checks_length() {
        let heap = Heap::new();
        let key = boxed_i64(&heap, 5);
        let mut short = [0u8; 4];
        assert_eq!(
            heap.bits_copy(key, &mut short),
            Err(HeapError::BitsSizeMismatch {
                expect: 4,
                found: 8
            })
        );
    }

    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn foreign_destructors_run_at_teardown_not_at_sweep() {
        let dropped = Rc::new(Cell::new(false));
        let heap = Heap::new();
        let ty = heap.bind_foreign::<DropFlag>("DropFlag");
        let key = heap.alloc_foreign(ty, DropFlag(Rc::clone(&dropped)));

        heap.collect();
        assert!(!heap.is_live(key));
        // Swept, but quarantined: the destructor has not run yet.
        assert!(!dropped.get());

        drop(heap);
        assert!(dropped.get());
    }

    #[test]
    fn live_foreign_values_drop_with_the_heap() {
        let dropped = Rc::new(Cell::new(false));
        {
            let heap = Heap::new();
            let ty = heap.bind_foreign::<DropFlag>("DropFlag");
            let _key = heap.alloc_foreign(ty, DropFlag(Rc::clone(&dropped)));
            assert!(!dropped.get());
        }
        assert!(dropped.get());
    }

    #[test]
    fn bind_registers_at_most_once() {
        let heap = Heap::new();
        struct Native;
        let first = heap.bind_foreign::<Native>("Native");
        let second = heap.bind_foreign::<Native>("Native");
        assert_eq!(first, second);
        assert_eq!(heap.stats().bindings_registered, 1);
        assert_eq!(heap.binding::<Native>(), Some(first));
    }

    #[test]
    fn type_interning_is_structural() {
        let heap = Heap::new();
        let before = heap.stats().types_interned;
        let a = heap.array_type(DataTypeId::F64, 1);
        let b = heap.array_type(DataTypeId::F64, 1);
        let r1 = heap.record_type(&[DataTypeId::I8, DataTypeId::U8]);
        let r2 = heap.record_type(&[DataTypeId::I8, DataTypeId::U8]);
        assert_eq!(a, b);
        assert_eq!(r1, r2);
        assert_eq!(heap.stats().types_interned, before + 2);
    }

    #[test]
    fn out_of_order_release_stays_sound() {
        let heap = Heap::new();
        let key = boxed_i64(&heap, 1);
        let outer = heap.root_scope();
        let inner = heap.root_scope();
        inner.pin(key);
        drop(outer);
        drop(inner);
        assert_eq!(heap.collect(), 1);
    }

    #[test]
    fn collection_counters_accumulate() {
        let heap = Heap::new();
        boxed_i64(&heap, 1);
        boxed_i64(&heap, 2);
        heap.collect();
        let stats = heap.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.cells_swept, 2);
        assert_eq!(stats.boxes_allocated, 2);
    }
}
