use core::ptr::NonNull;

use cw_heap::{CellKey, Heap, RefSlot};

use crate::convert::ToHost;
use crate::mapped::HostMapped;

// -----------------------------------------------------------------------------
// ArrayElement

/// A native type that can be an element of a host array.
///
/// The two associated items fix, at definition time, how one storage slot
/// relates to the native type: [`Slot`](ArrayElement::Slot) is what the host
/// array physically stores, and [`Access`](ArrayElement::Access) is the
/// strategy that bridges a slot and a native value. Every access path of the
/// array types dispatches through `Access` statically; there is no per-call
/// branch on the type relationship.
///
/// # Safety
///
/// Implementors guarantee that `Slot` is not zero-sized, and the layout
/// contract their chosen strategy relies on:
///
/// - [`Identity`] requires `Slot == Self`.
/// - [`Reinterpret`] requires `size_of::<Slot>() == size_of::<Self>()`,
///   `align_of::<Self>() <= align_of::<Slot>()`, and that every slot value
///   the runtime stores is a valid `Self`.
/// - [`Lift`] requires `Slot == RefSlot`, with slots referring to cells that
///   hold native values of exactly `Self`.
pub unsafe trait ArrayElement: HostMapped + Sized {
    /// What one array slot of this element type physically holds.
    type Slot: Copy + 'static;

    /// The strategy bridging a slot and a native value.
    type Access: ExtractStrategy<Self>;
}

// -----------------------------------------------------------------------------
// Strategies

/// Turns a raw storage slot into a native value reference.
///
/// Total: the slot-to-native relationship is fixed when the element type is
/// defined, so extraction has no error path. Slots holding a vacant or stale
/// cell reference are a runtime fault, not an error value.
pub trait ExtractStrategy<T: ArrayElement> {
    /// # Safety
    ///
    /// `slot` must point to an initialized slot in `T`'s storage form. A
    /// reference slot must refer to a cell on `heap`. The slot must stay
    /// unwritten while the returned borrow lives.
    unsafe fn extract<'a>(heap: &'a Heap, slot: NonNull<T::Slot>) -> &'a T;
}

/// Extraction strategies whose slots hold the native value itself, allowing
/// mutable access in place.
pub trait InPlace<T: ArrayElement>: ExtractStrategy<T> {
    /// # Safety
    ///
    /// Like [`ExtractStrategy::extract`], and the slot must not be read or
    /// written through any other path while the returned borrow lives.
    unsafe fn extract_mut<'a>(slot: NonNull<T::Slot>) -> &'a mut T;
}

/// Extraction strategies that can also write a native value into a slot.
pub trait Store<T: ArrayElement>: ExtractStrategy<T> {
    /// Writes `value` into slot `index` of `array`.
    ///
    /// May box `value` into a fresh cell first. Re-fetches the data pointer
    /// after any allocation, so callers only have to keep `array` pinned.
    ///
    /// # Safety
    ///
    /// `array` must be a live array of element type `T` with `index` in
    /// bounds, pinned by the caller across the call.
    unsafe fn store(heap: &Heap, array: CellKey, index: usize, value: T);
}

/// Slot and native type are the same type: extraction is a pointer cast.
pub struct Identity;

/// Slot and native type are distinct but layout-compatible: the slot is
/// reinterpreted as the native type in place.
pub struct Reinterpret;

/// The slot holds a cell reference; extraction lifts it to the referenced
/// native value. Vacant or stale references fault.
pub struct Lift;

impl<T> ExtractStrategy<T> for Identity
where
    T: ArrayElement<Slot = T>,
{
    #[inline(always)]
    unsafe fn extract<'a>(_heap: &'a Heap, slot: NonNull<T>) -> &'a T {
        unsafe { slot.as_ref() }
    }
}

impl<T> InPlace<T> for Identity
where
    T: ArrayElement<Slot = T>,
{
    #[inline(always)]
    unsafe fn extract_mut<'a>(slot: NonNull<T>) -> &'a mut T {
        unsafe { &mut *slot.as_ptr() }
    }
}

impl<T> Store<T> for Identity
where
    T: ArrayElement<Slot = T>,
{
    #[inline]
    unsafe fn store(heap: &Heap, array: CellKey, index: usize, value: T) {
        let data = match heap.array_data(array) {
            Ok(data) => data,
            Err(err) => err.fault(),
        };
        unsafe { data.cast::<T>().add(index).write(value) };
    }
}

impl<T: ArrayElement> ExtractStrategy<T> for Reinterpret {
    #[inline(always)]
    unsafe fn extract<'a>(_heap: &'a Heap, slot: NonNull<T::Slot>) -> &'a T {
        unsafe { slot.cast::<T>().as_ref() }
    }
}

impl<T: ArrayElement> InPlace<T> for Reinterpret {
    #[inline(always)]
    unsafe fn extract_mut<'a>(slot: NonNull<T::Slot>) -> &'a mut T {
        unsafe { &mut *slot.cast::<T>().as_ptr() }
    }
}

impl<T: ArrayElement> Store<T> for Reinterpret {
    #[inline]
    unsafe fn store(heap: &Heap, array: CellKey, index: usize, value: T) {
        let data = match heap.array_data(array) {
            Ok(data) => data,
            Err(err) => err.fault(),
        };
        unsafe {
            data.cast::<T::Slot>()
                .add(index)
                .cast::<T>()
                .write(value);
        }
    }
}

impl<T> ExtractStrategy<T> for Lift
where
    T: ArrayElement<Slot = RefSlot>,
{
    unsafe fn extract<'a>(heap: &'a Heap, slot: NonNull<RefSlot>) -> &'a T {
        let Some(key) = unsafe { slot.read() }.key() else {
            vacant_slot();
        };
        match heap.foreign_ptr(key) {
            // Valid for 'a: foreign payloads are quarantined at sweep and
            // freed only when the heap itself drops.
            Ok(ptr) => unsafe { ptr.cast::<T>().as_ref() },
            Err(err) => err.fault(),
        }
    }
}

impl<T> Store<T> for Lift
where
    T: ArrayElement<Slot = RefSlot> + ToHost,
{
    unsafe fn store(heap: &Heap, array: CellKey, index: usize, value: T) {
        let cell = value.to_host(heap);
        // Storing a reference never allocates, so `cell` needs no pin
        // between boxing and the write.
        if let Err(err) = heap.array_set_ref(array, index, cell) {
            err.fault();
        }
    }
}

#[cold]
#[inline(never)]
fn vacant_slot() -> ! {
    panic!("dereferenced a vacant reference slot");
}

// -----------------------------------------------------------------------------
// Primitive elements

macro_rules! identity_elements {
    ($($t:ty),* $(,)?) => {$(
        unsafe impl ArrayElement for $t {
            type Slot = $t;
            type Access = Identity;
        }
    )*};
}

identity_elements!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

// Stored as its host byte representation; every stored value is written
// through this crate as 0 or 1, and fresh slots are zeroed.
unsafe impl ArrayElement for bool {
    type Slot = u8;
    type Access = Reinterpret;
}

// Stored as its scalar value; fresh slots are zeroed, and '\0' is valid.
unsafe impl ArrayElement for char {
    type Slot = u32;
    type Access = Reinterpret;
}

// -----------------------------------------------------------------------------
// Tests
