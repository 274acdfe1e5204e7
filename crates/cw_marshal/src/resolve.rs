use cw_heap::{DataTypeId, Heap};

use crate::element::ArrayElement;

// -----------------------------------------------------------------------------
// Element-type resolution

/// Resolves the host storage type for array slots holding native `T`.
///
/// Mirrored element types store themselves: resolution is the identity on
/// their mapped type. Wrapped element types store cell references, so
/// resolution produces the reference-wrapper descriptor over the mapped
/// type instead.
///
/// Registers `T` with the heap on first use; resolving twice returns the
/// same id and registers at most once.
pub fn element_type_for<T: ArrayElement>(heap: &Heap) -> DataTypeId {
    let ty = T::host_type(heap);
    if heap.is_inline_type(ty) {
        ty
    } else {
        heap.foreign_ref_type(ty)
    }
}

/// Resolves the host array type for native element type `T` at `rank`.
pub fn array_type_for<T: ArrayElement>(heap: &Heap, rank: u32) -> DataTypeId {
    heap.array_type(element_type_for::<T>(heap), rank)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use cw_heap::DataTypeKind;

    use super::*;
    use crate::HostMapped;

    #[derive(Clone, Debug, PartialEq)]
    struct Sensor {
        id: u32,
    }

    crate::wrap_foreign!(Sensor);

    #[test]
    fn mirrored_elements_resolve_to_their_own_type() {
        let heap = Heap::new();
        assert_eq!(element_type_for::<f64>(&heap), DataTypeId::F64);
        assert_eq!(element_type_for::<bool>(&heap), DataTypeId::BOOL);
    }

    #[test]
    fn wrapped_elements_resolve_to_a_reference_descriptor() {
        let heap = Heap::new();
        let elem = element_type_for::<Sensor>(&heap);
        let target = Sensor::host_type(&heap);
        assert_ne!(elem, target);
        assert_eq!(heap.type_kind(elem), DataTypeKind::ForeignRef { target });
    }

    #[test]
    fn resolution_is_idempotent_and_registers_once() {
        let heap = Heap::new();
        let first = element_type_for::<Sensor>(&heap);
        let second = element_type_for::<Sensor>(&heap);
        assert_eq!(first, second);
        assert_eq!(heap.stats().bindings_registered, 1);

        let a1 = array_type_for::<Sensor>(&heap, 1);
        let a2 = array_type_for::<Sensor>(&heap, 1);
        assert_eq!(a1, a2);
        assert_eq!(heap.stats().bindings_registered, 1);
    }
}
