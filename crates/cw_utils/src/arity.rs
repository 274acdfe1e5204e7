/// Invokes the target macro once per tuple arity from 0 through 12.
///
/// Each invocation receives the arity and a bracketed list of
/// `index: TypeParam` pairs, so the callee can name both the field position
/// and the generic parameter for that position.
///
/// # Example
///
/// ```ignore
/// all_arities!(my_macro);
/// // expands to
/// my_macro!(0: []);
/// my_macro!(1: [0: A0]);
/// my_macro!(2: [0: A0, 1: A1]);
/// // ... through arity 12
/// ```
#[macro_export]
macro_rules! all_arities {
    ($(#[$meta:meta])* $macro:ident) => {
        $(#[$meta])* $macro!(0: []);
        $(#[$meta])* $macro!(1: [0: A0]);
        $(#[$meta])* $macro!(2: [0: A0, 1: A1]);
        $(#[$meta])* $macro!(3: [0: A0, 1: A1, 2: A2]);
        $(#[$meta])* $macro!(4: [0: A0, 1: A1, 2: A2, 3: A3]);
        $(#[$meta])* $macro!(5: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4]);
        $(#[$meta])* $macro!(6: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4, 5: A5]);
        $(#[$meta])* $macro!(7: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4, 5: A5, 6: A6]);
        $(#[$meta])* $macro!(8: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4, 5: A5, 6: A6, 7: A7]);
        $(#[$meta])* $macro!(9: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4, 5: A5, 6: A6, 7: A7, 8: A8]);
        $(#[$meta])* $macro!(10: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4, 5: A5, 6: A6, 7: A7, 8: A8, 9: A9]);
        $(#[$meta])* $macro!(11: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4, 5: A5, 6: A6, 7: A7, 8: A8, 9: A9, 10: A10]);
        $(#[$meta])* $macro!(12: [0: A0, 1: A1, 2: A2, 3: A3, 4: A4, 5: A5, 6: A6, 7: A7, 8: A8, 9: A9, 10: A10, 11: A11]);
    };
}
