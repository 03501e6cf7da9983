//! Integer conversions between wire field widths and `usize`.

/// Widening to `usize`, lossless on every target this crate supports
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

macro_rules! widen_to_usize {
    ($($from:ty),*) => {
        $(
            impl SafeCast<usize> for $from {
                fn safe_cast(self) -> usize {
                    self as usize
                }
            }
        )*
    }
}

#[cfg(not(target_pointer_width = "16"))]
widen_to_usize!(u16, u32);

/// Narrowing from `usize` to a wire field's width. The caller has bounded the value already,
///  e.g. by a frame or datagram size limit, so a value out of range is a bug and panics.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

macro_rules! narrow_from_usize {
    ($($to:ty),*) => {
        $(
            impl PrecheckedCast<$to> for usize {
                fn prechecked_cast(self) -> $to {
                    <$to>::try_from(self)
                        .unwrap_or_else(|_| panic!("{} exceeds the range of {}", self, stringify!($to)))
                }
            }
        )*
    }
}

narrow_from_usize!(u16, u32);
