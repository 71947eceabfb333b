use std::ops::Deref;

/// A buffer handed over by the engine for a single dispatch.
///
/// The engine owns the memory; a `FuzzInput` only borrows it for the duration
/// of one callback and must never outlive it.
#[derive(Debug, Clone, Copy)]
pub struct FuzzInput<'a> {
    bytes: &'a [u8],
}

impl<'a> FuzzInput<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Borrows `size` bytes starting at `data`.
    ///
    /// A null `data` or a zero `size` yields the empty input.
    ///
    /// # Safety
    /// When `data` is non-null it must point to `size` initialized bytes that
    /// stay valid and unmodified for `'a`.
    pub unsafe fn from_raw(data: *const u8, size: usize) -> Self {
        if data.is_null() || size == 0 {
            return Self { bytes: &[] };
        }
        Self {
            bytes: unsafe { std::slice::from_raw_parts(data, size) },
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Deref for FuzzInput<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_parts_are_borrowed_verbatim() {
        let data: Vec<u8> = vec![1, 2, 3];
        let input = unsafe { FuzzInput::from_raw(data.as_ptr(), data.len()) };
        assert_eq!(input.as_bytes(), &[1, 2, 3]);
        assert_eq!(input.len(), 3);
        assert!(!input.is_empty());
    }

    #[test]
    fn null_pointer_is_the_empty_input() {
        let input = unsafe { FuzzInput::from_raw(std::ptr::null(), 16) };
        assert!(input.is_empty());
        assert_eq!(input.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn zero_size_ignores_the_pointer() {
        let data = [0xAAu8];
        let input = unsafe { FuzzInput::from_raw(data.as_ptr(), 0) };
        assert!(input.is_empty());
    }
}
