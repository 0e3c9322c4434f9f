/// Array of N1 + N2 elements with uniform access
///
/// This is a workaround for [T; {N1 + N2}] in stable rust
#[repr(C)]
pub struct DuplexArray<T, const N1: usize, const N2: usize>([T; N1], [T; N2]);

impl<T, const N1: usize, const N2: usize> DuplexArray<T, N1, N2> {
    #[allow(clippy::redundant_closure)]
    pub fn from_fn(mut cb: impl FnMut(usize) -> T) -> Self {
        Self(
            core::array::from_fn(|i| cb(i)),
            core::array::from_fn(|i| cb(N1 + i)),
        )
    }
}

impl<T, const N1: usize, const N2: usize> core::ops::Deref for DuplexArray<T, N1, N2> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        // SAFETY: DuplexArray is #[repr(C)] so the two arrays are laid out contiguously
        unsafe { core::slice::from_raw_parts(self.0.as_ptr(), N1 + N2) }
    }
}

impl<T, const N1: usize, const N2: usize> core::ops::DerefMut for DuplexArray<T, N1, N2> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: DuplexArray is #[repr(C)] so the two arrays are laid out contiguously
        unsafe { core::slice::from_raw_parts_mut(self.0.as_mut_ptr(), N1 + N2) }
    }
}
