//! Concrete kernel implementations and their shared parameters.
use num::Float;
use num_complex::Complex;

pub mod laplace;

/// Global numeric parameters consumed by kernel implementations, passed as
/// plain values at construction instead of process-wide mutable state.
#[derive(Debug, Clone, Copy)]
pub struct KernelParams<T>
where
    T: Float,
{
    /// Softening term added to squared distances; zero for an unsoftened
    /// kernel.
    pub eps2: T,

    /// Complex wavenumber, consumed by oscillatory (Helmholtz-like) kernel
    /// implementations and ignored by the rest.
    pub wavek: Complex<T>,
}

impl<T> Default for KernelParams<T>
where
    T: Float,
{
    fn default() -> Self {
        KernelParams {
            eps2: T::zero(),
            wavek: Complex::new(T::zero(), T::zero()),
        }
    }
}
