//! Builder for the single-process FMM facade.
use num::Float;

use crate::fmm::types::{Fmm, FmmParameters};
use crate::traits::kernel::Kernel;

/// Assembles an [`Fmm`] from a parameter set and a kernel, validating the
/// configuration before any allocation or tree work.
pub struct FmmBuilder<T, K>
where
    T: Float,
{
    params: Option<FmmParameters<T>>,
    kernel: Option<K>,
}

impl<T, K> Default for FmmBuilder<T, K>
where
    T: Float + Send + Sync,
    K: Kernel<T>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> FmmBuilder<T, K>
where
    T: Float + Send + Sync,
    K: Kernel<T>,
{
    /// An empty builder.
    pub fn new() -> Self {
        FmmBuilder {
            params: None,
            kernel: None,
        }
    }

    /// Validate and attach the configuration surface.
    pub fn parameters(mut self, params: FmmParameters<T>) -> Result<Self, std::io::Error> {
        if params.ncrit == 0 {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "leaf size limit (ncrit) must be positive",
            ))
        } else if params.nspawn == 0 {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "fan-out threshold (nspawn) must be positive",
            ))
        } else if !params.theta.is_finite() {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "opening angle must be finite",
            ))
        } else if params.images > 0 && params.cycle.iter().any(|&c| c <= T::zero()) {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "periodic cycle must be positive in every axis",
            ))
        } else if params.mutual && params.images > 0 {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "mutual interaction is only valid without periodic images",
            ))
        } else {
            self.params = Some(params);
            Ok(self)
        }
    }

    /// Attach the kernel.
    pub fn kernel(mut self, kernel: K) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Finish the build. Fails if either the parameters or the kernel are
    /// missing.
    pub fn build(self) -> Result<Fmm<T, K>, std::io::Error> {
        let params = self.params.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "parameters must be supplied before building",
            )
        })?;
        let kernel = self.kernel.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "a kernel must be supplied before building",
            )
        })?;
        Ok(Fmm {
            kernel,
            params,
            buffer: Vec::new(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::laplace::LaplaceKernel;
    use crate::kernel::KernelParams;

    fn kernel() -> LaplaceKernel<f64> {
        LaplaceKernel::new(4, KernelParams::default()).unwrap()
    }

    #[test]
    fn test_invalid_configurations_rejected_eagerly() {
        let bad_ncrit = FmmParameters::<f64> {
            ncrit: 0,
            ..FmmParameters::default()
        };
        assert!(FmmBuilder::<f64, LaplaceKernel<f64>>::new()
            .parameters(bad_ncrit)
            .is_err());

        let bad_mutual = FmmParameters::<f64> {
            mutual: true,
            images: 1,
            ..FmmParameters::default()
        };
        assert!(FmmBuilder::<f64, LaplaceKernel<f64>>::new()
            .parameters(bad_mutual)
            .is_err());

        let bad_cycle = FmmParameters::<f64> {
            images: 1,
            cycle: [1.0, -1.0, 1.0],
            ..FmmParameters::default()
        };
        assert!(FmmBuilder::<f64, LaplaceKernel<f64>>::new()
            .parameters(bad_cycle)
            .is_err());
    }

    #[test]
    fn test_missing_pieces_rejected() {
        assert!(FmmBuilder::<f64, LaplaceKernel<f64>>::new().build().is_err());
        assert!(FmmBuilder::<f64, LaplaceKernel<f64>>::new()
            .parameters(FmmParameters::<f64>::default())
            .unwrap()
            .build()
            .is_err());
        assert!(FmmBuilder::new()
            .parameters(FmmParameters::<f64>::default())
            .unwrap()
            .kernel(kernel())
            .build()
            .is_ok());
    }

    #[test]
    fn test_theta_zero_is_accepted() {
        // Degrades to direct evaluation rather than failing.
        let params = FmmParameters::<f64> {
            theta: 0.0,
            ..FmmParameters::default()
        };
        assert!(FmmBuilder::new()
            .parameters(params)
            .unwrap()
            .kernel(kernel())
            .build()
            .is_ok());
    }
}
