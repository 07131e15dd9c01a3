use sfm_core::Real;

/// Robust loss kernels for iteratively re-weighted least squares (IRLS).
#[derive(Debug, Clone, Copy, Default)]
pub enum RobustKernel {
    /// Plain L2.
    #[default]
    None,
    /// Huber loss with a given threshold.
    Huber { delta: Real },
    /// Cauchy loss with a scale parameter.
    Cauchy { c: Real },
}

impl RobustKernel {
    /// Return the robust loss `rho(r^2)` and the IRLS weight `w(r)` for a squared residual.
    ///
    /// Used by the averaging solvers: evaluate residuals, compute weights,
    /// then solve the weighted linear problem again.
    pub fn rho_and_weight(self, r2: Real) -> (Real, Real) {
        match self {
            RobustKernel::None => (r2, 1.0),
            RobustKernel::Huber { delta } => {
                let r = r2.sqrt();
                if r <= delta {
                    (r2, 1.0)
                } else {
                    (2.0 * delta * r - delta * delta, delta / r)
                }
            }
            RobustKernel::Cauchy { c } => {
                let t = r2 / (c * c);
                (c * c * (1.0 + t).ln(), 1.0 / (1.0 + t))
            }
        }
    }

    /// IRLS weight only.
    pub fn weight(self, r2: Real) -> Real {
        self.rho_and_weight(r2).1
    }
}
