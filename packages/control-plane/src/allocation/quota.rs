// packages/control-plane/src/allocation/quota.rs
//! Resource quota arithmetic
//!
//! A quota is a vector of resource amounts used for three things:
//! - agent capacity (`total`)
//! - task demand (`required`)
//! - tenant limits
//!
//! Dimensions: CPU cores, memory (MB), GPUs, storage (GB), network (Mbps),
//! plus arbitrary named extras. A dimension missing from `custom` counts as 0.

use crate::utils::errors::{ControlPlaneError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, Sub};

/// Absorbs float rounding in containment checks
const EPSILON: f64 = 1e-9;

/// Vector of resource amounts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuota {
    /// CPU cores (fractional allowed)
    pub cpu_cores: f64,

    /// Memory in megabytes
    pub memory_mb: f64,

    /// Whole or shared GPUs
    pub gpu_count: f64,

    /// Storage in gigabytes
    pub storage_gb: f64,

    /// Network bandwidth in Mbps
    pub network_mbps: f64,

    /// Named extras (e.g. "licenses", "tpu")
    pub custom: BTreeMap<String, f64>,
}

impl ResourceQuota {
    /// Quota with every dimension at zero
    pub fn zero() -> Self {
        Self::default()
    }

    /// CPU + memory quota, the common case
    pub fn cpu_mem(cpu_cores: f64, memory_mb: f64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            ..Default::default()
        }
    }

    pub fn with_gpus(mut self, gpu_count: f64) -> Self {
        self.gpu_count = gpu_count;
        self
    }

    pub fn with_storage(mut self, storage_gb: f64) -> Self {
        self.storage_gb = storage_gb;
        self
    }

    pub fn with_network(mut self, network_mbps: f64) -> Self {
        self.network_mbps = network_mbps;
        self
    }

    pub fn with_custom(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.custom.insert(name.into(), amount);
        self
    }

    /// True when every dimension of `self` is `<=` the matching dimension of `limit`
    pub fn fits_within(&self, limit: &ResourceQuota) -> bool {
        let fits = |need: f64, have: f64| need <= have + EPSILON;

        fits(self.cpu_cores, limit.cpu_cores)
            && fits(self.memory_mb, limit.memory_mb)
            && fits(self.gpu_count, limit.gpu_count)
            && fits(self.storage_gb, limit.storage_gb)
            && fits(self.network_mbps, limit.network_mbps)
            && self
                .custom
                .iter()
                .all(|(name, need)| fits(*need, limit.custom.get(name).copied().unwrap_or(0.0)))
    }

    /// True when every dimension is (near) zero
    pub fn is_zero(&self) -> bool {
        self.fits_within(&Self::zero())
    }

    /// Reject negative or non-finite amounts
    pub fn validate(&self) -> Result<()> {
        let check = |name: &str, value: f64| -> Result<()> {
            if !value.is_finite() {
                return Err(ControlPlaneError::ValidationFailed(format!(
                    "{} must be finite",
                    name
                )));
            }
            if value < 0.0 {
                return Err(ControlPlaneError::ValidationFailed(format!(
                    "{} cannot be negative ({})",
                    name, value
                )));
            }
            Ok(())
        };

        check("cpu_cores", self.cpu_cores)?;
        check("memory_mb", self.memory_mb)?;
        check("gpu_count", self.gpu_count)?;
        check("storage_gb", self.storage_gb)?;
        check("network_mbps", self.network_mbps)?;
        for (name, value) in &self.custom {
            check(name, *value)?;
        }
        Ok(())
    }

    /// Ratio of `self.cpu_cores` to `total.cpu_cores` (0 when total is 0)
    pub fn cpu_ratio(&self, total: &ResourceQuota) -> f64 {
        if total.cpu_cores <= 0.0 {
            0.0
        } else {
            self.cpu_cores / total.cpu_cores
        }
    }

    /// Ratio of `self.memory_mb` to `total.memory_mb` (0 when total is 0)
    pub fn memory_ratio(&self, total: &ResourceQuota) -> f64 {
        if total.memory_mb <= 0.0 {
            0.0
        } else {
            self.memory_mb / total.memory_mb
        }
    }

    fn combine(&self, other: &ResourceQuota, op: impl Fn(f64, f64) -> f64) -> ResourceQuota {
        let mut custom = self.custom.clone();
        for (name, amount) in &other.custom {
            let entry = custom.entry(name.clone()).or_insert(0.0);
            *entry = op(*entry, *amount);
        }

        ResourceQuota {
            cpu_cores: op(self.cpu_cores, other.cpu_cores),
            memory_mb: op(self.memory_mb, other.memory_mb),
            gpu_count: op(self.gpu_count, other.gpu_count),
            storage_gb: op(self.storage_gb, other.storage_gb),
            network_mbps: op(self.network_mbps, other.network_mbps),
            custom,
        }
    }
}

impl Add for &ResourceQuota {
    type Output = ResourceQuota;

    fn add(self, other: &ResourceQuota) -> ResourceQuota {
        self.combine(other, |a, b| a + b)
    }
}

impl Add for ResourceQuota {
    type Output = ResourceQuota;

    fn add(self, other: ResourceQuota) -> ResourceQuota {
        &self + &other
    }
}

/// Component-wise subtraction, floored at zero
impl Sub for &ResourceQuota {
    type Output = ResourceQuota;

    fn sub(self, other: &ResourceQuota) -> ResourceQuota {
        self.combine(other, |a, b| (a - b).max(0.0))
    }
}

impl Sub for ResourceQuota {
    type Output = ResourceQuota;

    fn sub(self, other: ResourceQuota) -> ResourceQuota {
        &self - &other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_add_and_subtract() {
        let a = ResourceQuota::cpu_mem(4.0, 8192.0).with_custom("licenses", 2.0);
        let b = ResourceQuota::cpu_mem(1.5, 1024.0).with_gpus(1.0);

        let sum = &a + &b;
        assert_eq!(sum.cpu_cores, 5.5);
        assert_eq!(sum.memory_mb, 9216.0);
        assert_eq!(sum.gpu_count, 1.0);
        assert_eq!(sum.custom.get("licenses"), Some(&2.0));

        let back = &sum - &b;
        assert_eq!(back.cpu_cores, 4.0);
        assert_eq!(back.memory_mb, 8192.0);
        assert_eq!(back.gpu_count, 0.0);
    }

    #[test]
    fn test_subtract_never_negative() {
        let small = ResourceQuota::cpu_mem(1.0, 100.0);
        let big = ResourceQuota::cpu_mem(3.0, 50.0);
        let diff = &small - &big;
        assert_eq!(diff.cpu_cores, 0.0);
        assert_eq!(diff.memory_mb, 50.0);
    }

    #[test]
    fn test_fits_within() {
        let limit = ResourceQuota::cpu_mem(4.0, 8192.0);
        assert!(ResourceQuota::cpu_mem(4.0, 8192.0).fits_within(&limit));
        assert!(ResourceQuota::cpu_mem(0.5, 10.0).fits_within(&limit));
        assert!(!ResourceQuota::cpu_mem(4.5, 10.0).fits_within(&limit));
        assert!(!ResourceQuota::cpu_mem(1.0, 10.0).with_gpus(1.0).fits_within(&limit));
    }

    #[test]
    fn test_custom_dimension_missing_from_limit_is_zero() {
        let limit = ResourceQuota::cpu_mem(4.0, 8192.0);
        let need = ResourceQuota::zero().with_custom("tpu", 1.0);
        assert!(!need.fits_within(&limit));
        assert!(need.fits_within(&limit.clone().with_custom("tpu", 1.0)));
    }

    #[test]
    fn test_float_rounding_tolerated() {
        let limit = ResourceQuota::cpu_mem(0.3, 0.0);
        let need = &ResourceQuota::cpu_mem(0.1, 0.0) + &ResourceQuota::cpu_mem(0.2, 0.0);
        assert!(need.fits_within(&limit));
    }

    #[test]
    fn test_validation() {
        assert!(ResourceQuota::cpu_mem(2.0, 512.0).validate().is_ok());
        assert!(ResourceQuota::cpu_mem(-1.0, 512.0).validate().is_err());
        assert!(ResourceQuota::cpu_mem(f64::NAN, 512.0).validate().is_err());
        assert!(ResourceQuota::zero().with_custom("x", -0.5).validate().is_err());
    }

    #[test]
    fn test_ratios() {
        let total = ResourceQuota::cpu_mem(4.0, 1000.0);
        let used = ResourceQuota::cpu_mem(1.0, 250.0);
        assert_eq!(used.cpu_ratio(&total), 0.25);
        assert_eq!(used.memory_ratio(&total), 0.25);
        assert_eq!(used.cpu_ratio(&ResourceQuota::zero()), 0.0);
    }

    proptest! {
        #[test]
        fn prop_add_then_sub_restores(
            cpu in 0.0f64..64.0, mem in 0.0f64..65536.0,
            dcpu in 0.0f64..64.0, dmem in 0.0f64..65536.0,
        ) {
            let base = ResourceQuota::cpu_mem(cpu, mem);
            let delta = ResourceQuota::cpu_mem(dcpu, dmem);
            let restored = &(&base + &delta) - &delta;
            prop_assert!((restored.cpu_cores - cpu).abs() < 1e-6);
            prop_assert!((restored.memory_mb - mem).abs() < 1e-6);
        }

        #[test]
        fn prop_sum_fits_iff_parts_fit_remaining(
            used in 0.0f64..8.0, need in 0.0f64..8.0,
        ) {
            let total = ResourceQuota::cpu_mem(8.0, 0.0);
            let allocated = ResourceQuota::cpu_mem(used, 0.0);
            let required = ResourceQuota::cpu_mem(need, 0.0);
            let available = &total - &allocated;
            prop_assert_eq!(
                required.fits_within(&available),
                (&allocated + &required).fits_within(&total)
            );
        }
    }
}
