//! Resource shape arithmetic.

use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// A resource shape: memory and virtual cores.
///
/// Every comparison is component-wise: a shape fits inside another only when
/// both dimensions fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    /// The empty shape.
    pub const ZERO: Self = Self {
        memory_mb: 0,
        vcores: 0,
    };

    pub const fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }

    pub fn is_zero(&self) -> bool {
        self.memory_mb == 0 && self.vcores == 0
    }

    /// Returns true when `self` fits inside `other` in every dimension.
    pub fn fits_in(&self, other: &Resource) -> bool {
        self.memory_mb <= other.memory_mb && self.vcores <= other.vcores
    }

    /// Component-wise subtraction, `None` if any dimension would underflow.
    pub fn checked_sub(&self, other: &Resource) -> Option<Resource> {
        Some(Resource {
            memory_mb: self.memory_mb.checked_sub(other.memory_mb)?,
            vcores: self.vcores.checked_sub(other.vcores)?,
        })
    }

    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &Resource) -> Resource {
        Resource {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            vcores: self.vcores.saturating_sub(other.vcores),
        }
    }

    /// Component-wise addition clamped at the maximum.
    pub fn saturating_add(&self, other: &Resource) -> Resource {
        Resource {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            vcores: self.vcores.saturating_add(other.vcores),
        }
    }

    /// `count` copies of this shape, clamped at the maximum.
    pub fn saturating_times(&self, count: u32) -> Resource {
        Resource {
            memory_mb: self.memory_mb.saturating_mul(u64::from(count)),
            vcores: self.vcores.saturating_mul(count),
        }
    }

    /// Scales both dimensions by `percent / 100`, rounding down.
    pub fn percent(&self, percent: u32) -> Resource {
        Resource {
            memory_mb: self.memory_mb * u64::from(percent) / 100,
            vcores: (u64::from(self.vcores) * u64::from(percent) / 100) as u32,
        }
    }

    /// Dominant share of `self` relative to `total`.
    ///
    /// Dimensions where `total` is zero are skipped; an empty total yields 0.
    pub fn dominant_share(&self, total: &Resource) -> f64 {
        let mut share: f64 = 0.0;
        if total.memory_mb > 0 {
            share = share.max(self.memory_mb as f64 / total.memory_mb as f64);
        }
        if total.vcores > 0 {
            share = share.max(f64::from(self.vcores) / f64::from(total.vcores));
        }
        share
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        Resource {
            memory_mb: self.memory_mb + rhs.memory_mb,
            vcores: self.vcores + rhs.vcores,
        }
    }
}

impl AddAssign for Resource {
    fn add_assign(&mut self, rhs: Resource) {
        *self = *self + rhs;
    }
}

impl Sub for Resource {
    type Output = Resource;

    /// Saturating; use [`Resource::checked_sub`] when underflow matters.
    fn sub(self, rhs: Resource) -> Resource {
        self.saturating_sub(&rhs)
    }
}

impl std::iter::Sum for Resource {
    fn sum<I: Iterator<Item = Resource>>(iter: I) -> Resource {
        iter.fold(Resource::ZERO, Add::add)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<memory:{}MB, vcores:{}>", self.memory_mb, self.vcores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_in_is_component_wise() {
        let node = Resource::new(4096, 4);
        assert!(Resource::new(4096, 4).fits_in(&node));
        assert!(!Resource::new(1024, 8).fits_in(&node));
        assert!(!Resource::new(8192, 1).fits_in(&node));
    }

    #[test]
    fn test_checked_sub_underflow() {
        let a = Resource::new(1024, 1);
        assert_eq!(a.checked_sub(&Resource::new(2048, 1)), None);
        assert_eq!(
            a.checked_sub(&Resource::new(512, 1)),
            Some(Resource::new(512, 0))
        );
    }

    #[test]
    fn test_percent_and_dominant_share() {
        let total = Resource::new(10_000, 10);
        assert_eq!(total.percent(30), Resource::new(3000, 3));
        let used = Resource::new(2500, 5);
        assert!((used.dominant_share(&total) - 0.5).abs() < f64::EPSILON);
        assert_eq!(used.dominant_share(&Resource::ZERO), 0.0);
    }

    #[test]
    fn test_saturating_times_and_add() {
        let huge = Resource::new(u64::MAX / 2, u32::MAX / 2);
        assert_eq!(huge.saturating_times(4), Resource::new(u64::MAX, u32::MAX));
        assert_eq!(
            Resource::new(1024, 1).saturating_times(3),
            Resource::new(3072, 3)
        );
        assert_eq!(
            huge.saturating_add(&huge).saturating_add(&huge),
            Resource::new(u64::MAX, u32::MAX)
        );
    }

    #[test]
    fn test_sum() {
        let total: Resource = vec![Resource::new(1, 1), Resource::new(2, 3)]
            .into_iter()
            .sum();
        assert_eq!(total, Resource::new(3, 4));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn resource() -> impl Strategy<Value = Resource> {
            (0u64..1 << 20, 0u32..256).prop_map(|(m, v)| Resource::new(m, v))
        }

        proptest! {
            #[test]
            fn checked_sub_agrees_with_fits_in(a in resource(), b in resource()) {
                prop_assert_eq!(b.checked_sub(&a).is_some(), a.fits_in(&b));
            }

            #[test]
            fn sub_undoes_add(a in resource(), b in resource()) {
                prop_assert_eq!((a + b).checked_sub(&b), Some(a));
            }
        }
    }
}
