//! Resource footprints and capacities.

use std::iter::Sum;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// CPU, memory and GPU memory, either as a requirement or as a capacity.
///
/// Comparisons are component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default, alias = "gpu_memory")]
    pub gpu_memory: f64,
}

impl Resource {
    pub const ZERO: Resource = Resource::new(0.0, 0.0, 0.0);

    pub const fn new(cpu: f64, memory: f64, gpu_memory: f64) -> Self {
        Self {
            cpu,
            memory,
            gpu_memory,
        }
    }

    /// True when every component of `self` is at most the matching
    /// component of `capacity`.
    pub fn fits_within(&self, capacity: &Resource) -> bool {
        self.cpu <= capacity.cpu
            && self.memory <= capacity.memory
            && self.gpu_memory <= capacity.gpu_memory
    }

    /// Component-wise subtraction, floored at zero.
    pub fn saturating_sub(&self, other: &Resource) -> Resource {
        Resource {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            gpu_memory: (self.gpu_memory - other.gpu_memory).max(0.0),
        }
    }

    /// True when all components are finite and non-negative.
    pub fn is_valid(&self) -> bool {
        [self.cpu, self.memory, self.gpu_memory]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        Resource {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            gpu_memory: self.gpu_memory + rhs.gpu_memory,
        }
    }
}

impl Sum for Resource {
    fn sum<I: Iterator<Item = Resource>>(iter: I) -> Self {
        iter.fold(Resource::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Resource> for Resource {
    fn sum<I: Iterator<Item = &'a Resource>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} memory={} gpu_memory={}",
            self.cpu, self.memory, self.gpu_memory
        )
    }
}
