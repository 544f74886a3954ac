use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use pkg_types::pod::{PlacementSpec, SpotPolicy};
use pkg_types::resource::ResourceSpec;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no instance type satisfies cpu={cpu:?} memory={memory:?} gpu={gpu} spot={spot:?}")]
    NoMatchingSku {
        cpu: Option<f64>,
        memory: Option<f64>,
        gpu: u32,
        spot: SpotPolicy,
    },
    #[error("unknown instance type {0}")]
    UnknownInstanceType(String),
}

/// One cloud instance type with its capacities and hourly price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sku {
    pub instance_type: String,
    /// On-demand hourly price in USD.
    pub price: f64,
    /// vCPU count; fractional for shared-core types.
    pub cpu: f64,
    pub memory_gib: f64,
    #[serde(default)]
    pub gpus: u32,
    /// Burstable / shared-CPU family (e.g. AWS T-types).
    #[serde(default)]
    pub burstable: bool,
    /// Spot capacity exists for this type.
    #[serde(default)]
    pub spot: bool,
    /// AZs offering this type. Empty means every AZ in the region.
    #[serde(default)]
    pub availability_zones: Vec<String>,
}

/// Picks the cheapest instance type whose capacities satisfy a pod's
/// resource requirements, subject to spot, dedicated-CPU, and placement
/// constraints.
#[derive(Debug, Clone)]
pub struct InstanceSelector {
    skus: Vec<Sku>,
}

impl InstanceSelector {
    pub fn new(skus: Vec<Sku>) -> Self {
        Self { skus }
    }

    /// Ranked candidate instance types for the given requirements, cheapest
    /// first, price ties broken by smaller memory then smaller cpu.
    pub fn select(
        &self,
        resources: &ResourceSpec,
        spot: SpotPolicy,
        placement: &PlacementSpec,
    ) -> Result<Vec<String>, SelectionError> {
        let want_cpu = resources.cpu_cores();
        let want_memory = resources.memory_gib();
        let want_gpu = resources.gpu_count();

        let mut survivors: Vec<&Sku> = self
            .skus
            .iter()
            .filter(|sku| {
                if let Some(cpu) = want_cpu {
                    if sku.cpu < cpu {
                        return false;
                    }
                }
                if let Some(memory) = want_memory {
                    if sku.memory_gib < memory {
                        return false;
                    }
                }
                if want_gpu > 0 && sku.gpus < want_gpu {
                    return false;
                }
                if resources.dedicated_cpu && sku.burstable {
                    return false;
                }
                if spot == SpotPolicy::Always && !sku.spot {
                    return false;
                }
                if !placement.availability_zone.is_empty()
                    && !sku.availability_zones.is_empty()
                    && !sku
                        .availability_zones
                        .contains(&placement.availability_zone)
                {
                    return false;
                }
                true
            })
            .collect();

        if survivors.is_empty() {
            return Err(SelectionError::NoMatchingSku {
                cpu: want_cpu,
                memory: want_memory,
                gpu: want_gpu,
                spot,
            });
        }

        survivors.sort_by(|a, b| {
            a.price
                .total_cmp(&b.price)
                .then(a.memory_gib.total_cmp(&b.memory_gib))
                .then(a.cpu.total_cmp(&b.cpu))
        });

        let ranked: Vec<String> = survivors
            .iter()
            .map(|sku| sku.instance_type.clone())
            .collect();
        debug!("Selected instance types {:?} for {:?}", ranked, resources);
        Ok(ranked)
    }

    /// Validate an explicitly requested instance type against the catalog.
    pub fn validate(&self, instance_type: &str) -> Result<(), SelectionError> {
        if self.lookup(instance_type).is_some() {
            Ok(())
        } else {
            Err(SelectionError::UnknownInstanceType(
                instance_type.to_string(),
            ))
        }
    }

    /// Candidate instance types for a pod. An explicit instance type
    /// bypasses selection but is still validated.
    pub fn resolve(
        &self,
        instance_type: &str,
        resources: &ResourceSpec,
        spot: SpotPolicy,
        placement: &PlacementSpec,
    ) -> Result<Vec<String>, SelectionError> {
        if !instance_type.is_empty() {
            self.validate(instance_type)?;
            return Ok(vec![instance_type.to_string()]);
        }
        self.select(resources, spot, placement)
    }

    pub fn lookup(&self, instance_type: &str) -> Option<&Sku> {
        self.skus.iter().find(|s| s.instance_type == instance_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sku(instance_type: &str, price: f64, cpu: f64, memory_gib: f64) -> Sku {
        Sku {
            instance_type: instance_type.to_string(),
            price,
            cpu,
            memory_gib,
            gpus: 0,
            burstable: false,
            spot: true,
            availability_zones: vec![],
        }
    }

    fn make_selector() -> InstanceSelector {
        InstanceSelector::new(vec![
            Sku {
                burstable: true,
                ..make_sku("t3.micro", 0.0104, 2.0, 1.0)
            },
            Sku {
                burstable: true,
                ..make_sku("t3.small", 0.0208, 2.0, 2.0)
            },
            make_sku("m5.large", 0.096, 2.0, 8.0),
            make_sku("c5.large", 0.085, 2.0, 4.0),
            Sku {
                spot: false,
                gpus: 1,
                ..make_sku("p2.xlarge", 0.90, 4.0, 61.0)
            },
        ])
    }

    fn resources(cpu: &str, memory: &str) -> ResourceSpec {
        ResourceSpec {
            cpu: cpu.to_string(),
            memory: memory.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cheapest_first() {
        let selector = make_selector();
        let ranked = selector
            .select(
                &resources("2", "1Gi"),
                SpotPolicy::Never,
                &PlacementSpec::default(),
            )
            .unwrap();
        assert_eq!(ranked[0], "t3.micro");
    }

    #[test]
    fn test_fractional_cpu_request() {
        let selector = make_selector();
        let ranked = selector
            .select(
                &resources("0.5", ""),
                SpotPolicy::Never,
                &PlacementSpec::default(),
            )
            .unwrap();
        assert!(!ranked.is_empty());
    }

    #[test]
    fn test_dedicated_cpu_excludes_burstable() {
        let selector = make_selector();
        let ranked = selector
            .select(
                &ResourceSpec {
                    cpu: "2".to_string(),
                    memory: "1Gi".to_string(),
                    dedicated_cpu: true,
                    ..Default::default()
                },
                SpotPolicy::Never,
                &PlacementSpec::default(),
            )
            .unwrap();
        assert_eq!(ranked[0], "c5.large");
        assert!(!ranked.contains(&"t3.micro".to_string()));
    }

    #[test]
    fn test_gpu_requirement() {
        let selector = make_selector();
        let ranked = selector
            .select(
                &ResourceSpec {
                    gpu: "1".to_string(),
                    ..Default::default()
                },
                SpotPolicy::Never,
                &PlacementSpec::default(),
            )
            .unwrap();
        assert_eq!(ranked, vec!["p2.xlarge".to_string()]);
    }

    #[test]
    fn test_spot_always_with_no_spot_capable_sku() {
        let selector = make_selector();
        // Only the GPU type satisfies this request, and it has no spot capacity
        let err = selector
            .select(
                &ResourceSpec {
                    gpu: "1".to_string(),
                    ..Default::default()
                },
                SpotPolicy::Always,
                &PlacementSpec::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SelectionError::NoMatchingSku { .. }));
    }

    #[test]
    fn test_placement_filter() {
        let selector = InstanceSelector::new(vec![
            Sku {
                availability_zones: vec!["us-east-1a".to_string()],
                ..make_sku("a.large", 0.10, 2.0, 4.0)
            },
            Sku {
                availability_zones: vec!["us-east-1b".to_string()],
                ..make_sku("b.large", 0.05, 2.0, 4.0)
            },
        ]);
        let ranked = selector
            .select(
                &resources("1", "1Gi"),
                SpotPolicy::Never,
                &PlacementSpec {
                    availability_zone: "us-east-1a".to_string(),
                },
            )
            .unwrap();
        assert_eq!(ranked, vec!["a.large".to_string()]);
    }

    #[test]
    fn test_price_tie_broken_by_memory_then_cpu() {
        let selector = InstanceSelector::new(vec![
            make_sku("big", 0.10, 4.0, 16.0),
            make_sku("small", 0.10, 2.0, 8.0),
            make_sku("wide", 0.10, 8.0, 8.0),
        ]);
        let ranked = selector
            .select(
                &resources("1", "1Gi"),
                SpotPolicy::Never,
                &PlacementSpec::default(),
            )
            .unwrap();
        assert_eq!(ranked, vec!["small", "wide", "big"]);
    }

    #[test]
    fn test_explicit_type_bypasses_selection() {
        let selector = make_selector();
        let ranked = selector
            .resolve(
                "m5.large",
                &resources("64", "512Gi"),
                SpotPolicy::Never,
                &PlacementSpec::default(),
            )
            .unwrap();
        assert_eq!(ranked, vec!["m5.large".to_string()]);
        assert!(selector
            .resolve(
                "no-such-type",
                &ResourceSpec::default(),
                SpotPolicy::Never,
                &PlacementSpec::default(),
            )
            .is_err());
    }
}
