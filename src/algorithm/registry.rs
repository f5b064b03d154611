//! Algorithm registry - Static map from configured kind to constructor

use super::bandwagon;
use super::runtime::{AlgorithmRuntime, RuntimeServices};
use crate::core::config::AlgorithmConfig;
use crate::core::{Error, Result};

pub type Constructor = fn(&AlgorithmConfig, RuntimeServices) -> Result<Box<dyn AlgorithmRuntime>>;

static ALGORITHMS: &[(&str, Constructor)] = &[("bandwagon", bandwagon::build)];

pub fn lookup(kind: &str) -> Option<Constructor> {
    ALGORITHMS
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, constructor)| *constructor)
}

pub fn kinds() -> impl Iterator<Item = &'static str> {
    ALGORITHMS.iter().map(|(name, _)| *name)
}

/// Build the runtime for one configured algorithm
pub fn build(config: &AlgorithmConfig, services: RuntimeServices) -> Result<Box<dyn AlgorithmRuntime>> {
    let constructor = lookup(&config.kind).ok_or_else(|| {
        Error::Config(format!(
            "Unknown algorithm kind '{}' (known: {})",
            config.kind,
            kinds().collect::<Vec<_>>().join(", ")
        ))
    })?;
    constructor(config, services)
}
