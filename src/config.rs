use serde::{Deserialize, Serialize};

use crate::discoverer::{Discoverer, DiscovererOptions, StaticDiscoverer};
use crate::kubernetes;
use crate::target::TargetGroup;

/// A provider configuration, one variant per discovery mechanism.
///
/// Structural equality drives provider sharing: when two jobs carry
/// value-equal configurations, a single provider instance serves both.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Config {
    Static(StaticConfig),
    Kubernetes(kubernetes::Config),
}

impl Config {
    /// The name of the discovery mechanism.
    pub fn name(&self) -> &'static str {
        match self {
            Config::Static(_) => "static",
            Config::Kubernetes(_) => "kubernetes",
        }
    }

    /// Build the provider described by this configuration.
    pub fn new_discoverer(&self, opts: DiscovererOptions) -> crate::Result<Box<dyn Discoverer>> {
        match self {
            Config::Static(config) => Ok(Box::new(StaticDiscoverer::new(config.groups.clone()))),
            Config::Kubernetes(config) => {
                Ok(Box::new(kubernetes::Discovery::new(config, opts)?))
            }
        }
    }
}

/// A fixed list of target groups.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub groups: Vec<TargetGroup>,
}

impl StaticConfig {
    /// A single empty group, which forces consumers to refresh the scrape
    /// pool of a job that ended up with no working provider.
    pub fn empty_group() -> Self {
        StaticConfig {
            groups: vec![TargetGroup::default()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(Config::Static(StaticConfig::default()).name(), "static");
        assert_eq!(
            Config::Kubernetes(kubernetes::Config::default()).name(),
            "kubernetes"
        );
    }

    #[test]
    fn value_equality() {
        let a = Config::Static(StaticConfig::empty_group());
        let b = Config::Static(StaticConfig::empty_group());
        let c = Config::Static(StaticConfig::default());

        assert_eq!(a, b);
        assert_ne!(a, c);

        let k1 = Config::Kubernetes(kubernetes::Config {
            api_server: Some("https://localhost:6443".into()),
            ..Default::default()
        });
        let k2 = Config::Kubernetes(kubernetes::Config::default());
        assert_ne!(k1, k2);
    }

    #[test]
    fn deserialize_tagged() {
        let config = serde_json::from_str::<Config>(
            r#"{"type": "kubernetes", "role": "pod", "api_server": "https://localhost:6443"}"#,
        )
        .unwrap();

        assert_eq!(config.name(), "kubernetes");
    }
}
