use crate::config::AgentConfig;

/// Names of the partitions owned by one agent version.
///
/// Every name is `{prefix}-{kind}-{version}`, so a version change produces a
/// disjoint set and activation can drop everything else under the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  prefix: String,
  version: String,
  pub static_assets: String,
  pub api_responses: String,
  pub image_assets: String,
}

impl PartitionNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      version: version.to_string(),
      static_assets: format!("{}-static-{}", prefix, version),
      api_responses: format!("{}-api-{}", prefix, version),
      image_assets: format!("{}-images-{}", prefix, version),
    }
  }

  pub fn from_config(config: &AgentConfig) -> Self {
    Self::new(&config.cache_prefix, &config.version)
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn all(&self) -> [&str; 3] {
    [&self.static_assets, &self.api_responses, &self.image_assets]
  }

  /// Belongs to this version.
  pub fn is_current(&self, name: &str) -> bool {
    self.all().contains(&name)
  }

  /// Created by some version of this agent.
  pub fn is_managed(&self, name: &str) -> bool {
    name.starts_with(&format!("{}-", self.prefix))
  }

  /// Version embedded in a managed partition name.
  pub fn version_of<'a>(&self, name: &'a str) -> Option<&'a str> {
    let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
    ["static-", "api-", "images-"]
      .iter()
      .find_map(|kind| rest.strip_prefix(kind))
      .filter(|version| !version.is_empty())
  }
}
