use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Settings file layer: supplies the listen interface and the zone
/// specs normally passed on the command line as repeated `-b`
/// flags (`zone-name:dataset-type:file1,file2,...`). CLI flags extend
/// this list rather than replacing it, mirroring how `Args` and this
/// file both contribute to the final configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub interface: Option<Ipv4Addr>,
    #[serde(default)]
    pub zones: Vec<String>,
}

impl Settings {
    pub fn new(filename: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(filename))
            .build()?
            .try_deserialize()
    }
}
