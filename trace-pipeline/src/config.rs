//! Pipeline configuration
//!
//! Loaded from a YAML file. Each stage receives its own options block and
//! parses it into a typed configuration.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

/// Default communication buffer address of the instrumented target
pub const DEFAULT_BUFFER_ADDRESS: u64 = 0xffff_ffff_8011_1020;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineConfig {
    /// Options of the test case generation stage
    pub testcase: serde_yaml::Value,
    /// Options of the trace generation stage
    pub trace: serde_yaml::Value,
    /// Continue with the next test case after a failed trace
    #[serde(default)]
    pub skip_failed: bool,
}

impl PipelineConfig {
    /// Load a configuration file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {:?}", path))?;
        Self::from_yaml_str(&text).with_context(|| format!("Invalid configuration {:?}", path))
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Parse a stage's options block into its typed configuration
pub fn parse_options<T: DeserializeOwned>(options: &serde_yaml::Value) -> Result<T> {
    Ok(serde_yaml::from_value(options.clone())?)
}

/// Options of the GDB trace generation stage
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GdbTraceConfig {
    /// Directory receiving `t{id}.trace` files
    pub output_directory: PathBuf,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Communication buffer address in target memory
    #[serde(default = "default_buffer_address", deserialize_with = "deserialize_address")]
    pub buffer_address: u64,
}

impl GdbTraceConfig {
    /// Default connection settings writing to `output_directory`
    pub fn new(output_directory: impl Into<PathBuf>) -> Self {
        Self {
            output_directory: output_directory.into(),
            host: default_host(),
            port: default_port(),
            buffer_address: DEFAULT_BUFFER_ADDRESS,
        }
    }
}

/// Options of the random test case generator
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RandomTestcaseConfig {
    /// Number of test cases to generate
    pub amount: u64,
    /// Length of each test case in bytes
    pub length: usize,
    /// Directory receiving `{n}.testcase` files
    pub output_directory: PathBuf,
    /// Fixed RNG seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_buffer_address() -> u64 {
    DEFAULT_BUFFER_ADDRESS
}

/// Accept an address as an integer or as a (hex) string
fn deserialize_address<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Address {
        Number(u64),
        Text(String),
    }

    match Address::deserialize(deserializer)? {
        Address::Number(n) => Ok(n),
        Address::Text(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
                None => s.replace('_', "").parse(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("invalid address {:?}: {}", s, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
skip-failed: true
testcase:
  amount: 10
  length: 16
  output-directory: work/testcases
trace:
  output-directory: work/traces
  host: 10.0.0.2
  port: 4321
  buffer-address: "0xffff_ffff_8011_1020"
"#;

    #[test]
    fn test_parse_example() {
        let config = PipelineConfig::from_yaml_str(EXAMPLE).unwrap();
        assert!(config.skip_failed);

        let trace: GdbTraceConfig = parse_options(&config.trace).unwrap();
        assert_eq!(trace.output_directory, PathBuf::from("work/traces"));
        assert_eq!(trace.host, "10.0.0.2");
        assert_eq!(trace.port, 4321);
        assert_eq!(trace.buffer_address, DEFAULT_BUFFER_ADDRESS);

        let testcase: RandomTestcaseConfig = parse_options(&config.testcase).unwrap();
        assert_eq!(testcase.amount, 10);
        assert_eq!(testcase.length, 16);
        assert_eq!(testcase.seed, None);
    }

    #[test]
    fn test_trace_defaults() {
        let options: serde_yaml::Value = serde_yaml::from_str("output-directory: traces").unwrap();
        let trace: GdbTraceConfig = parse_options(&options).unwrap();
        assert_eq!(trace, GdbTraceConfig::new("traces"));
    }

    #[test]
    fn test_numeric_buffer_address() {
        let options: serde_yaml::Value =
            serde_yaml::from_str("output-directory: t\nbuffer-address: 4096").unwrap();
        let trace: GdbTraceConfig = parse_options(&options).unwrap();
        assert_eq!(trace.buffer_address, 0x1000);
    }

    #[test]
    fn test_missing_output_directory() {
        let options: serde_yaml::Value = serde_yaml::from_str("host: localhost").unwrap();
        assert!(parse_options::<GdbTraceConfig>(&options).is_err());
    }

    #[test]
    fn test_bad_address() {
        let options: serde_yaml::Value =
            serde_yaml::from_str("output-directory: t\nbuffer-address: \"0xzz\"").unwrap();
        assert!(parse_options::<GdbTraceConfig>(&options).is_err());
    }
}
