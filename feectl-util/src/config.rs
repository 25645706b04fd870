use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use feectl::config::ControlConfig;
use feectl_client::{NodeClientConfig, WebhookConfig};
use serde::Deserialize;
use tracing::*;

use crate::env_var::{flag_var, parse_var, process_env, COOLDOWN_MINUTES, DRY_RUN, MAX_ATTEMPTS};
use crate::observability::LogConfig;

/// Default location of the configuration file, relative to the data directory
pub const DEFAULT_CONFIG_FILE: &str = "feectl.toml";

/// Everything read from the configuration file
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// The control plane tables (`[decision]`, `[validator]`, ...)
    #[serde(flatten)]
    pub control: ControlConfig,
    /// The `[node]` table
    pub node: Option<NodeClientConfig>,
    /// The `[webhook]` table
    pub webhook: Option<WebhookConfig>,
    /// The `[log]` table
    pub log: LogConfig,
}

/// Read a configuration file, apply environment overrides and check it
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<FileConfig> {
    let path = path.as_ref();
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = parse_config(&text, process_env)
        .with_context(|| format!("loading {}", path.display()))?;
    info!("loaded configuration from {}", path.display());
    Ok(config)
}

/// Parse configuration text, with `lookup` standing in for the environment
pub fn parse_config(text: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<FileConfig> {
    let mut config: FileConfig = toml::from_str(text)?;
    apply_overrides(&mut config.control, &lookup)?;
    config.control.check()?;
    config.log.level_filter().map_err(|e| anyhow!("[log] {}", e))?;
    Ok(config)
}

/// Apply the `FEECTL_*` overrides
pub fn apply_overrides(
    config: &mut ControlConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(dry_run) = flag_var(&lookup, DRY_RUN)? {
        if dry_run {
            warn!("{} set, no policy will be changed", DRY_RUN);
        }
        config.executor.dry_run = dry_run;
    }
    if let Some(attempts) = parse_var(&lookup, MAX_ATTEMPTS)? {
        config.executor.max_attempts = attempts;
    }
    if let Some(minutes) = parse_var(&lookup, COOLDOWN_MINUTES)? {
        config.validator.cooldown_minutes = minutes;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use feectl::config::PartialPolicy;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    const SAMPLE: &str = r#"
[validator]
cooldown_minutes = 30
blacklist = ["123x1x0"]

[validator.fee_rate_ppm]
min = 1
max = 2500

[executor]
max_attempts = 5

[transaction]
partial_policy = "revert"

[node]
url = "https://10.0.0.2:8080"
macaroon_hex = "0201"

[webhook]
url = "https://hooks.example/T0/B0"

[log]
level = "debug"
daily_rotation = true
"#;

    #[test]
    fn sample_file() {
        let config = parse_config(SAMPLE, no_env).unwrap();
        assert_eq!(config.control.validator.cooldown_minutes, 30);
        assert_eq!(config.control.validator.blacklist.len(), 1);
        assert_eq!(config.control.validator.fee_rate_ppm.max, 2500);
        assert_eq!(config.control.executor.max_attempts, 5);
        assert_eq!(config.control.transaction.partial_policy, PartialPolicy::Revert);
        // untouched tables keep their defaults
        assert_eq!(config.control.backup, ControlConfig::default().backup);
        let node = config.node.unwrap();
        assert_eq!(node.url, "https://10.0.0.2:8080");
        assert_eq!(node.timeout_secs, 30);
        assert_eq!(config.webhook.unwrap().url, "https://hooks.example/T0/B0");
        assert_eq!(config.log.level, "debug");
        assert!(config.log.daily_rotation);
        assert!(config.log.file);
    }

    #[test]
    fn empty_file_is_the_default() {
        let config = parse_config("", no_env).unwrap();
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn environment_wins() {
        let env = |key: &str| match key {
            "FEECTL_DRY_RUN" => Some("1".to_string()),
            "FEECTL_MAX_ATTEMPTS" => Some("2".to_string()),
            "FEECTL_COOLDOWN_MINUTES" => Some("0".to_string()),
            _ => None,
        };
        let config = parse_config(SAMPLE, env).unwrap();
        assert!(config.control.executor.dry_run);
        assert_eq!(config.control.executor.max_attempts, 2);
        assert_eq!(config.control.validator.cooldown_minutes, 0);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let inverted = "[validator.fee_rate_ppm]\nmin = 10\nmax = 1\n";
        assert!(parse_config(inverted, no_env).is_err());

        let zero_attempts = |key: &str| (key == MAX_ATTEMPTS).then(|| "0".to_string());
        assert!(parse_config("", zero_attempts).is_err());

        let not_a_number = |key: &str| (key == MAX_ATTEMPTS).then(|| "many".to_string());
        assert!(parse_config("", not_a_number).is_err());

        assert!(parse_config("[node]\nurl = 3\n", no_env).is_err());

        let loud = parse_config("[log]\nlevel = \"loud\"\n", no_env).unwrap_err();
        assert!(loud.to_string().contains("invalid log level"));
        assert!(parse_config("[log]\ncolour = true\n", no_env).is_err());
    }

    #[test]
    fn load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.control.validator.cooldown_minutes, 30);

        let missing = load_config(file.path().with_extension("missing")).unwrap_err();
        assert!(missing.to_string().starts_with("reading"));
    }
}
