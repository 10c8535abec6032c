//! Bouncer configuration
//!
//! YAML configuration document with a `.local` overlay merge, validation,
//! logging setup, and generation of a starter document from Cloudflare API
//! tokens.

pub mod error;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::cloudflare::api::EdgeApi;
use crate::cloudflare::rest::RestEdgeApi;

pub use error::ConfigError;

/// Product name, used for user agents, resource names and log files.
pub const PRODUCT_NAME: &str = "crowdsec-cloudflare-worker-bouncer";

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str =
    "/etc/crowdsec/bouncers/crowdsec-cloudflare-worker-bouncer.yaml";

const VALID_ACTIONS: [&str; 2] = ["ban", "captcha"];

/// Turnstile settings of one zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rotate_secret_key: bool,
    #[serde(
        default = "TurnstileConfig::default_rotation_interval",
        with = "duration_string"
    )]
    pub rotate_secret_key_every: Duration,
    #[serde(default = "TurnstileConfig::default_mode")]
    pub mode: String,
}

impl TurnstileConfig {
    fn default_rotation_interval() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }

    fn default_mode() -> String {
        "managed".into()
    }
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rotate_secret_key: false,
            rotate_secret_key_every: Self::default_rotation_interval(),
            mode: Self::default_mode(),
        }
    }
}

/// One protected zone of an account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub default_action: String,
    #[serde(default)]
    pub routes_to_protect: Vec<String>,
    #[serde(default)]
    pub turnstile: TurnstileConfig,
    /// Let traffic through when the worker itself is over quota or erroring.
    #[serde(default)]
    pub fail_open: bool,
    /// Resolved against the live zone list at startup, never configured.
    #[serde(skip)]
    pub domain: String,
}

/// One Cloudflare account the synchronizer manages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub token: String,
    #[serde(rename = "account_name")]
    pub name: String,
    #[serde(default)]
    pub ban_template: String,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudflareConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Connection settings for the CrowdSec LAPI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrowdSecConfig {
    pub lapi_url: String,
    #[serde(default)]
    pub lapi_key: String,
    #[serde(
        default = "CrowdSecConfig::default_update_frequency",
        with = "duration_string"
    )]
    pub update_frequency: Duration,
    #[serde(default)]
    pub include_scenarios_containing: Vec<String>,
    #[serde(default)]
    pub exclude_scenarios_containing: Vec<String>,
    #[serde(default)]
    pub only_include_decisions_from: Vec<String>,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
    #[serde(default)]
    pub ca_cert_path: String,
}

impl CrowdSecConfig {
    fn default_update_frequency() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for CrowdSecConfig {
    fn default() -> Self {
        Self {
            lapi_url: "http://localhost:8080/".into(),
            lapi_key: String::new(),
            update_frequency: Self::default_update_frequency(),
            include_scenarios_containing: Vec::new(),
            exclude_scenarios_containing: Vec::new(),
            only_include_decisions_from: Vec::new(),
            cert_path: String::new(),
            key_path: String::new(),
            ca_cert_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "PrometheusConfig::default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "PrometheusConfig::default_listen_port")]
    pub listen_port: u16,
}

impl PrometheusConfig {
    fn default_listen_addr() -> String {
        "127.0.0.1".into()
    }

    fn default_listen_port() -> u16 {
        2112
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: Self::default_listen_addr(),
            listen_port: Self::default_listen_port(),
        }
    }
}

/// Logging keys, inlined at the top level of the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub log_level: String,
    #[serde(default = "LoggingConfig::default_media")]
    pub log_media: String,
    #[serde(default = "LoggingConfig::default_dir")]
    pub log_dir: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".into()
    }

    fn default_media() -> String {
        "stdout".into()
    }

    fn default_dir() -> String {
        "/var/log/".into()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_level(),
            log_media: Self::default_media(),
            log_dir: Self::default_dir(),
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BouncerConfig {
    #[serde(default)]
    pub crowdsec_config: CrowdSecConfig,
    #[serde(default)]
    pub cloudflare_config: CloudflareConfig,
    #[serde(flatten)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub daemon: bool,
}

impl BouncerConfig {
    /// Load the document at `path`, overlay `<path>.local` when present,
    /// parse and validate.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let document = merged_document(path)?;
        let mut config: BouncerConfig =
            serde_yaml::from_value(document).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the document, normalizing each zone's action set so the
    /// default action is always a member.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let mut account_ids = HashMap::new();
        let mut zone_ids = HashMap::new();

        for account in &mut self.cloudflare_config.accounts {
            if account_ids.insert(account.id.clone(), ()).is_some() {
                return Err(ConfigError::InvalidValue {
                    key: "cloudflare_config.accounts".into(),
                    value: account.id.clone(),
                    reason: "account id is duplicated".into(),
                });
            }
            if account.token.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("account {} token", account.id),
                    hint: "every account needs an API token".into(),
                });
            }

            for zone in &mut account.zones {
                if !zone.default_action.is_empty()
                    && !zone.actions.contains(&zone.default_action)
                {
                    zone.actions.push(zone.default_action.clone());
                }
                if zone.actions.is_empty() {
                    return Err(ConfigError::MissingRequired {
                        key: format!("zone {} actions", zone.zone_id),
                        hint: "valid choices are either of 'ban', 'captcha'".into(),
                    });
                }
                for action in &zone.actions {
                    if !VALID_ACTIONS.contains(&action.as_str()) {
                        return Err(ConfigError::InvalidValue {
                            key: format!("zone {} actions", zone.zone_id),
                            value: action.clone(),
                            reason: "valid choices are either of 'ban', 'captcha'".into(),
                        });
                    }
                    if action == "captcha" && !zone.turnstile.enabled {
                        return Err(ConfigError::InvalidValue {
                            key: format!("zone {} actions", zone.zone_id),
                            value: action.clone(),
                            reason: "turnstile must be enabled to support the captcha action"
                                .into(),
                        });
                    }
                }
                if zone_ids.insert(zone.zone_id.clone(), ()).is_some() {
                    return Err(ConfigError::InvalidValue {
                        key: "zones".into(),
                        value: zone.zone_id.clone(),
                        reason: "zone id is duplicated".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The effective merged document, for `-T`.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }
}

/// Read `path` and deep-merge `<path>.local` over it when that file exists.
pub fn merged_document(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let read = |p: &Path| -> Result<serde_yaml::Value, ConfigError> {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::Read {
            path: p.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            reason: format!("{}: {}", p.display(), e),
        })
    };

    let mut base = read(path)?;
    let local_path = {
        let mut p = path.as_os_str().to_owned();
        p.push(".local");
        std::path::PathBuf::from(p)
    };
    if local_path.exists() {
        let overlay = read(&local_path)?;
        merge_values(&mut base, overlay);
    }
    Ok(base)
}

/// Overlay `other` onto `base`. Mappings merge recursively, everything else
/// is replaced wholesale.
fn merge_values(base: &mut serde_yaml::Value, other: serde_yaml::Value) {
    match (base, other) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(other_map)) => {
            for (key, value) in other_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}

/// Initialize tracing from the logging keys. The returned guard must be held
/// for as long as the process logs to a file.
pub fn setup_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = EnvFilter::try_new(&logging.log_level).map_err(|e| ConfigError::InvalidValue {
        key: "log_level".into(),
        value: logging.log_level.clone(),
        reason: e.to_string(),
    })?;

    match logging.log_media.as_str() {
        "file" => {
            let appender = tracing_appender::rolling::never(
                &logging.log_dir,
                format!("{PRODUCT_NAME}.log"),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        "stdout" => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
        other => Err(ConfigError::InvalidValue {
            key: "log_media".into(),
            value: other.into(),
            reason: "valid choices are either of 'stdout', 'file'".into(),
        }),
    }
}

/// Discover the accounts and zones visible to each token and emit a starter
/// configuration. When a document already exists at `base_path` its CrowdSec
/// and logging sections are carried over.
pub async fn generate_from_tokens(
    tokens: &str,
    base_path: &Path,
) -> Result<String, anyhow::Error> {
    let mut discovered = Vec::new();
    for token in tokens.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let api = RestEdgeApi::for_token(token)?;
        let accounts = api.list_accounts().await?;
        let zones = api.list_zones().await?;
        discovered.push(DiscoveredToken {
            token: token.to_string(),
            accounts,
            zones,
        });
    }
    render_generated(base_path, discovered)
}

/// Accounts and zones one token grants access to.
pub struct DiscoveredToken {
    pub token: String,
    pub accounts: Vec<crate::cloudflare::types::Account>,
    pub zones: Vec<crate::cloudflare::types::Zone>,
}

/// Pure part of config generation, separated so tests can feed discoveries
/// directly.
pub fn render_generated(
    base_path: &Path,
    discovered: Vec<DiscoveredToken>,
) -> Result<String, anyhow::Error> {
    let (mut base, has_base) = match std::fs::read_to_string(base_path) {
        Ok(contents) => (serde_yaml::from_str::<BouncerConfig>(&contents)?, true),
        Err(_) => (BouncerConfig::default(), false),
    };
    if !has_base {
        base.daemon = true;
        base.prometheus.enabled = true;
    }

    let mut accounts: Vec<AccountConfig> = Vec::new();
    let mut account_index: HashMap<String, usize> = HashMap::new();
    let mut domain_by_zone_id: HashMap<String, String> = HashMap::new();

    for entry in discovered {
        for account in &entry.accounts {
            if !account_index.contains_key(&account.id) {
                account_index.insert(account.id.clone(), accounts.len());
                accounts.push(AccountConfig {
                    id: account.id.clone(),
                    name: account.name.replace("'s Account", ""),
                    token: entry.token.clone(),
                    ban_template: String::new(),
                    zones: Vec::new(),
                });
            }
        }
        for zone in &entry.zones {
            domain_by_zone_id.insert(zone.id.clone(), zone.name.clone());
            let Some(account) = zone.account.as_ref() else {
                continue;
            };
            let Some(&index) = account_index.get(&account.id) else {
                continue;
            };
            accounts[index].zones.push(ZoneConfig {
                zone_id: zone.id.clone(),
                actions: vec!["captcha".into()],
                default_action: "captcha".into(),
                routes_to_protect: vec![format!("*{}/*", zone.name)],
                turnstile: TurnstileConfig {
                    enabled: true,
                    rotate_secret_key: true,
                    rotate_secret_key_every: Duration::from_secs(7 * 24 * 3600),
                    mode: "managed".into(),
                },
                fail_open: false,
                domain: String::new(),
            });
        }
    }

    base.cloudflare_config = CloudflareConfig { accounts };
    let rendered = serde_yaml::to_string(&base)?;

    let header = if has_base {
        format!("# Config generated by using {} as base", base_path.display())
    } else {
        format!(
            "# Base config {} not found, please fill crowdsec credentials.",
            base_path.display()
        )
    };

    let mut lines = vec![header];
    for line in rendered.lines() {
        match annotate_line(line, &domain_by_zone_id) {
            Some(comment) => lines.push(format!("{line} # {comment}")),
            None => lines.push(line.to_string()),
        }
    }
    Ok(lines.join("\n"))
}

/// Inline comment for a generated line, if it deserves one.
fn annotate_line(line: &str, domain_by_zone_id: &HashMap<String, String>) -> Option<String> {
    let last_word = line.split_whitespace().last().unwrap_or_default();
    if let Some(domain) = domain_by_zone_id.get(last_word) {
        return Some(domain.clone());
    }
    if line.contains("ban_template") {
        return Some("template to use for ban action, set empty to use default".into());
    }
    if line.contains("exclude_scenarios_containing") {
        return Some("ignore IPs banned for triggering scenarios containing either of provided word".into());
    }
    if line.contains("include_scenarios_containing") {
        return Some("ignore IPs banned for triggering scenarios not containing either of provided word".into());
    }
    if line.contains("only_include_decisions_from") {
        return Some(r#"only include IPs banned due to decisions orginating from provided sources. eg value ["cscli", "crowdsec"]"#.into());
    }
    if line.contains("actions:") {
        return Some(r#"supported actions for this zone. eg value ["ban", "captcha"]"#.into());
    }
    if line.contains("turnstile:") {
        return Some("Turnstile must be enabled if captcha action is used.".into());
    }
    None
}

/// Parse a duration string like `10s`, `30m`, `24h` or `7d`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".into());
    }

    let unit_pos = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration must have a unit (e.g., '10s', '7d')".to_string())?;

    let value_str = &s[..unit_pos];
    let unit = &s[unit_pos..];

    let value: u64 = value_str
        .parse()
        .map_err(|_| "duration value must be a positive integer".to_string())?;

    let seconds = match unit {
        "s" | "sec" | "secs" => value,
        "m" | "min" | "mins" => value * 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600,
        "d" | "day" | "days" => value * 86400,
        "w" | "week" | "weeks" => value * 604800,
        _ => return Err(format!("unknown duration unit '{unit}'")),
    };
    Ok(Duration::from_secs(seconds))
}

/// Render a duration in the largest unit that divides it evenly.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs != 0 && secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Serde adapter for duration strings in the YAML document.
mod duration_string {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: secret
  update_frequency: 10s
cloudflare_config:
  accounts:
    - id: acc1
      token: tok1
      account_name: Example
      zones:
        - zone_id: z1
          actions: ["ban"]
          default_action: ban
          routes_to_protect: ["*example.com/*"]
log_level: info
prometheus:
  enabled: true
  listen_addr: 127.0.0.1
  listen_port: 2112
"#;

    fn parse(document: &str) -> BouncerConfig {
        let mut config: BouncerConfig = serde_yaml::from_str(document).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn sample_document_parses_and_validates() {
        let config = parse(SAMPLE);
        assert_eq!(config.crowdsec_config.update_frequency, Duration::from_secs(10));
        assert_eq!(config.cloudflare_config.accounts.len(), 1);
        assert_eq!(config.cloudflare_config.accounts[0].name, "Example");
        assert_eq!(config.prometheus.listen_port, 2112);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn default_action_is_added_to_the_action_set() {
        let document = SAMPLE.replace(r#"actions: ["ban"]"#, "actions: []");
        let config = parse(&document);
        assert_eq!(config.cloudflare_config.accounts[0].zones[0].actions, vec!["ban"]);
    }

    #[test]
    fn captcha_without_turnstile_is_rejected() {
        let document = SAMPLE.replace("ban", "captcha");
        let mut config: BouncerConfig = serde_yaml::from_str(&document).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("turnstile"));
    }

    #[test]
    fn invalid_action_is_rejected() {
        let document = SAMPLE.replace(r#"["ban"]"#, r#"["drop"]"#);
        let mut config: BouncerConfig = serde_yaml::from_str(&document).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicated_account_is_rejected() {
        let mut config: BouncerConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let mut duplicate = config.cloudflare_config.accounts[0].clone();
        duplicate.zones.clear();
        config.cloudflare_config.accounts.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_token_is_rejected() {
        let document = SAMPLE.replace("token: tok1", "token: \"\"");
        let mut config: BouncerConfig = serde_yaml::from_str(&document).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn local_overlay_merges_over_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bouncer.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        std::fs::write(
            dir.path().join("bouncer.yaml.local"),
            "crowdsec_config:\n  lapi_key: overridden\n",
        )
        .unwrap();

        let value = merged_document(&path).unwrap();
        let config: BouncerConfig = serde_yaml::from_value(value).unwrap();
        assert_eq!(config.crowdsec_config.lapi_key, "overridden");
        // Untouched keys survive the merge.
        assert_eq!(config.cloudflare_config.accounts[0].id, "acc1");
    }

    #[test]
    fn duration_strings_parse_and_render() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("").is_err());
        assert_eq!(format_duration(Duration::from_secs(604800)), "7d");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    }

    #[test]
    fn generated_config_annotates_zone_domains() {
        use crate::cloudflare::types::{Account, Zone};

        let discovered = vec![DiscoveredToken {
            token: "tok1".into(),
            accounts: vec![Account {
                id: "acc1".into(),
                name: "Example's Account".into(),
            }],
            zones: vec![Zone {
                id: "z1".into(),
                name: "example.com".into(),
                account: Some(Account {
                    id: "acc1".into(),
                    name: "Example's Account".into(),
                }),
            }],
        }];
        let rendered =
            render_generated(Path::new("/nonexistent/base.yaml"), discovered).unwrap();
        assert!(rendered.contains("zone_id: z1 # example.com"), "{rendered}");
        assert!(rendered.contains("account_name: Example"));
        assert!(rendered.contains("rotate_secret_key_every: 7d"));
        assert!(rendered.starts_with("# Base config"));
    }
}
