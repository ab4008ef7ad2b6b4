use crate::error::{Result, StackError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

pub const CONFIG_FILE: &str = "stack.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Local,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Only the local environment gets a throwaway cluster; the others deploy
    /// into whatever the current kube context points at.
    pub fn provisions_cluster(&self) -> bool {
        matches!(self, Environment::Local)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Environment::Local),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(StackError::UnknownEnvironment(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// What to do when a stage's readiness wait runs out of time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    Warn,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    /// Label selector, e.g. `app.kubernetes.io/tier=datastore`.
    pub selector: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default = "default_readiness_timeout", with = "duration_str")]
    pub timeout: Duration,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
}

fn default_kind() -> String {
    "pod".to_string()
}

fn default_condition() -> String {
    "Ready".to_string()
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(300)
}

// ---------------------------------------------------------------------------
// Stage configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// Optional kind cluster config (port mappings for ingress, node labels).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressConfig {
    /// File, directory or URL applied with `kubectl apply -f`.
    pub manifests: String,
    #[serde(default = "default_ingress_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessConfig>,
}

fn default_ingress_namespace() -> String {
    "ingress-nginx".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    pub label: String,
    /// Resource to forward to, e.g. `svc/kibana`.
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Defaults to the stack namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentDataConfig {
    /// Label selector matching the PersistentVolumeClaims owned by the stack.
    pub selector: String,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub release: String,
    pub namespace: String,
    /// Chart reference handed to the release manager (path or repo/name).
    pub chart: String,
    pub cluster: ClusterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressConfig>,
    #[serde(default)]
    pub datastore: TierConfig,
    #[serde(default)]
    pub app: TierConfig,
    #[serde(default)]
    pub expose: TierConfig,
    #[serde(default)]
    pub environments: BTreeMap<Environment, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_data: Option<PersistentDataConfig>,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
    /// Directory the config was loaded from; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_version() -> u32 {
    1
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StackError::ConfigNotFound);
        }
        let data = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&data)?;
        cfg.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        cfg.check_names()?;
        Ok(cfg)
    }

    fn check_names(&self) -> Result<()> {
        validate_name(&self.release)?;
        validate_name(&self.namespace)?;
        validate_name(&self.cluster.name)?;
        if let Some(ingress) = &self.ingress {
            validate_name(&ingress.namespace)?;
        }
        for fwd in &self.forwards {
            if let Some(ns) = &fwd.namespace {
                validate_name(ns)?;
            }
        }
        Ok(())
    }

    /// Resolve a manifest source against the config directory. URLs pass
    /// through untouched.
    pub fn resolve_source(&self, source: &str) -> String {
        if source.contains("://") || Path::new(source).is_absolute() {
            return source.to_string();
        }
        self.base_dir.join(source).to_string_lossy().into_owned()
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Chart references that look like local paths are resolved; anything
    /// else (`repo/chart`, `oci://...`) is handed to helm as-is.
    pub fn chart_ref(&self) -> String {
        let local = self.base_dir.join(&self.chart);
        if local.exists() {
            local.to_string_lossy().into_owned()
        } else {
            self.chart.clone()
        }
    }

    /// The values overlay for `env`, which must exist on disk.
    pub fn overlay_path(&self, env: Environment) -> Result<PathBuf> {
        let rel = self
            .environments
            .get(&env)
            .ok_or_else(|| StackError::OverlayMissing {
                environment: env.to_string(),
                path: PathBuf::from(format!("<no 'environments.{env}' entry>")),
            })?;
        let path = self.resolve_path(rel);
        if !path.is_file() {
            return Err(StackError::OverlayMissing {
                environment: env.to_string(),
                path,
            });
        }
        Ok(path)
    }

    pub fn persistent_data_selector(&self) -> String {
        match &self.persistent_data {
            Some(pd) => pd.selector.clone(),
            None => format!("app.kubernetes.io/instance={}", self.release),
        }
    }

    pub fn forward_namespace<'a>(&'a self, fwd: &'a ForwardConfig) -> &'a str {
        fwd.namespace.as_deref().unwrap_or(&self.namespace)
    }

    pub fn forward_ports(&self) -> Vec<u16> {
        self.forwards.iter().map(|f| f.local_port).collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let mut seen_ports = HashSet::new();
        let mut seen_labels = HashSet::new();
        for fwd in &self.forwards {
            if !seen_ports.insert(fwd.local_port) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "forward '{}' reuses local port {}; only the last one will stay open",
                        fwd.label, fwd.local_port
                    ),
                });
            }
            if !seen_labels.insert(fwd.label.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("duplicate forward label '{}'", fwd.label),
                });
            }
            if fwd.local_port == 0 || fwd.remote_port == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("forward '{}' has a zero port", fwd.label),
                });
            }
        }

        let readiness = [
            ("ingress", self.ingress.as_ref().and_then(|i| i.readiness.as_ref())),
            ("datastore", self.datastore.readiness.as_ref()),
            ("app", self.app.readiness.as_ref()),
            ("expose", self.expose.readiness.as_ref()),
        ];
        for (stage, spec) in readiness {
            let Some(spec) = spec else { continue };
            if spec.selector.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("stage '{stage}' has an empty readiness selector"),
                });
            }
            if spec.timeout < self.poll_interval {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "stage '{stage}' readiness timeout ({}) is shorter than poll_interval ({}); it will be probed once",
                        format_duration(spec.timeout),
                        format_duration(self.poll_interval)
                    ),
                });
            }
        }

        if self.poll_interval.is_zero() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "poll_interval must be greater than zero".to_string(),
            });
        }

        if self.environments.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "no environments configured; deploy will fail until one is added"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9\-]*[a-z0-9])?$").expect("name pattern is valid")
    })
}

/// Releases, namespaces and clusters are all RFC 1123 labels.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 || !name_re().is_match(name) {
        return Err(StackError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse `1500ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = || StackError::InvalidConfig(format!("invalid duration '{input}'"));
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: u64 = num.parse().map_err(|_| invalid())?;
    let scaled = |per: u64| {
        value
            .checked_mul(per)
            .map(Duration::from_secs)
            .ok_or_else(|| StackError::InvalidConfig(format!("duration '{input}' is too large")))
    };
    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => scaled(60),
        "h" => scaled(3600),
        _ => Err(invalid()),
    }
}

pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        format!("{ms}ms")
    } else {
        let secs = d.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(t) => super::parse_duration(&t).map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
release: shop
namespace: shop
chart: ./chart
cluster:
  name: shop-local
ingress:
  manifests: https://example.com/ingress-nginx/deploy.yaml
  readiness:
    selector: app.kubernetes.io/component=controller
    timeout: 90s
datastore:
  manifests: k8s/datastore
  readiness:
    selector: app.kubernetes.io/tier=datastore
    timeout: 5m
app:
  readiness:
    selector: app.kubernetes.io/tier=app
    on_timeout: abort
environments:
  local: values/local.yaml
  production: values/production.yaml
forwards:
  - label: kibana
    target: svc/kibana
    local_port: 5601
    remote_port: 5601
  - label: app
    target: svc/shop
    local_port: 8080
    remote_port: 80
poll_interval: 2s
"#;

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&write_sample(&dir)).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.base_dir, dir.path());
        let ingress = cfg.ingress.as_ref().unwrap();
        assert_eq!(ingress.namespace, "ingress-nginx");
        let ds = cfg.datastore.readiness.as_ref().unwrap();
        assert_eq!(ds.timeout, Duration::from_secs(300));
        assert_eq!(ds.kind, "pod");
        assert_eq!(ds.condition, "Ready");
        assert_eq!(ds.on_timeout, TimeoutPolicy::Warn);
        let app = cfg.app.readiness.as_ref().unwrap();
        assert_eq!(app.timeout, Duration::from_secs(300));
        assert_eq!(app.on_timeout, TimeoutPolicy::Abort);
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.forward_ports(), vec![5601, 8080]);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_missing_file_is_config_not_found() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, StackError::ConfigNotFound));
    }

    #[test]
    fn load_rejects_invalid_release_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "release: Shop_App\nnamespace: shop\nchart: c\ncluster:\n  name: x\n",
        )
        .unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, StackError::InvalidName(n) if n == "Shop_App"));
    }

    #[test]
    fn overlay_path_requires_file_on_disk() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&write_sample(&dir)).unwrap();

        let err = cfg.overlay_path(Environment::Local).unwrap_err();
        assert!(matches!(err, StackError::OverlayMissing { .. }));

        std::fs::create_dir_all(dir.path().join("values")).unwrap();
        std::fs::write(dir.path().join("values/local.yaml"), "replicas: 1\n").unwrap();
        let path = cfg.overlay_path(Environment::Local).unwrap();
        assert_eq!(path, dir.path().join("values/local.yaml"));

        // staging has no entry at all
        assert!(cfg.overlay_path(Environment::Staging).is_err());
    }

    #[test]
    fn resolve_source_keeps_urls() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&write_sample(&dir)).unwrap();
        assert_eq!(
            cfg.resolve_source("https://example.com/a.yaml"),
            "https://example.com/a.yaml"
        );
        assert_eq!(
            cfg.resolve_source("k8s/datastore"),
            dir.path().join("k8s/datastore").to_string_lossy()
        );
    }

    #[test]
    fn persistent_selector_defaults_to_release_instance() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&write_sample(&dir)).unwrap();
        assert_eq!(
            cfg.persistent_data_selector(),
            "app.kubernetes.io/instance=shop"
        );
    }

    #[test]
    fn validate_flags_duplicate_ports_and_short_timeouts() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::load(&write_sample(&dir)).unwrap();
        cfg.forwards[1].local_port = 5601;
        cfg.poll_interval = Duration::from_secs(600);
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("5601")));
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("shorter than poll_interval")));
    }

    #[test]
    fn environment_parses_known_names() {
        assert_eq!("local".parse::<Environment>().unwrap(), Environment::Local);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert!("qa".parse::<Environment>().is_err());
        assert!(Environment::Local.provisions_cluster());
        assert!(!Environment::Staging.provisions_cluster());
    }

    #[test]
    fn durations_parse_and_format() {
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("").is_err());
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn oversized_durations_are_rejected_not_wrapped() {
        let err = parse_duration("9999999999999999h").unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        assert!(parse_duration("999999999999999999m").is_err());
        assert!(parse_duration("99999999999999999999").is_err());
        assert_eq!(
            parse_duration("18446744073709551615").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn names_follow_dns_labels() {
        for ok in ["shop", "a", "shop-local-1"] {
            validate_name(ok).unwrap_or_else(|_| panic!("expected valid: {ok}"));
        }
        for bad in ["", "-shop", "shop-", "Shop", "shop_app", "has space"] {
            assert!(validate_name(bad).is_err(), "expected invalid: {bad}");
        }
    }
}
