use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Free-form attribute map declared for a tenant in configuration.
///
/// Values stay as raw YAML scalars; the template expander decides how to
/// render them.
pub type AttrMap = HashMap<String, serde_yaml::Value>;

/// Global configuration for the gate
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Worker program: binary, argv templates and environment templates
    #[serde(default)]
    pub program: ProgramConfig,

    /// First tenant id. The id doubles as the worker's TCP port.
    #[serde(default = "default_id_start")]
    pub id_start: u32,

    /// Global cap on simultaneously live workers
    #[serde(default = "default_max_procs")]
    pub max_procs: u32,

    /// HTTP header carrying the tenant identity
    pub header: String,

    /// Capture regex applied to the header value; group 1 is the tenant key
    pub regex: String,

    /// Seconds a worker may sit idle before it is reaped
    #[serde(default = "default_process_timeout")]
    pub process_timeout: u64,

    /// Seconds of upstream transport budget (connect, pool idle, full request)
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,

    /// Listen address (default: localhost:4901)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Per-tenant attribute maps, keyed by tenant key
    #[serde(default)]
    pub data: HashMap<String, AttrMap>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgramConfig {
    /// Worker executable (default: "minio")
    ///
    /// **Security:** the binary is executed directly with templated
    /// arguments. Configuration files must be protected with appropriate
    /// file permissions.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Argument templates, expanded per tenant
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment templates in `K=V` form, expanded per tenant.
    /// The worker sees exactly these entries and nothing from the parent
    /// environment.
    #[serde(default)]
    pub env: Vec<String>,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; any failure here is fatal at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.compile_regex()?;

        if self.program.binary.is_empty() {
            anyhow::bail!("program.binary must not be empty");
        }
        if self.max_procs == 0 {
            anyhow::bail!("max_procs must be at least 1");
        }
        // Every allocated id must be a valid TCP port.
        let end = self.id_start.checked_add(self.max_procs);
        if end.map_or(true, |end| end > 65536) {
            anyhow::bail!(
                "id_start {} leaves no room for {} workers below port 65536",
                self.id_start,
                self.max_procs
            );
        }

        Ok(())
    }

    /// Compile the header capture regex.
    pub fn compile_regex(&self) -> anyhow::Result<Regex> {
        Regex::new(&self.regex)
            .with_context(|| format!("header regex `{}` does not compile", self.regex))
    }

    /// Idle duration after which a worker is reaped.
    pub fn idle_reap_threshold(&self) -> Duration {
        Duration::from_secs(self.process_timeout)
    }

    /// Transport budget for upstream connections and requests.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

// Default value functions
fn default_binary() -> String {
    "minio".to_string()
}

fn default_id_start() -> u32 {
    15000
}

fn default_max_procs() -> u32 {
    100
}

fn default_process_timeout() -> u64 {
    900 // 15 minutes idle before reap
}

fn default_http_timeout() -> u64 {
    300 // 5 minutes of upstream budget
}

fn default_bind() -> String {
    "localhost:4901".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
program:
  binary: minio
  args: ["server", "--address", ":%{id}d", "/srv/%{key}s"]
  env: ["MINIO_ROOT_USER=%{user}s"]
id_start: 16000
max_procs: 50
header: X-Tenant
regex: "^([a-z]+)$"
process_timeout: 600
http_timeout: 120
bind: 127.0.0.1:8080
data:
  alice:
    user: alice
    volume: 3
  bob:
    user: bob
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.program.binary, "minio");
        assert_eq!(config.program.args.len(), 4);
        assert_eq!(config.id_start, 16000);
        assert_eq!(config.max_procs, 50);
        assert_eq!(config.header, "X-Tenant");
        assert_eq!(config.process_timeout, 600);
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.data.len(), 2);
        let alice = config.data.get("alice").unwrap();
        assert_eq!(
            alice.get("user"),
            Some(&serde_yaml::Value::String("alice".to_string()))
        );
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let yaml = r#"
header: X-Tenant
regex: "^(.+)$"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.program.binary, "minio");
        assert!(config.program.args.is_empty());
        assert!(config.program.env.is_empty());
        assert_eq!(config.id_start, 15000);
        assert_eq!(config.max_procs, 100);
        assert_eq!(config.process_timeout, 900);
        assert_eq!(config.http_timeout, 300);
        assert_eq!(config.bind, "localhost:4901");
        assert!(config.data.is_empty());
        assert_eq!(config.idle_reap_threshold(), Duration::from_secs(900));
        assert_eq!(config.upstream_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_missing_header_is_an_error() {
        let yaml = r#"
regex: "^(.+)$"
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_bad_regex_fails_validation() {
        let yaml = r#"
header: X-Tenant
regex: "^(unclosed"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_id_start_too_large_fails_validation() {
        let yaml = r#"
header: X-Tenant
regex: "^(.+)$"
id_start: 65500
max_procs: 100
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("65536"), "unexpected error: {err}");
    }

    #[test]
    fn test_id_start_at_limit_is_accepted() {
        let yaml = r#"
header: X-Tenant
regex: "^(.+)$"
id_start: 65436
max_procs: 100
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_max_procs_fails_validation() {
        let yaml = r#"
header: X-Tenant
regex: "^(.+)$"
max_procs: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
