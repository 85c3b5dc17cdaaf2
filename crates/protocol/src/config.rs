use serde::{Deserialize, Serialize};

/// Top-level configuration for the origin process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Root of the on-disk HLS media tree (playlists + segments)
    #[serde(default = "default_media_root")]
    pub media_root: String,
    /// Allowed CORS origins for player fetches (`*` disables the check)
    #[serde(default = "default_cors_origins")]
    pub cors_allowed_origins: Vec<String>,
}

/// Configuration for the in-memory session tracker and its durable sink.
///
/// Mirrors §4.3 of the tracking subsystem design: `sampling_interval` is
/// deliberately not configurable here — it is fixed at one minute by the
/// tracker itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Sink connection string (e.g. a `postgres://...` URL). The tracker is
    /// disabled entirely when this is absent or empty.
    pub connection_string: Option<String>,
    /// Bounded ingress depth. Submits past capacity are dropped and counted.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// HLS idle threshold, in seconds.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Icecast idle threshold (fail-safe upper bound), in seconds.
    #[serde(default = "default_icecast_session_timeout_secs")]
    pub icecast_session_timeout_secs: u64,
    /// How often expirations are evaluated, in seconds.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            media_root: default_media_root(),
            cors_allowed_origins: default_cors_origins(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            queue_capacity: default_queue_capacity(),
            session_timeout_secs: default_session_timeout_secs(),
            icecast_session_timeout_secs: default_icecast_session_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl OriginConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{cert}' does not exist."));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{key}' does not exist."));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. Both must be set for \
                     custom TLS, or omit both for an auto-generated certificate."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. Both must be set for \
                     custom TLS, or omit both for an auto-generated certificate."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if !std::path::Path::new(&self.server.media_root).is_dir() {
            issues.push(format!(
                "WARNING: server.media_root '{}' does not exist — segment requests will 404.",
                self.server.media_root
            ));
        }

        if let Some(conn) = &self.tracker.connection_string
            && conn.trim().is_empty()
        {
            issues.push(
                "WARNING: tracker.connection_string is present but empty; the tracker will \
                 behave as disabled."
                    .to_string(),
            );
        }

        if self.tracker.queue_capacity == 0 {
            issues.push("ERROR: tracker.queue_capacity must be >= 1.".to_string());
        }

        if self.tracker.session_timeout_secs == 0 {
            issues.push("ERROR: tracker.session_timeout_secs must be >= 1.".to_string());
        }

        if self.tracker.icecast_session_timeout_secs < self.tracker.session_timeout_secs {
            issues.push(
                "WARNING: tracker.icecast_session_timeout_secs is shorter than \
                 session_timeout_secs; Icecast sessions will expire earlier than HLS ones."
                    .to_string(),
            );
        }

        if self.tracker.reaper_interval_secs == 0 {
            issues.push("ERROR: tracker.reaper_interval_secs must be >= 1.".to_string());
        }

        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_media_root() -> String {
    "/var/lib/wavecast/media".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_queue_capacity() -> usize {
    4096
}
fn default_session_timeout_secs() -> u64 {
    60
}
fn default_icecast_session_timeout_secs() -> u64 {
    24 * 60 * 60
}
fn default_reaper_interval_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: OriginConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8443);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.tls_key.is_none());
        assert_eq!(config.server.cors_allowed_origins, vec!["*".to_string()]);

        assert!(config.tracker.connection_string.is_none());
        assert_eq!(config.tracker.queue_capacity, 4096);
        assert_eq!(config.tracker.session_timeout_secs, 60);
        assert_eq!(config.tracker.icecast_session_timeout_secs, 86_400);
        assert_eq!(config.tracker.reaper_interval_secs, 10);
    }

    #[test]
    fn partial_config_only_tracker_section() {
        let toml_str = r#"
[tracker]
connection_string = "postgres://localhost/wavecast"
session_timeout_secs = 30
"#;
        let config: OriginConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");

        assert_eq!(
            config.tracker.connection_string.as_deref(),
            Some("postgres://localhost/wavecast")
        );
        assert_eq!(config.tracker.session_timeout_secs, 30);
        assert_eq!(config.tracker.reaper_interval_secs, 10);
        assert_eq!(config.server.port, 8443);
    }

    fn valid_config() -> OriginConfig {
        toml::from_str("").expect("default config")
    }

    fn validate_issues(config: &OriginConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_has_only_media_root_warning() {
        let config = valid_config();
        let issues = validate_issues(&config);
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "port"));
    }

    #[test]
    fn validate_queue_capacity_zero_is_error() {
        let mut config = valid_config();
        config.tracker.queue_capacity = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "queue_capacity"));
    }

    #[test]
    fn validate_session_timeout_zero_is_error() {
        let mut config = valid_config();
        config.tracker.session_timeout_secs = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "session_timeout_secs"));
    }

    #[test]
    fn validate_reaper_interval_zero_is_error() {
        let mut config = valid_config();
        config.tracker.reaper_interval_secs = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "reaper_interval_secs"));
    }

    #[test]
    fn validate_icecast_timeout_shorter_than_hls_warns() {
        let mut config = valid_config();
        config.tracker.icecast_session_timeout_secs = 10;
        config.tracker.session_timeout_secs = 60;
        let issues = validate_issues(&config);
        assert!(
            issues
                .iter()
                .any(|i| i.contains("icecast_session_timeout_secs"))
        );
    }
}
