use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_format: LogFormat::Json,
            default_filter: "info".into(),
        }
    }

    pub fn from_env(default_service_name: &str) -> Self {
        Self::from_lookup(default_service_name, |key| env::var(key).ok())
    }

    pub fn from_lookup<F>(default_service_name: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name =
            lookup("SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string());
        let log_format = lookup("LOG_FORMAT")
            .map(|v| match v.to_lowercase().as_str() {
                "text" | "pretty" | "plain" => LogFormat::Text,
                _ => LogFormat::Json,
            })
            .unwrap_or(LogFormat::Json);
        Self {
            service_name,
            log_format,
            ..Self::new(default_service_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_json_logs() {
        let cfg = TelemetryConfig::from_lookup("result-saver", lookup(&[]));
        assert_eq!(cfg.service_name, "result-saver");
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.default_filter, "info");
    }

    #[test]
    fn text_formats_are_recognised() {
        for value in ["text", "Pretty", "PLAIN"] {
            let cfg = TelemetryConfig::from_lookup("svc", lookup(&[("LOG_FORMAT", value)]));
            assert_eq!(cfg.log_format, LogFormat::Text);
        }
    }

    #[test]
    fn service_name_override() {
        let cfg = TelemetryConfig::from_lookup("svc", lookup(&[("SERVICE_NAME", "saver-eu")]));
        assert_eq!(cfg.service_name, "saver-eu");
    }
}
