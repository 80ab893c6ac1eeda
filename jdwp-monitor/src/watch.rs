// Watch files
//
// A watch file names the target and the event requests to install:
//
// {
//   "host": "localhost",
//   "port": 5005,
//   "engine": { "broadcast_capacity": 128 },
//   "requests": [
//     { "kind": "class_prepare", "suspend_policy": "none", "class_filter": "com.example.*" },
//     { "kind": "exception", "count": 3 }
//   ]
// }

use anyhow::{bail, Context, Result};
use jdwp_engine::{EngineConfig, EventKind, RequestBuilder, SuspendPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5005
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchFile {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub requests: Vec<WatchRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub kind: EventKind,
    #[serde(default)]
    pub suspend_policy: SuspendPolicy,
    pub class_filter: Option<String>,
    pub class_exclusion_filter: Option<String>,
    pub source_name_filter: Option<String>,
    pub count: Option<u32>,
    /// Exception requests only
    #[serde(default = "default_true")]
    pub caught: bool,
    #[serde(default = "default_true")]
    pub uncaught: bool,
}

impl WatchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read watch file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid watch file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let watch: WatchFile = serde_json::from_str(text)?;
        watch.engine.validate()?;
        if watch.requests.is_empty() {
            bail!("no requests to watch");
        }
        Ok(watch)
    }
}

impl WatchRequest {
    /// Builder for the request, already enabled
    pub fn to_builder(&self) -> Result<RequestBuilder> {
        let builder = match self.kind {
            EventKind::Exception => RequestBuilder::exception(None, self.caught, self.uncaught),
            kind if kind.requires_target() => {
                bail!("{} requests need a code location and cannot be watched", kind)
            }
            kind => RequestBuilder::of_kind(kind),
        };

        let mut builder = builder.suspend_policy(self.suspend_policy).enabled();
        if let Some(pattern) = &self.class_filter {
            builder = builder.class_filter(pattern);
        }
        if let Some(pattern) = &self.class_exclusion_filter {
            builder = builder.class_exclusion_filter(pattern);
        }
        if let Some(pattern) = &self.source_name_filter {
            builder = builder.source_name_filter(pattern);
        }
        if let Some(count) = self.count {
            builder = builder.count_filter(count);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jdwp_engine::RequestRegistry;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "port": 8000,
                "requests": [
                    {{ "kind": "class_prepare", "suspend_policy": "none", "class_filter": "com.example.*" }},
                    {{ "kind": "thread_start" }}
                ]
            }}"#
        )
        .unwrap();

        let watch = WatchFile::load(file.path()).unwrap();
        assert_eq!(watch.host, "localhost");
        assert_eq!(watch.port, 8000);
        assert_eq!(watch.engine, EngineConfig::default());
        assert_eq!(watch.requests.len(), 2);
        assert_eq!(watch.requests[0].kind, EventKind::ClassPrepare);
        assert_eq!(watch.requests[0].suspend_policy, SuspendPolicy::None);
        assert_eq!(watch.requests[1].suspend_policy, SuspendPolicy::All);
    }

    #[test]
    fn test_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = WatchFile::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("absent.json"));
    }

    #[test]
    fn test_rejects_empty_request_list() {
        assert!(WatchFile::parse(r#"{ "requests": [] }"#).is_err());
    }

    #[test]
    fn test_rejects_bad_engine_config() {
        let text = r#"{ "engine": { "broadcast_capacity": 0 }, "requests": [ { "kind": "thread_start" } ] }"#;
        assert!(WatchFile::parse(text).is_err());
    }

    #[test]
    fn test_breakpoints_cannot_be_watched() {
        let watch = WatchFile::parse(r#"{ "requests": [ { "kind": "breakpoint" } ] }"#).unwrap();
        assert!(watch.requests[0].to_builder().is_err());
    }

    #[test]
    fn test_builder_carries_filters() {
        let watch = WatchFile::parse(
            r#"{ "requests": [ { "kind": "exception", "class_exclusion_filter": "java.*", "count": 2, "caught": false } ] }"#,
        )
        .unwrap();
        let registry = RequestRegistry::default();
        let id = registry
            .create(watch.requests[0].to_builder().unwrap())
            .unwrap();

        let info = registry.get(id).unwrap();
        assert_eq!(info.kind, EventKind::Exception);
        assert!(info.enabled);
        assert_eq!(info.filters.len(), 2);
    }

    #[test]
    fn test_invalid_pattern_fails_at_create() {
        let watch = WatchFile::parse(
            r#"{ "requests": [ { "kind": "class_prepare", "class_filter": "com.*.Foo" } ] }"#,
        )
        .unwrap();
        let registry = RequestRegistry::default();
        assert!(registry
            .create(watch.requests[0].to_builder().unwrap())
            .is_err());
    }
}
