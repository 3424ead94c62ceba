use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Placeholder in `launch-prefix` arguments replaced by the app's image reference.
pub const IMAGE_PLACEHOLDER: &str = "{image}";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("Unknown app '{name}', known apps: [{known}]")]
    Unknown { name: String, known: String },
}

/// A host path staged into each instance's scratch space.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Mount {
    pub source: PathBuf,
    /// Relative path inside the scratch directory.
    pub target: PathBuf,
}

/// Launch descriptor for a target application.
///
/// The core never interprets the image reference; runtimes decide what an
/// image means. The process runtime only substitutes it into `launch-prefix`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct App {
    #[serde(default)]
    pub image: String,
    pub command: Vec<String>,
    /// Prepended to `command`, e.g. `["docker", "run", "--rm", "-i", "{image}"]`.
    #[serde(default)]
    pub launch_prefix: Vec<String>,
    /// Channels the app subscribes to. Informational.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Stdout line the target prints once it is ready for input. Without it
    /// the instance is considered ready as soon as it has spawned.
    #[serde(default)]
    pub ready_line: Option<String>,
    /// Stdout line marking a completed response. Without it the response is
    /// whatever the target printed before exiting cleanly.
    #[serde(default)]
    pub response_line: Option<String>,
    /// Treat a target still running at the observation deadline as a pass
    /// rather than a timeout. Suits long-running nodes that never exit.
    #[serde(default)]
    pub pass_if_alive: bool,
}

impl App {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            image: String::new(),
            command,
            launch_prefix: Vec::new(),
            channels: Vec::new(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            ready_line: None,
            response_line: None,
            pass_if_alive: false,
        }
    }

    /// Prefix followed by command, with the image placeholder resolved.
    pub fn full_command(&self) -> Vec<String> {
        self.launch_prefix
            .iter()
            .map(|arg| arg.replace(IMAGE_PLACEHOLDER, &self.image))
            .chain(self.command.iter().cloned())
            .collect()
    }
}

/// Resolved mapping of app name to descriptor, read from `[apps.<name>]` tables.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct AppRegistry {
    apps: BTreeMap<String, App>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, app: App) {
        self.apps.insert(name.into(), app);
    }

    pub fn resolve(&self, name: &str) -> Result<&App, AppError> {
        self.apps.get(name).ok_or_else(|| AppError::Unknown {
            name: name.to_string(),
            known: self.names().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }
}

/// Per-launch settings handed to `AppInstance::start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Extra environment, applied over the app's own `env`.
    pub env: BTreeMap<String, String>,
    /// Working directory; defaults to the instance's scratch directory.
    pub working_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_command_substitutes_image_into_prefix() {
        let mut app = App::new(vec!["roslaunch".into(), "demo.launch".into()]);
        app.image = "robots/demo:1.2".into();
        app.launch_prefix = vec!["docker".into(), "run".into(), "-i".into(), "{image}".into()];
        assert_eq!(
            app.full_command(),
            vec!["docker", "run", "-i", "robots/demo:1.2", "roslaunch", "demo.launch"]
        );
    }

    #[test]
    fn app_table_parses_with_defaults() {
        let app: App = toml::from_str(
            r#"
            command = ["./node", "--fast"]
            ready-line = "READY"
            [env]
            ROS_DOMAIN_ID = "7"
            "#,
        )
        .unwrap();
        assert_eq!(app.command, vec!["./node", "--fast"]);
        assert_eq!(app.ready_line.as_deref(), Some("READY"));
        assert_eq!(app.env.get("ROS_DOMAIN_ID").map(String::as_str), Some("7"));
        assert!(app.launch_prefix.is_empty());
        assert!(!app.pass_if_alive);
    }

    #[test]
    fn unknown_app_field_is_rejected() {
        let parsed: Result<App, _> = toml::from_str("command = [\"x\"]\nlaunch-file = \"a\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn resolve_lists_known_apps_on_miss() {
        let mut registry = AppRegistry::new();
        registry.insert("talker", App::new(vec!["talker".into()]));
        registry.insert("listener", App::new(vec!["listener".into()]));
        assert!(registry.resolve("talker").is_ok());
        assert_eq!(
            registry.resolve("mapper"),
            Err(AppError::Unknown {
                name: "mapper".into(),
                known: "listener, talker".into(),
            })
        );
    }
}
