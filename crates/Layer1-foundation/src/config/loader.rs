//! `.forgeshell` settings files
//!
//! 계층 순서 (뒤가 이김):
//!
//! 1. `~/.forgeshell/settings.json`
//! 2. `<dir>/.forgeshell/settings.json`
//! 3. `<dir>/.forgeshell/settings.local.json`
//!
//! 파일마다 지정한 필드만 덮어씁니다. JSON 안의 `//`, `/* */` 주석은 허용됩니다.

use super::exec::{ExecConfig, ExecSettings};
use crate::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CONFIG_DIR_NAME: &str = ".forgeshell";

const SETTINGS_FILE: &str = "settings.json";
const LOCAL_SETTINGS_FILE: &str = "settings.local.json";

/// Where a settings file sits in the override order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingsLayer {
    User,
    Project,
    Local,
    Custom(usize),
}

impl fmt::Display for SettingsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsLayer::User => f.write_str("user settings"),
            SettingsLayer::Project => f.write_str("project settings"),
            SettingsLayer::Local => f.write_str("local settings"),
            SettingsLayer::Custom(n) => write!(f, "settings layer #{}", n),
        }
    }
}

/// Layered settings loader
pub struct ConfigLoader {
    layers: Vec<(SettingsLayer, PathBuf)>,
}

impl ConfigLoader {
    /// Standard layers for `working_dir`
    pub fn new(working_dir: &Path) -> Self {
        let project = working_dir.join(CONFIG_DIR_NAME);
        let user = dirs::home_dir().map(|home| {
            let path = home.join(CONFIG_DIR_NAME).join(SETTINGS_FILE);
            (SettingsLayer::User, path)
        });

        let layers = user
            .into_iter()
            .chain([
                (SettingsLayer::Project, project.join(SETTINGS_FILE)),
                (SettingsLayer::Local, project.join(LOCAL_SETTINGS_FILE)),
            ])
            .collect();
        Self { layers }
    }

    /// Explicit files, lowest precedence first
    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        let layers = paths
            .into_iter()
            .enumerate()
            .map(|(n, path)| (SettingsLayer::Custom(n), path))
            .collect();
        Self { layers }
    }

    /// Merge every existing layer over the defaults
    ///
    /// A layer that cannot be read or parsed is logged and ignored; the merged
    /// result must still validate.
    pub fn load_all(&self) -> Result<ExecConfig> {
        let mut config = ExecConfig::default();

        for (layer, path) in self.layers.iter().filter(|(_, path)| path.is_file()) {
            match load_settings_from_file(path) {
                Ok(settings) => {
                    info!("Applying {} ({})", layer, path.display());
                    config.apply(settings);
                }
                Err(e) => warn!("Ignoring {} ({}): {}", layer, path.display(), e),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus a single file; read or parse failures are errors here
    pub fn load_from(path: &Path) -> Result<ExecConfig> {
        let mut config = ExecConfig::default();
        config.apply(load_settings_from_file(path)?);
        config.validate()?;
        Ok(config)
    }

    pub fn existing_files(&self) -> Vec<PathBuf> {
        self.layers
            .iter()
            .filter(|(_, path)| path.is_file())
            .map(|(_, path)| path.clone())
            .collect()
    }
}

/// Parse one settings layer
pub fn load_settings_from_file(path: &Path) -> Result<ExecSettings> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

    let settings: ExecSettings = serde_json::from_str(&strip_json_comments(&raw))
        .map_err(|e| Error::Config(format!("invalid settings in {}: {}", path.display(), e)))?;

    debug!("{}: {:?}", path.display(), settings);
    Ok(settings)
}

/// Remove `//` and `/* */` comments outside string literals
///
/// Line comments keep their terminating newline so error positions stay put.
pub fn strip_json_comments(input: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Str,
        StrEscape,
        LineComment,
        BlockComment,
        BlockCommentStar,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        state = match (state, c) {
            (State::Code, '/') if chars.peek() == Some(&'/') => {
                chars.next();
                State::LineComment
            }
            (State::Code, '/') if chars.peek() == Some(&'*') => {
                chars.next();
                State::BlockComment
            }
            (State::Code, '"') => {
                out.push(c);
                State::Str
            }
            (State::Code, _) => {
                out.push(c);
                State::Code
            }
            (State::Str, '\\') => {
                out.push(c);
                State::StrEscape
            }
            (State::Str, '"') | (State::StrEscape, _) => {
                out.push(c);
                if state == State::Str { State::Code } else { State::Str }
            }
            (State::Str, _) => {
                out.push(c);
                State::Str
            }
            (State::LineComment, '\n') => {
                out.push(c);
                State::Code
            }
            (State::LineComment, _) => State::LineComment,
            (State::BlockComment | State::BlockCommentStar, '*') => State::BlockCommentStar,
            (State::BlockCommentStar, '/') => State::Code,
            (State::BlockComment | State::BlockCommentStar, _) => State::BlockComment,
        };
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::ShellType;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_standard_layers_order() {
        let loader = ConfigLoader::new(Path::new("/work"));
        let kinds: Vec<_> = loader.layers.iter().map(|(layer, _)| *layer).collect();
        assert_eq!(kinds.last(), Some(&SettingsLayer::Local));
        assert!(kinds.contains(&SettingsLayer::Project));
        assert!(loader.layers.last().unwrap().1.ends_with(".forgeshell/settings.local.json"));
    }

    #[test]
    fn test_settings_with_comments() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("settings.json");
        fs::write(
            &file,
            r#"{
                // 작은 용량
                "maxBackgroundTasks": 4,
                "shell": "bash" /* posix */
            }"#,
        )
        .unwrap();

        let settings = load_settings_from_file(&file).unwrap();
        assert_eq!(settings.max_background_tasks, Some(4));
        assert_eq!(settings.shell, Some(ShellType::Bash));
        assert_eq!(settings.min_timeout_ms, None);
    }

    #[test]
    fn test_later_layer_overrides_fields() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.json");
        let overlay = dir.path().join("overlay.json");
        fs::write(&base, r#"{"maxBackgroundTasks": 4, "drainTimeoutMs": 100}"#).unwrap();
        fs::write(&overlay, r#"{"maxBackgroundTasks": 8}"#).unwrap();

        let loader = ConfigLoader::with_paths(vec![base, overlay, dir.path().join("absent.json")]);
        assert_eq!(loader.existing_files().len(), 2);

        let config = loader.load_all().unwrap();
        assert_eq!(config.max_background_tasks, 8);
        assert_eq!(config.drain_timeout_ms, 100);
    }

    #[test]
    fn test_broken_layer_ignored_by_load_all() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();

        let config = ConfigLoader::with_paths(vec![bad.clone()]).load_all().unwrap();
        assert_eq!(config, ExecConfig::default());
        assert!(matches!(ConfigLoader::load_from(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_validates() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("settings.json");
        fs::write(&file, r#"{"maxBackgroundTasks": 0}"#).unwrap();

        assert!(ConfigLoader::load_from(&file).is_err());
        assert!(ConfigLoader::load_from(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let input = "{\"url\": \"http://x//y\", \"q\": \"a\\\"/*b\", /* c */ \"n\": 1} // tail\n";
        assert_eq!(
            strip_json_comments(input),
            "{\"url\": \"http://x//y\", \"q\": \"a\\\"/*b\",  \"n\": 1} \n"
        );
    }

    #[test]
    fn test_block_comment_with_stars() {
        assert_eq!(strip_json_comments("1/* ** x **/2"), "12");
    }
}
