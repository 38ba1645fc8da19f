//! Config - 실행 설정 관리
//!
//! - `exec.rs` - ExecConfig (타임아웃/길이/용량 제한, 쉘)
//! - `loader.rs` - `.forgeshell` 설정 파일 계층 로더

mod exec;
mod loader;

pub use exec::{ExecConfig, ExecSettings};
pub use loader::{load_settings_from_file, strip_json_comments, ConfigLoader, CONFIG_DIR_NAME};
