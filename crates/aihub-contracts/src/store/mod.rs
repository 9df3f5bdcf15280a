pub mod config;
pub mod dot_path;
pub mod values;

pub use config::{base_dir, HubConfig, CONFIG_FILE_NAME, SAVED_FILE_NAME};
pub use dot_path::{get_dot_path, read_config_json, set_dot_path, write_config_value};
pub use values::{FieldPath, PathSegment, SavedValueStore};

/// Keys the controller remembers between sessions, stored in `saved.json`
/// under an empty context.
pub mod memory {
    pub const DEFAULT_CONTEXT: &str = "default_context";
    pub const DEFAULT_CATEGORY: &str = "default_category";
    pub const DEFAULT_WORKFLOW: &str = "default_workflow";
    pub const LAST_OPENED_PROJECT: &str = "last_opened_project";
}
