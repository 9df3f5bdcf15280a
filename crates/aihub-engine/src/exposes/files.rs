use std::path::{Path, PathBuf};

use aihub_contracts::catalogue::FieldKind;
use aihub_contracts::project::files::{numbered_files, select_indices, FILES_DIR};
use aihub_contracts::store::FieldPath;
use serde_json::{json, Value};

use super::{data_value, Expose, FieldCore, FieldEnv, Siblings, Validity};
use crate::host::ImageHost;
use crate::upload::PendingUpload;

fn read_for_upload(field: &FieldPath, path: &Path, label: &str) -> Result<PendingUpload, String> {
    let bytes = std::fs::read(path)
        .map_err(|err| format!("{label}: cannot read {}: {err}", path.display()))?;
    Ok(PendingUpload::new(field.clone(), Some(path.to_path_buf()), bytes))
}

/// Any local file, uploaded as-is.
#[derive(Debug, Clone)]
pub struct FileExpose {
    core: FieldCore,
    local_file: Option<PathBuf>,
    uploaded_server_path: Option<String>,
}

impl FileExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let mut field = Self {
            core,
            local_file: None,
            uploaded_server_path: None,
        };
        if let Some(initial) = initial {
            if let Err(err) = field.set_state(initial) {
                tracing::debug!(field = %field.core.id, "ignoring saved file: {err}");
            }
        }
        field
    }

    pub fn local_file(&self) -> Option<&Path> {
        self.local_file.as_deref()
    }
}

impl Expose for FileExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        match &self.local_file {
            Some(path) => json!({"_local_file": path.display().to_string()}),
            None => Value::Null,
        }
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        self.local_file = match &value {
            Value::Null => None,
            Value::String(path) => Some(PathBuf::from(path)),
            Value::Object(obj) => obj
                .get("_local_file")
                .and_then(Value::as_str)
                .map(PathBuf::from),
            other => return Err(format!("{} expects a file path, got {other}", self.label())),
        };
        self.uploaded_server_path = None;
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        if self.local_file.is_none() {
            return Value::Null;
        }
        json!({"local_file": self.uploaded_server_path})
    }

    fn check_validity(&self, _siblings: Option<&Siblings<'_>>) -> Validity {
        let present = self.local_file.as_deref().is_some_and(Path::is_file);
        if present || self.core.spec.bool_of("optional") {
            Validity::Valid
        } else {
            Validity::Invalid(format!("{}: no file selected", self.label()))
        }
    }

    fn upload_binary(
        &mut self,
        _host: &mut dyn ImageHost,
        _env: &FieldEnv<'_>,
    ) -> Result<Vec<PendingUpload>, String> {
        self.uploaded_server_path = None;
        match self.local_file.as_deref().filter(|path| path.is_file()) {
            Some(path) => Ok(vec![read_for_upload(&self.core.id, path, &self.label())?]),
            None if self.core.spec.bool_of("optional") => Ok(Vec::new()),
            None => Err(format!("{}: no file selected", self.label())),
        }
    }

    fn accept_upload(&mut self, field: &FieldPath, server_path: &str) {
        if field == &self.core.id {
            self.uploaded_server_path = Some(server_path.to_string());
        }
    }
}

/// Files the server stored in the current timeline's `files/` folder,
/// picked by `data.file_name` plus an index selector.
///
/// The selector (`data.indices`, editable by the user) accepts `3`, `-1`,
/// `0,2,+frames.current` or `start:end`. A single project file defaults to
/// the newest match, a batch to all matches.
#[derive(Debug, Clone)]
pub struct ProjectFileExpose {
    core: FieldCore,
    selector: String,
    uploaded: Vec<(FieldPath, u64, Option<String>)>,
}

impl ProjectFileExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let fallback = if core.spec.kind == FieldKind::ProjectFilesBatch { "" } else { "-1" };
        let selector = initial
            .or_else(|| data_value(&core.spec, "indices"))
            .map(|value| match value {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .unwrap_or_else(|| fallback.to_string());
        Self {
            core,
            selector,
            uploaded: Vec::new(),
        }
    }

    fn is_batch(&self) -> bool {
        self.core.spec.kind == FieldKind::ProjectFilesBatch
    }

    fn file_name(&self) -> &str {
        self.core.spec.str_of("file_name").unwrap_or("")
    }

    /// Matching files, in selector order, with their numeric suffix.
    pub fn resolve(&self, env: &FieldEnv<'_>) -> Result<Vec<(u64, PathBuf)>, String> {
        let file_name = self.file_name();
        if file_name.is_empty() {
            return Err(format!("{} does not name a project file", self.label()));
        }
        let mut candidates = numbered_files(env.routing_dir, file_name);
        if candidates.is_empty() {
            let exact = env.routing_dir.join(FILES_DIR).join(file_name);
            if exact.is_file() {
                candidates.push((0, exact));
            }
        }
        if candidates.is_empty() {
            return Err(format!("{}: no files named {file_name} in this timeline", self.label()));
        }
        let picked = select_indices(&self.selector, candidates.len(), env.config)
            .map_err(|err| format!("{}: {err}", self.label()))?;
        let mut files: Vec<(u64, PathBuf)> = picked
            .into_iter()
            .filter_map(|index| candidates.get(index).cloned())
            .collect();
        if !self.is_batch() {
            files.truncate(1);
        }
        Ok(files)
    }

    fn entry(&self, index: usize) -> Value {
        self.uploaded
            .get(index)
            .map_or(Value::Null, |(_, number, server_path)| {
                json!({"local_file": server_path, "file_index": number})
            })
    }
}

impl Expose for ProjectFileExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        Value::String(self.selector.clone())
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        self.selector = match value {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Null => String::new(),
            other => return Err(format!("{} expects an index selector, got {other}", self.label())),
        };
        self.uploaded.clear();
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        if self.is_batch() {
            Value::Array((0..self.uploaded.len()).map(|index| self.entry(index)).collect())
        } else {
            self.entry(0)
        }
    }

    fn can_run(&self, env: &FieldEnv<'_>, _siblings: Option<&Siblings<'_>>) -> bool {
        self.core.spec.bool_of("optional") || self.resolve(env).is_ok_and(|files| !files.is_empty())
    }

    fn upload_binary(
        &mut self,
        _host: &mut dyn ImageHost,
        env: &FieldEnv<'_>,
    ) -> Result<Vec<PendingUpload>, String> {
        self.uploaded.clear();
        let files = match self.resolve(env) {
            Ok(files) => files,
            Err(_) if self.core.spec.bool_of("optional") => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let label = self.label();
        let mut uploads = Vec::with_capacity(files.len());
        for (position, (number, path)) in files.iter().enumerate() {
            let id = if self.is_batch() {
                self.core.id.push_index(position)
            } else {
                self.core.id.clone()
            };
            uploads.push(read_for_upload(&id, path, &label)?);
            self.uploaded.push((id, *number, None));
        }
        Ok(uploads)
    }

    fn accept_upload(&mut self, field: &FieldPath, server_path: &str) {
        if let Some(entry) = self.uploaded.iter_mut().find(|(id, _, _)| id == field) {
            entry.2 = Some(server_path.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::exposes::test_support::{env, spec};
    use crate::host::NullHost;

    fn project_field(kind: FieldKind, data: Value, initial: Option<Value>) -> ProjectFileExpose {
        ProjectFileExpose::new(FieldCore::new(FieldPath::single("frames"), spec(kind, data)), initial)
    }

    fn seed_files(dir: &Path, names: &[&str]) -> anyhow::Result<()> {
        let files = dir.join(FILES_DIR);
        std::fs::create_dir_all(&files)?;
        for name in names {
            std::fs::write(files.join(name), name.as_bytes())?;
        }
        Ok(())
    }

    #[test]
    fn single_project_file_defaults_to_newest() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        seed_files(temp.path(), &["frame_2.png", "frame_10.png", "frame_1.png", "other_3.png"])?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let mut field = project_field(FieldKind::ProjectFile, json!({"file_name": "frame.png"}), None);
        let files = field.resolve(&env).map_err(anyhow::Error::msg)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, 10);

        let uploads = field.upload_binary(&mut NullHost, &env).map_err(anyhow::Error::msg)?;
        field.accept_upload(&uploads[0].field, "srv/frame.png");
        assert_eq!(field.get_value(&env), json!({"local_file": "srv/frame.png", "file_index": 10}));
        Ok(())
    }

    #[test]
    fn batch_selects_by_config_range() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        seed_files(temp.path(), &["f_1.png", "f_2.png", "f_3.png", "f_4.png"])?;
        let config = json!({"start": 1}).as_object().cloned().unwrap_or_default();
        let env = env(temp.path(), &config);
        let mut field = project_field(
            FieldKind::ProjectFilesBatch,
            json!({"file_name": "f.png", "indices": "+start:-1"}),
            None,
        );
        let uploads = field.upload_binary(&mut NullHost, &env).map_err(anyhow::Error::msg)?;
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].field, FieldPath::single("frames").push_index(0));
        let value = field.get_value(&env);
        assert_eq!(value[1]["file_index"], json!(3));
        Ok(())
    }

    #[test]
    fn out_of_range_fails_unless_optional() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        seed_files(temp.path(), &["f_1.png"])?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let mut strict = project_field(FieldKind::ProjectFile, json!({"label": "Frame", "file_name": "f.png"}), Some(json!("4")));
        assert!(!strict.can_run(&env, None));
        let err = strict.upload_binary(&mut NullHost, &env).err().unwrap_or_default();
        assert!(err.starts_with("Frame: index 4 is out of range"));

        let mut optional = project_field(
            FieldKind::ProjectFile,
            json!({"file_name": "f.png", "optional": true}),
            Some(json!("4")),
        );
        assert!(optional.can_run(&env, None));
        assert_eq!(optional.upload_binary(&mut NullHost, &env), Ok(Vec::new()));
        assert_eq!(optional.get_value(&env), Value::Null);
        Ok(())
    }

    #[test]
    fn replaced_file_without_suffix_is_found() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        seed_files(temp.path(), &["mask.png"])?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let field = project_field(FieldKind::ProjectFile, json!({"file_name": "mask.png"}), None);
        let files = field.resolve(&env).map_err(anyhow::Error::msg)?;
        assert_eq!(files[0].1, temp.path().join(FILES_DIR).join("mask.png"));
        Ok(())
    }

    #[test]
    fn plain_file_uploads_raw_bytes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("notes.txt");
        std::fs::write(&path, b"hello")?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let mut field = FileExpose::new(
            FieldCore::new(FieldPath::single("doc"), spec(FieldKind::File, json!({}))),
            Some(Value::String(path.display().to_string())),
        );
        let uploads = field.upload_binary(&mut NullHost, &env).map_err(anyhow::Error::msg)?;
        assert_eq!(uploads[0].bytes, b"hello");
        assert_eq!(uploads[0].extension, ".txt");
        field.accept_upload(&FieldPath::single("doc"), "srv/notes.txt");
        assert_eq!(field.get_value(&env), json!({"local_file": "srv/notes.txt"}));
        Ok(())
    }
}
