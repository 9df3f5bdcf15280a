use aihub_contracts::catalogue::{FieldKind, LoraInfo, ModelInfo};
use serde_json::{json, Map, Value};

use super::{data_value, Expose, FieldCore, FieldEnv, Siblings, Validity, MODEL_PRIORITY};

#[derive(Debug, Clone, PartialEq)]
pub struct LoraState {
    pub info: LoraInfo,
    pub enabled: bool,
    pub strength: f64,
}

impl LoraState {
    fn fresh(info: &LoraInfo) -> Self {
        Self {
            enabled: false,
            strength: info.default_strength,
            info: info.clone(),
        }
    }

    fn to_state(&self) -> Value {
        json!({"id": self.info.id, "enabled": self.enabled, "strength": self.strength})
    }
}

/// Model picker with the LoRAs eligible for the picked model.
#[derive(Debug, Clone)]
pub struct ModelExpose {
    core: FieldCore,
    models: Vec<ModelInfo>,
    all_loras: Vec<LoraInfo>,
    selected: Option<String>,
    loras: Vec<LoraState>,
}

fn parse_list<T>(value: Option<&Value>, parse: fn(&Value) -> Option<T>) -> Vec<T> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse).collect())
        .unwrap_or_default()
}

fn lora_fits(model: &ModelInfo, lora: &LoraInfo) -> bool {
    model
        .family
        .as_ref()
        .map_or(true, |family| lora.family.as_ref() == Some(family))
        && model
            .group
            .as_ref()
            .map_or(true, |group| lora.group.as_ref() == Some(group))
}

fn joined(loras: &[&LoraState], render: impl Fn(&LoraState) -> String) -> String {
    loras
        .iter()
        .map(|lora| render(*lora))
        .collect::<Vec<_>>()
        .join(",")
}

impl ModelExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let models = parse_list(core.spec.data.get("filtered_models"), ModelInfo::from_value);
        let all_loras = parse_list(core.spec.data.get("filtered_loras"), LoraInfo::from_value);
        let declared = data_value(&core.spec, "value");
        let mut field = Self {
            core,
            models,
            all_loras,
            selected: None,
            loras: Vec::new(),
        };

        let picked = [initial.as_ref(), declared.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|value| {
                let id = value
                    .as_str()
                    .or_else(|| value.get("model").and_then(Value::as_str))?;
                field.model(id).map(|_| id.to_string())
            })
            .or_else(|| field.models.first().map(|model| model.id.clone()));
        field.select(picked);
        if let Some(saved) = initial.as_ref().and_then(|value| value.get("loras")) {
            field.apply_lora_states(saved);
        }
        field
    }

    pub fn is_simple(&self) -> bool {
        self.core.spec.kind == FieldKind::ModelSimple
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn loras(&self) -> &[LoraState] {
        &self.loras
    }

    fn model(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|model| model.id == id)
    }

    fn current(&self) -> Option<&ModelInfo> {
        self.model(self.selected.as_deref()?)
    }

    /// Switches model and rebuilds the LoRA list; LoRAs present before and
    /// after keep their enabled flag and strength.
    fn select(&mut self, id: Option<String>) {
        self.selected = id;
        if self.is_simple() {
            self.loras.clear();
            return;
        }
        let Some(model) = self.current() else {
            self.loras.clear();
            return;
        };
        let eligible: Vec<LoraState> = self
            .all_loras
            .iter()
            .filter(|lora| lora_fits(model, lora))
            .map(|lora| {
                self.loras
                    .iter()
                    .find(|kept| kept.info.id == lora.id)
                    .cloned()
                    .unwrap_or_else(|| LoraState::fresh(lora))
            })
            .collect();
        self.loras = eligible;
    }

    fn apply_lora_states(&mut self, saved: &Value) {
        let Some(entries) = saved.as_array() else {
            return;
        };
        for entry in entries {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            if let Some(lora) = self.loras.iter_mut().find(|lora| lora.info.id == id) {
                if let Some(enabled) = entry.get("enabled").and_then(Value::as_bool) {
                    lora.enabled = enabled;
                }
                if let Some(strength) = entry.get("strength").and_then(Value::as_f64) {
                    lora.strength = strength;
                }
            }
        }
    }

    pub fn set_lora(&mut self, id: &str, enabled: bool, strength: f64) -> Result<(), String> {
        let lora = self
            .loras
            .iter_mut()
            .find(|lora| lora.info.id == id)
            .ok_or_else(|| format!("lora {id} is not available for this model"))?;
        lora.enabled = enabled;
        lora.strength = strength;
        Ok(())
    }
}

impl Expose for ModelExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        let mut state = Map::new();
        state.insert(
            "model".to_string(),
            self.selected.clone().map_or(Value::Null, Value::String),
        );
        if !self.is_simple() {
            state.insert(
                "loras".to_string(),
                Value::Array(self.loras.iter().map(LoraState::to_state).collect()),
            );
        }
        Value::Object(state)
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        let id = value
            .as_str()
            .or_else(|| value.get("model").and_then(Value::as_str))
            .ok_or_else(|| format!("{} expects a model id, got {value}", self.label()))?;
        if self.model(id).is_none() {
            return Err(format!("model {id} is not available for {}", self.label()));
        }
        self.select(Some(id.to_string()));
        if let Some(loras) = value.get("loras") {
            self.apply_lora_states(loras);
        }
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        let Some(model) = self.current() else {
            return Value::Null;
        };
        let mut value = Map::new();
        value.insert("model".to_string(), Value::String(model.id.clone()));
        if let Some(file) = &model.file {
            value.insert("file".to_string(), Value::String(file.clone()));
        }
        for (key, file) in &model.files {
            value.insert(key.clone(), file.clone());
        }
        if !self.is_simple() {
            let active: Vec<&LoraState> = self
                .loras
                .iter()
                .filter(|lora| lora.enabled && lora.strength > 0.0)
                .collect();
            value.insert(
                "loras".to_string(),
                Value::String(joined(&active, |lora| lora.info.file.clone())),
            );
            value.insert(
                "loras_strengths".to_string(),
                Value::String(joined(&active, |lora| lora.strength.to_string())),
            );
            value.insert(
                "loras_use_loader_model_only".to_string(),
                Value::String(joined(&active, |lora| {
                    lora.info.use_loader_model_only.to_string()
                })),
            );
        }
        Value::Object(value)
    }

    fn check_validity(&self, _siblings: Option<&Siblings<'_>>) -> Validity {
        if self.current().is_none() {
            return Validity::Invalid(format!("Select a model for {}", self.label()));
        }
        Validity::Valid
    }

    fn get_special_priority(&self) -> i64 {
        MODEL_PRIORITY
    }

    fn selected_model(&self) -> Option<ModelInfo> {
        self.current().cloned()
    }
}

#[cfg(test)]
mod tests {
    use aihub_contracts::store::FieldPath;

    use super::*;
    use crate::exposes::test_support::{env, spec};

    fn model_field(kind: FieldKind, initial: Option<Value>) -> ModelExpose {
        let data = json!({
            "label": "Model",
            "filtered_models": [
                {"id": "base", "name": "Base", "context": "image", "family": "sdxl", "file": "base.safetensors",
                 "files": {"vae": "base.vae"}},
                {"id": "other", "name": "Other", "context": "image", "family": "sd15", "file": "other.safetensors"}
            ],
            "filtered_loras": [
                {"id": "detail", "context": "image", "family": "sdxl", "file": "detail.safetensors", "default_strength": 1.0},
                {"id": "style", "context": "image", "family": "sdxl", "file": "style.safetensors", "use_loader_model_only": true},
                {"id": "old", "context": "image", "family": "sd15", "file": "old.safetensors"}
            ]
        });
        ModelExpose::new(FieldCore::new(FieldPath::single("model"), spec(kind, data)), initial)
    }

    #[test]
    fn loras_follow_model_family() -> Result<(), String> {
        let mut field = model_field(FieldKind::Model, None);
        let ids: Vec<&str> = field.loras().iter().map(|lora| lora.info.id.as_str()).collect();
        assert_eq!(ids, vec!["detail", "style"]);

        field.set_lora("detail", true, 0.5)?;
        field.set_state(json!("other"))?;
        let ids: Vec<&str> = field.loras().iter().map(|lora| lora.info.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);

        field.set_state(json!("base"))?;
        assert!(!field.loras()[0].enabled);
        Ok(())
    }

    #[test]
    fn surviving_loras_keep_their_settings() -> Result<(), String> {
        let mut field = model_field(FieldKind::Model, None);
        field.set_lora("style", true, 0.3)?;
        field.set_state(json!({"model": "base"}))?;
        let style = &field.loras()[1];
        assert!(style.enabled);
        assert_eq!(style.strength, 0.3);
        Ok(())
    }

    #[test]
    fn only_enabled_positive_loras_are_sent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let mut field = model_field(FieldKind::Model, None);
        field
            .set_lora("detail", true, 0.7)
            .map_err(anyhow::Error::msg)?;
        field
            .set_lora("style", true, 0.0)
            .map_err(anyhow::Error::msg)?;

        let value = field.get_value(&env);
        assert_eq!(value["model"], json!("base"));
        assert_eq!(value["file"], json!("base.safetensors"));
        assert_eq!(value["vae"], json!("base.vae"));
        assert_eq!(value["loras"], json!("detail.safetensors"));
        assert_eq!(value["loras_strengths"], json!("0.7"));
        assert_eq!(value["loras_use_loader_model_only"], json!("false"));
        Ok(())
    }

    #[test]
    fn saved_state_restores_model_and_loras() {
        let field = model_field(
            FieldKind::Model,
            Some(json!({"model": "base", "loras": [{"id": "style", "enabled": true, "strength": 0.4}]})),
        );
        assert_eq!(field.selected_model().map(|model| model.id), Some("base".to_string()));
        assert!(field.loras()[1].enabled);
        assert_eq!(field.loras()[1].strength, 0.4);
    }

    #[test]
    fn simple_model_has_no_lora_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let field = model_field(FieldKind::ModelSimple, Some(json!("other")));
        let value = field.get_value(&env);
        assert_eq!(value["model"], json!("other"));
        assert!(value.get("loras").is_none());
        assert!(field.loras().is_empty());
        Ok(())
    }
}
