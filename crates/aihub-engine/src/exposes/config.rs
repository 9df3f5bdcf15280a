use aihub_contracts::catalogue::FieldKind;
use aihub_contracts::store::get_dot_path;
use serde_json::Value;

use super::{data_value, Expose, FieldCore, FieldEnv};

/// Read-only field whose value comes from the timeline's `config.json`
/// at the dot path in `data.field`, falling back to `data.default` when the
/// key is missing or holds the wrong type.
#[derive(Debug, Clone)]
pub struct ConfigExpose {
    core: FieldCore,
}

impl ConfigExpose {
    pub fn new(core: FieldCore) -> Self {
        Self { core }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self.core.spec.kind {
            FieldKind::ConfigString => value.is_string(),
            FieldKind::ConfigInteger => value.is_i64() || value.is_u64(),
            FieldKind::ConfigBoolean => value.is_boolean(),
            FieldKind::ConfigFloat => value.is_number(),
            _ => false,
        }
    }
}

impl Expose for ConfigExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        Value::Null
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }
        Err(format!("{} is read from the project config", self.label()))
    }

    fn get_value(&self, env: &FieldEnv<'_>) -> Value {
        self.core
            .spec
            .str_of("field")
            .and_then(|field| get_dot_path(env.config, field))
            .filter(|value| self.accepts(value))
            .cloned()
            .or_else(|| data_value(&self.core.spec, "default"))
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use aihub_contracts::store::FieldPath;
    use serde_json::{json, Map};

    use super::*;
    use crate::exposes::test_support::{env, spec};

    fn config_field(kind: FieldKind, data: Value) -> ConfigExpose {
        ConfigExpose::new(FieldCore::new(FieldPath::single("cfg"), spec(kind, data)))
    }

    #[test]
    fn reads_dot_path_with_type_check() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config: Map<String, Value> = json!({"render": {"fps": 24, "title": "clip"}})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let env = env(temp.path(), &config);

        let fps = config_field(FieldKind::ConfigInteger, json!({"field": "render.fps", "default": 12}));
        assert_eq!(fps.get_value(&env), json!(24));

        let wrong_type = config_field(FieldKind::ConfigInteger, json!({"field": "render.title", "default": 12}));
        assert_eq!(wrong_type.get_value(&env), json!(12));

        let missing = config_field(FieldKind::ConfigBoolean, json!({"field": "render.loop"}));
        assert_eq!(missing.get_value(&env), Value::Null);

        let float = config_field(FieldKind::ConfigFloat, json!({"field": "render.fps"}));
        assert_eq!(float.get_value(&env), json!(24));
        Ok(())
    }

    #[test]
    fn config_fields_are_not_editable() {
        let mut field = config_field(FieldKind::ConfigString, json!({"label": "Title", "field": "t"}));
        assert!(field.set_state(Value::Null).is_ok());
        assert!(field.set_state(json!("x")).is_err());
        assert_eq!(field.state(), Value::Null);
    }
}
