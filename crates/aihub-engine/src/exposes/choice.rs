use aihub_contracts::catalogue::{split_lines, FieldKind, ModelInfo};
use serde_json::Value;

use super::{data_value, Expose, FieldCore, FieldEnv, Siblings, Validity};

#[derive(Debug, Clone)]
pub struct BooleanExpose {
    core: FieldCore,
    value: bool,
}

impl BooleanExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let value = initial
            .and_then(|value| value.as_bool())
            .or_else(|| data_value(&core.spec, "value").and_then(|value| value.as_bool()))
            .unwrap_or(false);
        Self { core, value }
    }
}

impl Expose for BooleanExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        Value::Bool(self.value)
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        self.value = value
            .as_bool()
            .ok_or_else(|| format!("{} expects true or false, got {value}", self.label()))?;
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        self.state()
    }

    fn can_run(&self, _env: &FieldEnv<'_>, _siblings: Option<&Siblings<'_>>) -> bool {
        true
    }
}

/// String selection, sampler and scheduler fields: the state is an option
/// token, never its display label.
#[derive(Debug, Clone)]
pub struct ChoiceExpose {
    core: FieldCore,
    options: Vec<(String, String)>,
    value: Option<String>,
}

impl ChoiceExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let tokens = split_lines(core.spec.str_of("options").unwrap_or(""));
        let labels = split_lines(core.spec.str_of("options_label").unwrap_or(""));
        let options: Vec<(String, String)> = tokens
            .into_iter()
            .enumerate()
            .map(|(index, token)| {
                let label = labels.get(index).cloned().unwrap_or_else(|| token.clone());
                (token, label)
            })
            .collect();

        let mut field = Self {
            core,
            options,
            value: None,
        };
        let declared = data_value(&field.core.spec, "value");
        field.value = [initial, declared]
            .into_iter()
            .flatten()
            .filter_map(|value| value.as_str().map(str::to_string))
            .find(|token| field.has_option(token))
            .or_else(|| field.options.first().map(|(token, _)| token.clone()));
        field
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    pub fn selected(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn has_option(&self, token: &str) -> bool {
        self.options.iter().any(|(candidate, _)| candidate == token)
    }

    fn model_default<'a>(&self, model: &'a ModelInfo) -> Option<&'a str> {
        match self.core.spec.kind {
            FieldKind::Sampler => model.default_sampler.as_deref(),
            FieldKind::Scheduler | FieldKind::ExtendableScheduler => {
                model.default_scheduler.as_deref()
            }
            _ => None,
        }
    }
}

impl Expose for ChoiceExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        self.value.clone().map_or(Value::Null, Value::String)
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        let token = value
            .as_str()
            .ok_or_else(|| format!("{} expects an option, got {value}", self.label()))?;
        if !self.has_option(token) {
            return Err(format!("{token} is not an option of {}", self.label()));
        }
        self.value = Some(token.to_string());
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        self.state()
    }

    fn check_validity(&self, _siblings: Option<&Siblings<'_>>) -> Validity {
        if self.value.is_none() {
            return Validity::Invalid(format!("Select a value for {}", self.label()));
        }
        Validity::Valid
    }

    fn on_model_changed(&mut self, model: &ModelInfo) {
        if !self.core.spec.kind.follows_model_choice()
            || self.core.spec.bool_of("ignore_model_defaults")
        {
            return;
        }
        if let Some(default) = self.model_default(model) {
            if self.has_option(default) {
                self.value = Some(default.to_string());
            }
        }
    }
}
