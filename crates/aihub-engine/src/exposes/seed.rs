use rand::Rng;
use serde_json::{json, Value};

use super::{data_value, Expose, FieldCore, FieldEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    Random,
    Fixed,
}

impl SeedMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "random" => Some(SeedMode::Random),
            "fixed" => Some(SeedMode::Fixed),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SeedMode::Random => "random",
            SeedMode::Fixed => "fixed",
        }
    }
}

/// Random or fixed seed. In random mode every `get_value` draws a new seed.
#[derive(Debug, Clone)]
pub struct SeedExpose {
    core: FieldCore,
    mode: SeedMode,
    fixed: u64,
    min: u64,
    max: u64,
}

fn as_seed(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|float| *float >= 0.0).map(|float| float as u64))
}

impl SeedExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let min = core.spec.data.get("min").and_then(as_seed).unwrap_or(0);
        let max = core.spec.data.get("max").and_then(as_seed).unwrap_or(u64::MAX);
        let declared = data_value(&core.spec, "value").map(|mode| {
            json!({
                "value": mode,
                "value_fixed": core.spec.data.get("value_fixed").cloned().unwrap_or(json!(0)),
            })
        });
        let initial = initial.filter(Value::is_object).or(declared);

        let mut field = Self {
            core,
            mode: SeedMode::Random,
            fixed: 0,
            min,
            max: max.max(min),
        };
        if let Some(initial) = initial {
            field.apply(&initial);
        }
        field
    }

    pub fn mode(&self) -> SeedMode {
        self.mode
    }

    fn apply(&mut self, value: &Value) {
        if let Some(mode) = value
            .get("value")
            .and_then(Value::as_str)
            .and_then(SeedMode::parse)
        {
            self.mode = mode;
        }
        if let Some(fixed) = value.get("value_fixed").and_then(as_seed) {
            self.fixed = fixed.clamp(self.min, self.max);
        }
    }
}

impl Expose for SeedExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        json!({"value": self.mode.as_str(), "value_fixed": self.fixed})
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        match &value {
            Value::Object(_) => self.apply(&value),
            Value::String(mode) => {
                self.mode = SeedMode::parse(mode)
                    .ok_or_else(|| format!("{} expects random or fixed, got {mode}", self.label()))?;
            }
            other => {
                let fixed = as_seed(other)
                    .ok_or_else(|| format!("{} expects a seed, got {other}", self.label()))?;
                self.mode = SeedMode::Fixed;
                self.fixed = fixed.clamp(self.min, self.max);
            }
        }
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        match self.mode {
            SeedMode::Fixed => Value::from(self.fixed),
            SeedMode::Random => Value::from(rand::thread_rng().gen_range(self.min..=self.max)),
        }
    }
}

#[cfg(test)]
mod tests {
    use aihub_contracts::catalogue::FieldKind;
    use aihub_contracts::store::FieldPath;
    use serde_json::Map;

    use super::*;
    use crate::exposes::test_support::{env, spec};

    fn seed(data: Value, initial: Option<Value>) -> SeedExpose {
        SeedExpose::new(FieldCore::new(FieldPath::single("seed"), spec(FieldKind::Seed, data)), initial)
    }

    #[test]
    fn random_mode_draws_fresh_values() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let field = seed(json!({}), None);
        assert_eq!(field.mode(), SeedMode::Random);
        let draws: Vec<Value> = (0..4).map(|_| field.get_value(&env)).collect();
        assert!(draws.iter().all(Value::is_u64));
        assert!(draws.windows(2).any(|pair| pair[0] != pair[1]));
        Ok(())
    }

    #[test]
    fn fixed_mode_is_stable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let field = seed(json!({}), Some(json!({"value": "fixed", "value_fixed": 1234})));
        assert_eq!(field.get_value(&env), json!(1234));
        assert_eq!(field.get_value(&env), json!(1234));
        assert_eq!(field.state(), json!({"value": "fixed", "value_fixed": 1234}));
        Ok(())
    }

    #[test]
    fn declared_default_and_plain_number_state() -> Result<(), String> {
        let mut field = seed(json!({"value": "fixed", "value_fixed": 9, "max": 100}), None);
        assert_eq!(field.state(), json!({"value": "fixed", "value_fixed": 9}));
        field.set_state(json!(500))?;
        assert_eq!(field.state(), json!({"value": "fixed", "value_fixed": 100}));
        field.set_state(json!("random"))?;
        assert_eq!(field.mode(), SeedMode::Random);
        assert!(field.set_state(json!("sometimes")).is_err());
        Ok(())
    }
}
