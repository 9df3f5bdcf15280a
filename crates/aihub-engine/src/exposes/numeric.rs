use aihub_contracts::catalogue::{FieldKind, ModelInfo};
use serde_json::Value;

use super::{
    data_value, delegated_bounds, BoundKind, BoundRef, Expose, FieldCore, FieldEnv, Siblings,
    Validity,
};

const DEFAULT_MIN: f64 = 0.0;
const DEFAULT_MAX: f64 = 100.0;

/// Integer, steps, float and cfg fields.
#[derive(Debug, Clone)]
pub struct NumericExpose {
    core: FieldCore,
    integral: bool,
    value: f64,
    min: f64,
    max: f64,
}

pub(crate) fn number_value(value: f64, integral: bool) -> Value {
    if integral {
        Value::from(value.round() as i64)
    } else {
        Value::from(value)
    }
}

impl NumericExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let integral = matches!(core.spec.kind, FieldKind::Integer | FieldKind::Steps);
        let min = core.spec.f64_of("min").unwrap_or(DEFAULT_MIN);
        let max = core.spec.f64_of("max").unwrap_or(DEFAULT_MAX);
        let value = initial
            .as_ref()
            .and_then(Value::as_f64)
            .or_else(|| data_value(&core.spec, "value").and_then(|value| value.as_f64()))
            .unwrap_or(min);
        let mut field = Self {
            core,
            integral,
            value,
            min,
            max,
        };
        field.clamp();
        field
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Pulls the value into `[min, max]`; returns true when it moved.
    fn clamp(&mut self) -> bool {
        let mut next = self.value;
        if next > self.max {
            next = self.max;
        }
        if next < self.min {
            next = self.min;
        }
        if self.integral {
            next = next.round();
        }
        let moved = next != self.value;
        self.value = next;
        moved
    }
}

impl Expose for NumericExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        number_value(self.value, self.integral)
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        let number = value
            .as_f64()
            .ok_or_else(|| format!("{} expects a number, got {value}", self.label()))?;
        self.value = number;
        self.clamp();
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        self.state()
    }

    fn check_validity(&self, siblings: Option<&Siblings<'_>>) -> Validity {
        if let Some(siblings) = siblings {
            if self.core.spec.bool_of("unique") && !siblings.is_unique() {
                return Validity::Invalid(format!("{} must be unique", self.label()));
            }
            if self.core.spec.bool_of("sorted") && !siblings.is_after_previous() {
                return Validity::Invalid(format!(
                    "{} must be greater than the previous value",
                    self.label()
                ));
            }
        }
        Validity::Valid
    }

    fn on_model_changed(&mut self, model: &ModelInfo) {
        if self.core.spec.bool_of("ignore_model_defaults") {
            return;
        }
        let default = match self.core.spec.kind {
            FieldKind::Steps => model.default_steps.map(|steps| steps as f64),
            FieldKind::Cfg => model.default_cfg,
            _ => None,
        };
        if let Some(default) = default {
            self.value = default;
            self.clamp();
        }
    }

    fn bound_refs(&self) -> Vec<BoundRef> {
        delegated_bounds(&self.core.spec, &[BoundKind::Min, BoundKind::Max])
    }

    fn apply_bound(&mut self, kind: BoundKind, bound: f64) -> bool {
        match kind {
            BoundKind::Min => self.min = bound,
            BoundKind::Max => self.max = bound,
            BoundKind::MinLen | BoundKind::MaxLen => return false,
        }
        self.clamp()
    }
}
