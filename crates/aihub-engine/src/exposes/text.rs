use serde_json::Value;

use super::{
    data_value, delegated_bounds, BoundKind, BoundRef, Expose, FieldCore, FieldEnv, Siblings,
    Validity, MULTILINE_PRIORITY,
};

#[derive(Debug, Clone)]
pub struct TextExpose {
    core: FieldCore,
    value: String,
    minlen: Option<usize>,
    maxlen: Option<usize>,
}

fn length_bound(raw: f64) -> usize {
    if raw <= 0.0 {
        0
    } else {
        raw.round() as usize
    }
}

impl TextExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let value = initial
            .or_else(|| data_value(&core.spec, "value"))
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            minlen: core.spec.f64_of("minlen").map(length_bound),
            maxlen: core.spec.f64_of("maxlen").map(length_bound),
            core,
            value,
        }
    }

    pub fn is_multiline(&self) -> bool {
        self.core.spec.bool_of("multiline")
    }

    pub fn length_bounds(&self) -> (Option<usize>, Option<usize>) {
        (self.minlen, self.maxlen)
    }
}

impl Expose for TextExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        Value::String(self.value.clone())
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        self.value = match value {
            Value::String(text) => text,
            Value::Null => String::new(),
            Value::Number(number) => number.to_string(),
            other => return Err(format!("{} expects text, got {other}", self.label())),
        };
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        self.state()
    }

    fn check_validity(&self, siblings: Option<&Siblings<'_>>) -> Validity {
        let length = self.value.chars().count();
        if let Some(minlen) = self.minlen {
            if length < minlen {
                return Validity::Invalid(format!(
                    "{} must be at least {minlen} characters long",
                    self.label()
                ));
            }
        }
        if let Some(maxlen) = self.maxlen {
            if length > maxlen {
                return Validity::Invalid(format!(
                    "{} must be at most {maxlen} characters long",
                    self.label()
                ));
            }
        }
        if let Some(siblings) = siblings {
            if self.core.spec.bool_of("unique") && !siblings.is_unique() {
                return Validity::Invalid(format!("{} must be unique", self.label()));
            }
            if self.core.spec.bool_of("sorted") && !siblings.is_after_previous() {
                return Validity::Invalid(format!("{} must sort after the previous value", self.label()));
            }
        }
        Validity::Valid
    }

    fn get_special_priority(&self) -> i64 {
        if self.is_multiline() {
            MULTILINE_PRIORITY
        } else {
            0
        }
    }

    fn bound_refs(&self) -> Vec<BoundRef> {
        delegated_bounds(&self.core.spec, &[BoundKind::MinLen, BoundKind::MaxLen])
    }

    fn apply_bound(&mut self, kind: BoundKind, bound: f64) -> bool {
        match kind {
            BoundKind::MinLen => self.minlen = Some(length_bound(bound)),
            BoundKind::MaxLen => self.maxlen = Some(length_bound(bound)),
            BoundKind::Min | BoundKind::Max => {}
        }
        false
    }
}
