//! Per-item metadata columns declared inline by batch fields.
//!
//! Each non-empty line of `data.metadata` reads
//! `<fieldId> <TYPE> [MAX:n] [MIN:n] [MAXLEN:n] [MINLEN:n] [DEFAULT:v] [LABEL:text] [UNIQUE] [SORTED] [OPTIONAL]`.
//! Bound values that are not numbers name another field whose value becomes
//! the bound; `MAX_OFFSET:n` style keys add a constant to it. Tokens follow
//! shell quoting, so `DEFAULT:"two words"` is one token.

use serde_json::{Map, Number, Value};

use super::{FieldKind, FieldSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct MetaColumn {
    pub id: String,
    pub spec: FieldSpec,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("metadata line {line}: {reason}")]
    Invalid { line: usize, reason: String },
}

const BOUND_KEYS: &[(&str, &str)] = &[
    ("MAX", "max"),
    ("MIN", "min"),
    ("MAXLEN", "maxlen"),
    ("MINLEN", "minlen"),
];

pub fn parse_metadata(raw: &str) -> Result<Vec<MetaColumn>, MetaError> {
    let mut columns: Vec<MetaColumn> = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line_no = index + 1;
        let invalid = |reason: String| MetaError::Invalid {
            line: line_no,
            reason,
        };
        if line.trim().is_empty() {
            continue;
        }
        let tokens = shell_words::split(line).map_err(|err| invalid(err.to_string()))?;
        let mut tokens = tokens.into_iter();
        let id = tokens
            .next()
            .ok_or_else(|| invalid("missing field id".to_string()))?;
        if id == "value" {
            return Err(invalid("'value' is reserved for the item itself".to_string()));
        }
        if columns.iter().any(|column| column.id == id) {
            return Err(invalid(format!("duplicate column '{id}'")));
        }
        let type_token = tokens
            .next()
            .ok_or_else(|| invalid(format!("column '{id}' has no type")))?;
        let kind = match type_token.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" => FieldKind::Integer,
            "FLOAT" | "NUMBER" => FieldKind::Float,
            "STRING" | "TEXT" => FieldKind::Text,
            "BOOLEAN" | "BOOL" => FieldKind::Boolean,
            other => return Err(invalid(format!("unknown column type '{other}'"))),
        };

        let mut data = Map::new();
        data.insert("label".to_string(), Value::String(id.clone()));
        for token in tokens {
            match token.split_once(':') {
                Some((key, raw_value)) => {
                    apply_option(&mut data, kind, key, raw_value).map_err(invalid)?
                }
                None => match token.to_ascii_uppercase().as_str() {
                    "UNIQUE" => {
                        data.insert("unique".to_string(), Value::Bool(true));
                    }
                    "SORTED" => {
                        data.insert("sorted".to_string(), Value::Bool(true));
                    }
                    "OPTIONAL" => {
                        data.insert("optional".to_string(), Value::Bool(true));
                    }
                    "MULTILINE" => {
                        data.insert("multiline".to_string(), Value::Bool(true));
                    }
                    other => return Err(invalid(format!("unknown flag '{other}'"))),
                },
            }
        }
        columns.push(MetaColumn {
            id,
            spec: FieldSpec { kind, data },
        });
    }
    Ok(columns)
}

fn apply_option(
    data: &mut Map<String, Value>,
    kind: FieldKind,
    key: &str,
    raw_value: &str,
) -> Result<(), String> {
    let upper = key.to_ascii_uppercase();
    if let Some((_, name)) = BOUND_KEYS.iter().find(|(token, _)| *token == upper) {
        match parse_number(raw_value) {
            Some(number) => {
                data.insert(name.to_string(), Value::Number(number));
            }
            None if !raw_value.trim().is_empty() => {
                data.insert(
                    format!("{name}_expose_id"),
                    Value::String(raw_value.trim().to_string()),
                );
            }
            None => return Err(format!("{upper} needs a value")),
        }
        return Ok(());
    }
    if let Some(bound) = upper.strip_suffix("_OFFSET") {
        let Some((_, name)) = BOUND_KEYS.iter().find(|(token, _)| *token == bound) else {
            return Err(format!("unknown option '{key}'"));
        };
        let number =
            parse_number(raw_value).ok_or_else(|| format!("{upper} must be a number"))?;
        data.insert(format!("{name}_expose_offset"), Value::Number(number));
        return Ok(());
    }
    match upper.as_str() {
        "DEFAULT" => {
            data.insert("value".to_string(), default_value(kind, raw_value)?);
        }
        "LABEL" => {
            data.insert("label".to_string(), Value::String(raw_value.to_string()));
        }
        "STEP" => {
            let number =
                parse_number(raw_value).ok_or_else(|| "STEP must be a number".to_string())?;
            data.insert("step".to_string(), Value::Number(number));
        }
        _ => return Err(format!("unknown option '{key}'")),
    }
    Ok(())
}

fn parse_number(raw: &str) -> Option<Number> {
    let raw = raw.trim();
    if let Ok(int) = raw.parse::<i64>() {
        return Some(Number::from(int));
    }
    raw.parse::<f64>().ok().and_then(Number::from_f64)
}

fn default_value(kind: FieldKind, raw: &str) -> Result<Value, String> {
    match kind {
        FieldKind::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Value::Bool(true)),
            "false" | "0" | "no" => Ok(Value::Bool(false)),
            other => Err(format!("'{other}' is not a boolean")),
        },
        FieldKind::Integer => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("'{raw}' is not an integer")),
        FieldKind::Float => parse_number(raw)
            .map(Value::Number)
            .ok_or_else(|| format!("'{raw}' is not a number")),
        _ => Ok(Value::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_columns_with_bounds_and_flags() -> anyhow::Result<()> {
        let columns = parse_metadata(
            "frame INTEGER MIN:0 MAX:frame_count MAX_OFFSET:-1 UNIQUE SORTED\n\n\
             caption STRING MAXLEN:40 DEFAULT:\"a quiet street\"\n\
             strength FLOAT DEFAULT:0.5\n\
             keep BOOLEAN DEFAULT:true OPTIONAL",
        )?;
        assert_eq!(columns.len(), 4);

        let frame = &columns[0];
        assert_eq!(frame.id, "frame");
        assert_eq!(frame.spec.kind, FieldKind::Integer);
        assert_eq!(frame.spec.data.get("min"), Some(&json!(0)));
        assert_eq!(frame.spec.data.get("max_expose_id"), Some(&json!("frame_count")));
        assert_eq!(frame.spec.data.get("max_expose_offset"), Some(&json!(-1)));
        assert!(frame.spec.bool_of("unique"));
        assert!(frame.spec.bool_of("sorted"));

        assert_eq!(columns[1].spec.data.get("value"), Some(&json!("a quiet street")));
        assert_eq!(columns[1].spec.data.get("maxlen"), Some(&json!(40)));
        assert_eq!(columns[2].spec.f64_of("value"), Some(0.5));
        assert_eq!(columns[3].spec.data.get("value"), Some(&json!(true)));
        assert!(columns[3].spec.bool_of("optional"));
        Ok(())
    }

    #[test]
    fn rejects_bad_lines() {
        assert!(parse_metadata("frame").is_err());
        assert!(parse_metadata("frame COLOR").is_err());
        assert!(parse_metadata("frame INTEGER WHATEVER").is_err());
        assert!(parse_metadata("frame INTEGER DEFAULT:x").is_err());
        assert!(parse_metadata("value STRING").is_err());
        assert!(parse_metadata("a INTEGER\na FLOAT").is_err());
        assert!(parse_metadata("a STRING DEFAULT:\"open").is_err());
        assert_eq!(parse_metadata("  \n"), Ok(Vec::new()));
    }
}
