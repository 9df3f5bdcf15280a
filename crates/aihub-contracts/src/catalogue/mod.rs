pub mod batch_meta;
pub mod field_kind;
pub mod selectors;

use indexmap::IndexMap;
use serde_json::{Map, Value};

pub use batch_meta::{parse_metadata, MetaColumn, MetaError};
pub use field_kind::FieldKind;
pub use selectors::{pick_context, pick_default, workflow_options, ProjectView, WorkflowOption};

use crate::protocol::{InfoList, ProtocolError};

/// One schema entry of a workflow: which field kind to build and its config.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub data: Map<String, Value>,
}

impl FieldSpec {
    pub fn parse(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "field spec is not an object".to_string())?;
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "field spec has no type".to_string())?;
        let kind = FieldKind::from_tag(tag).ok_or_else(|| tag.to_string())?;
        let data = obj
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self { kind, data })
    }

    pub fn label(&self, fallback: &str) -> String {
        self.data
            .get("label")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn str_of(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn bool_of(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn f64_of(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    pub fn i64_of(&self, key: &str) -> Option<i64> {
        let value = self.data.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|float| float as i64))
    }

    /// Non-blank string option; blank counts as unset.
    pub fn non_blank(&self, key: &str) -> Option<String> {
        self.str_of(key)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub context: String,
    pub category: String,
    pub project_type: Option<String>,
    pub project_type_init: bool,
    pub expose: IndexMap<String, FieldSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedWorkflow {
    pub workflow_id: String,
    pub reason: String,
}

impl Workflow {
    fn parse(key: &str, value: &Value) -> Result<Self, ProtocolError> {
        let malformed = |reason: &str| ProtocolError::Malformed(format!("workflow {key}: {reason}"));
        let obj = value.as_object().ok_or_else(|| malformed("not an object"))?;
        let text = |name: &str| obj.get(name).and_then(Value::as_str).map(str::to_string);

        let id = text("id").unwrap_or_else(|| key.to_string());
        let context = text("context").ok_or_else(|| malformed("missing context"))?;
        let category = text("category").ok_or_else(|| malformed("missing category"))?;

        let mut expose = IndexMap::new();
        if let Some(fields) = obj.get("expose").and_then(Value::as_object) {
            for (field_id, raw) in fields {
                let spec = FieldSpec::parse(raw).map_err(|tag| ProtocolError::UnknownFieldKind {
                    workflow_id: id.clone(),
                    field_id: field_id.clone(),
                    tag,
                })?;
                expose.insert(field_id.clone(), spec);
            }
        }

        Ok(Self {
            label: text("label").unwrap_or_else(|| id.clone()),
            description: text("description").filter(|desc| !desc.trim().is_empty()),
            project_type: text("project_type").filter(|kind| !kind.trim().is_empty()),
            project_type_init: obj
                .get("project_type_init")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            id,
            context,
            category,
            expose,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context: String,
    pub family: Option<String>,
    pub group: Option<String>,
    pub file: Option<String>,
    /// Extra backing files, merged verbatim into the serialized model value.
    pub files: Map<String, Value>,
    pub default_sampler: Option<String>,
    pub default_scheduler: Option<String>,
    pub default_steps: Option<i64>,
    pub default_cfg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoraInfo {
    pub id: String,
    pub name: String,
    pub context: String,
    pub family: Option<String>,
    pub group: Option<String>,
    pub file: String,
    pub default_strength: f64,
    pub use_loader_model_only: bool,
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

impl ModelInfo {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = string_field(obj, "id")?;
        Some(Self {
            name: string_field(obj, "name").unwrap_or_else(|| id.clone()),
            context: string_field(obj, "context").unwrap_or_default(),
            family: string_field(obj, "family"),
            group: string_field(obj, "group"),
            file: string_field(obj, "file"),
            files: obj
                .get("files")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            default_sampler: string_field(obj, "default_sampler"),
            default_scheduler: string_field(obj, "default_scheduler"),
            default_steps: obj.get("default_steps").and_then(Value::as_i64),
            default_cfg: obj.get("default_cfg").and_then(Value::as_f64),
            id,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        obj.insert("name".to_string(), Value::String(self.name.clone()));
        obj.insert("context".to_string(), Value::String(self.context.clone()));
        for (key, value) in [
            ("family", &self.family),
            ("group", &self.group),
            ("file", &self.file),
            ("default_sampler", &self.default_sampler),
            ("default_scheduler", &self.default_scheduler),
        ] {
            if let Some(value) = value {
                obj.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        if !self.files.is_empty() {
            obj.insert("files".to_string(), Value::Object(self.files.clone()));
        }
        if let Some(steps) = self.default_steps {
            obj.insert("default_steps".to_string(), Value::from(steps));
        }
        if let Some(cfg) = self.default_cfg {
            obj.insert("default_cfg".to_string(), Value::from(cfg));
        }
        Value::Object(obj)
    }
}

impl LoraInfo {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = string_field(obj, "id")?;
        Some(Self {
            name: string_field(obj, "name").unwrap_or_else(|| id.clone()),
            context: string_field(obj, "context").unwrap_or_default(),
            family: string_field(obj, "family"),
            group: string_field(obj, "group"),
            file: string_field(obj, "file").unwrap_or_else(|| id.clone()),
            default_strength: obj
                .get("default_strength")
                .and_then(Value::as_f64)
                .unwrap_or(1.0),
            use_loader_model_only: obj
                .get("use_loader_model_only")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            id,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        obj.insert("name".to_string(), Value::String(self.name.clone()));
        obj.insert("context".to_string(), Value::String(self.context.clone()));
        obj.insert("file".to_string(), Value::String(self.file.clone()));
        if let Some(family) = &self.family {
            obj.insert("family".to_string(), Value::String(family.clone()));
        }
        if let Some(group) = &self.group {
            obj.insert("group".to_string(), Value::String(group.clone()));
        }
        obj.insert(
            "default_strength".to_string(),
            Value::from(self.default_strength),
        );
        obj.insert(
            "use_loader_model_only".to_string(),
            Value::Bool(self.use_loader_model_only),
        );
        Value::Object(obj)
    }
}

fn matches_limits(
    context: &str,
    family: Option<&str>,
    group: Option<&str>,
    wanted_context: &str,
    limit_family: Option<&str>,
    limit_group: Option<&str>,
) -> bool {
    context == wanted_context
        && limit_family.map_or(true, |limit| family == Some(limit))
        && limit_group.map_or(true, |limit| group == Some(limit))
}

/// Server-pushed snapshot of everything that can be run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowCatalogue {
    pub workflows: IndexMap<String, Workflow>,
    pub models: Vec<ModelInfo>,
    pub loras: Vec<LoraInfo>,
    pub samplers: Vec<String>,
    pub schedulers: Vec<String>,
    /// Distinct contexts in first-seen order.
    pub contexts: Vec<String>,
    /// Distinct categories per context in first-seen order.
    pub categories: IndexMap<String, Vec<String>>,
    /// Workflows dropped at parse time, with the reason.
    pub rejected: Vec<RejectedWorkflow>,
}

impl WorkflowCatalogue {
    pub fn from_info_list(info: InfoList) -> Result<Self, ProtocolError> {
        let mut catalogue = WorkflowCatalogue {
            samplers: info.samplers,
            schedulers: info.schedulers,
            models: info.models.iter().filter_map(ModelInfo::from_value).collect(),
            loras: info.loras.iter().filter_map(LoraInfo::from_value).collect(),
            ..WorkflowCatalogue::default()
        };

        for (key, raw) in &info.workflows {
            match Workflow::parse(key, raw) {
                Ok(workflow) => {
                    if !catalogue.contexts.contains(&workflow.context) {
                        catalogue.contexts.push(workflow.context.clone());
                    }
                    let categories = catalogue
                        .categories
                        .entry(workflow.context.clone())
                        .or_default();
                    if !categories.contains(&workflow.category) {
                        categories.push(workflow.category.clone());
                    }
                    catalogue.workflows.insert(key.clone(), workflow);
                }
                Err(err) => {
                    tracing::warn!(workflow_id = %key, "dropping workflow from catalogue: {err}");
                    catalogue.rejected.push(RejectedWorkflow {
                        workflow_id: key.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if catalogue.contexts.is_empty() {
            return Err(ProtocolError::EmptyCatalogue("contexts"));
        }
        if catalogue.categories.values().all(Vec::is_empty) {
            return Err(ProtocolError::EmptyCatalogue("categories"));
        }
        Ok(catalogue)
    }

    pub fn workflow(&self, id: &str) -> Option<&Workflow> {
        self.workflows.get(id)
    }

    pub fn categories_for(&self, context: &str) -> &[String] {
        self.categories
            .get(context)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn model(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|model| model.id == id)
    }

    pub fn filtered_models(
        &self,
        context: &str,
        family: Option<&str>,
        group: Option<&str>,
    ) -> Vec<&ModelInfo> {
        self.models
            .iter()
            .filter(|model| {
                matches_limits(
                    &model.context,
                    model.family.as_deref(),
                    model.group.as_deref(),
                    context,
                    family,
                    group,
                )
            })
            .collect()
    }

    pub fn filtered_loras(
        &self,
        context: &str,
        family: Option<&str>,
        group: Option<&str>,
    ) -> Vec<&LoraInfo> {
        self.loras
            .iter()
            .filter(|lora| {
                matches_limits(
                    &lora.context,
                    lora.family.as_deref(),
                    lora.group.as_deref(),
                    context,
                    family,
                    group,
                )
            })
            .collect()
    }

    /// Field specs of `workflow_id` with server-side choices filled in.
    ///
    /// Samplers, schedulers and model/lora lists live in the catalogue rather
    /// than in each workflow, so they are injected into the field data here
    /// before any field is built.
    pub fn prepare_fields(&self, workflow_id: &str) -> Option<IndexMap<String, FieldSpec>> {
        let workflow = self.workflow(workflow_id)?;
        let mut fields = workflow.expose.clone();
        for spec in fields.values_mut() {
            match spec.kind {
                FieldKind::Sampler => set_options(&mut spec.data, &self.samplers),
                FieldKind::Scheduler => set_options(&mut spec.data, &self.schedulers),
                FieldKind::ExtendableScheduler => {
                    let blacklist = split_lines(spec.str_of("blacklist").unwrap_or(""));
                    let blacklist_all = spec.bool_of("blacklist_all");
                    let mut options: Vec<String> = if blacklist_all {
                        Vec::new()
                    } else {
                        self.schedulers
                            .iter()
                            .filter(|scheduler| !blacklist.contains(scheduler))
                            .cloned()
                            .collect()
                    };
                    options.extend(split_lines(spec.str_of("extras").unwrap_or("")));
                    set_options(&mut spec.data, &options);
                }
                FieldKind::Model | FieldKind::ModelSimple => {
                    let family = spec.non_blank("limit_to_family");
                    let group = spec.non_blank("limit_to_group");
                    let models = self
                        .filtered_models(&workflow.context, family.as_deref(), group.as_deref())
                        .into_iter()
                        .map(ModelInfo::to_value)
                        .collect();
                    let loras = self
                        .filtered_loras(&workflow.context, family.as_deref(), group.as_deref())
                        .into_iter()
                        .map(LoraInfo::to_value)
                        .collect();
                    spec.data
                        .insert("filtered_models".to_string(), Value::Array(models));
                    spec.data
                        .insert("filtered_loras".to_string(), Value::Array(loras));
                }
                _ => {}
            }
        }
        Some(fields)
    }
}

pub fn split_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn set_options(data: &mut Map<String, Value>, options: &[String]) {
    let joined = options.join("\n");
    data.insert("options".to_string(), Value::String(joined.clone()));
    data.insert("options_label".to_string(), Value::String(joined));
}
