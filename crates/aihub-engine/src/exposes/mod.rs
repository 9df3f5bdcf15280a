//! Runtime form fields built from a workflow's field specs.
//!
//! Every field kind is one type implementing [`Expose`]; [`build_expose`]
//! maps a [`FieldKind`] to its constructor. Cross-field relations (delegated
//! bounds, model defaults) are owned by [`ExposeTree`], never by the fields.

pub mod batch;
pub mod choice;
pub mod config;
pub mod files;
pub mod image;
pub mod model;
pub mod numeric;
pub mod seed;
pub mod text;
pub mod tree;

use std::fmt;
use std::path::Path;

use aihub_contracts::catalogue::{FieldKind, FieldSpec, ModelInfo};
use aihub_contracts::store::FieldPath;
use serde_json::{Map, Value};

use crate::host::ImageHost;
use crate::upload::PendingUpload;

pub use batch::BatchExpose;
pub use tree::ExposeTree;

pub const MODEL_PRIORITY: i64 = 1000;
pub const IMAGE_PRIORITY: i64 = 900;
pub const MULTILINE_PRIORITY: i64 = 10;

/// What a field may read besides its own state while producing a value.
#[derive(Debug, Clone, Copy)]
pub struct FieldEnv<'a> {
    /// Current timeline folder, or the scratch folder outside a project.
    pub routing_dir: &'a Path,
    /// The current timeline's `config.json`, empty outside a project.
    pub config: &'a Map<String, Value>,
    pub project_real: bool,
    pub half_size: bool,
    pub half_size_coords: bool,
}

/// Values of one batch metadata column, and where the checked field sits.
#[derive(Debug, Clone, Copy)]
pub struct Siblings<'a> {
    pub values: &'a [Value],
    pub position: usize,
}

impl Siblings<'_> {
    fn own(&self) -> Option<&Value> {
        self.values.get(self.position)
    }

    pub fn is_unique(&self) -> bool {
        let Some(own) = self.own() else {
            return true;
        };
        !self
            .values
            .iter()
            .enumerate()
            .any(|(index, value)| index != self.position && value == own)
    }

    /// True when the field exceeds the sibling right before it.
    pub fn is_after_previous(&self) -> bool {
        let Some(previous) = self
            .position
            .checked_sub(1)
            .and_then(|index| self.values.get(index))
        else {
            return true;
        };
        match (self.own(), previous) {
            (Some(Value::Number(own)), Value::Number(previous)) => {
                own.as_f64().unwrap_or(f64::NAN) > previous.as_f64().unwrap_or(f64::NAN)
            }
            (Some(Value::String(own)), Value::String(previous)) => own > previous,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validity {
    Valid,
    Invalid(String),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Validity::Valid => None,
            Validity::Invalid(message) => Some(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundKind {
    Min,
    Max,
    MinLen,
    MaxLen,
}

impl BoundKind {
    pub const ALL: [BoundKind; 4] = [
        BoundKind::Min,
        BoundKind::Max,
        BoundKind::MinLen,
        BoundKind::MaxLen,
    ];

    pub fn key(self) -> &'static str {
        match self {
            BoundKind::Min => "min",
            BoundKind::Max => "max",
            BoundKind::MinLen => "minlen",
            BoundKind::MaxLen => "maxlen",
        }
    }
}

/// A bound this field takes from another field: `value(target) + offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundRef {
    pub kind: BoundKind,
    pub target: String,
    pub offset: f64,
}

/// Reads `<kind>_expose_id` / `<kind>_expose_offset` for the given kinds.
pub fn delegated_bounds(spec: &FieldSpec, kinds: &[BoundKind]) -> Vec<BoundRef> {
    kinds
        .iter()
        .filter_map(|kind| {
            let target = spec.non_blank(&format!("{}_expose_id", kind.key()))?;
            Some(BoundRef {
                kind: *kind,
                target,
                offset: spec
                    .f64_of(&format!("{}_expose_offset", kind.key()))
                    .unwrap_or(0.0),
            })
        })
        .collect()
}

/// Identity shared by every field kind.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCore {
    pub id: FieldPath,
    pub spec: FieldSpec,
}

impl FieldCore {
    pub fn new(id: FieldPath, spec: FieldSpec) -> Self {
        Self { id, spec }
    }
}

pub trait Expose: Send + fmt::Debug {
    fn core(&self) -> &FieldCore;
    fn core_mut(&mut self) -> &mut FieldCore;

    fn id(&self) -> &FieldPath {
        &self.core().id
    }

    fn set_id(&mut self, id: FieldPath) {
        self.core_mut().id = id;
    }

    fn spec(&self) -> &FieldSpec {
        &self.core().spec
    }

    fn kind(&self) -> FieldKind {
        self.spec().kind
    }

    fn label(&self) -> String {
        let id = self.id().to_string();
        self.spec().label(&id)
    }

    /// Editing state, as persisted in `saved.json`.
    fn state(&self) -> Value;

    fn set_state(&mut self, value: Value) -> Result<(), String>;

    /// Value sent in `WORKFLOW_OPERATION`. Reads only the current state.
    fn get_value(&self, env: &FieldEnv<'_>) -> Value;

    /// Advisory check for inline error text.
    fn check_validity(&self, _siblings: Option<&Siblings<'_>>) -> Validity {
        Validity::Valid
    }

    /// Binding gate for running the workflow.
    fn can_run(&self, _env: &FieldEnv<'_>, siblings: Option<&Siblings<'_>>) -> bool {
        self.check_validity(siblings).is_valid()
    }

    /// Bytes this field needs on the server before its value is sent.
    fn upload_binary(
        &mut self,
        _host: &mut dyn ImageHost,
        _env: &FieldEnv<'_>,
    ) -> Result<Vec<PendingUpload>, String> {
        Ok(Vec::new())
    }

    /// Records where the server stored the upload declared for `field`.
    fn accept_upload(&mut self, _field: &FieldPath, _server_path: &str) {}

    fn get_index(&self) -> i64 {
        self.spec().i64_of("index").unwrap_or(0)
    }

    fn is_advanced(&self) -> bool {
        self.spec().bool_of("advanced")
    }

    /// Tie-breaker between fields sharing an index; higher sorts first.
    fn get_special_priority(&self) -> i64 {
        0
    }

    fn on_model_changed(&mut self, _model: &ModelInfo) {}

    fn selected_model(&self) -> Option<ModelInfo> {
        None
    }

    fn bound_refs(&self) -> Vec<BoundRef> {
        Vec::new()
    }

    /// Applies a delegated bound. Returns true when the value was clamped.
    fn apply_bound(&mut self, _kind: BoundKind, _bound: f64) -> bool {
        false
    }

    /// Re-reads whatever the field takes from the open image.
    fn refresh_from_host(&mut self, _host: &dyn ImageHost) {}

    fn children(&self) -> Vec<&dyn Expose> {
        Vec::new()
    }

    fn child_mut(&mut self, _path: &FieldPath) -> Option<&mut dyn Expose> {
        None
    }

    fn as_batch(&self) -> Option<&BatchExpose> {
        None
    }

    fn as_batch_mut(&mut self) -> Option<&mut BatchExpose> {
        None
    }
}

pub fn build_expose(id: FieldPath, spec: FieldSpec, initial: Option<Value>) -> Box<dyn Expose> {
    let core = FieldCore::new(id, spec);
    match core.spec.kind {
        FieldKind::Integer | FieldKind::Steps | FieldKind::Float | FieldKind::Cfg => {
            Box::new(numeric::NumericExpose::new(core, initial))
        }
        FieldKind::Boolean => Box::new(choice::BooleanExpose::new(core, initial)),
        FieldKind::Text => Box::new(text::TextExpose::new(core, initial)),
        FieldKind::StringSelection
        | FieldKind::Sampler
        | FieldKind::Scheduler
        | FieldKind::ExtendableScheduler => Box::new(choice::ChoiceExpose::new(core, initial)),
        FieldKind::Seed => Box::new(seed::SeedExpose::new(core, initial)),
        FieldKind::Model | FieldKind::ModelSimple => Box::new(model::ModelExpose::new(core, initial)),
        FieldKind::Image | FieldKind::ImageInfoOnly | FieldKind::Frame => {
            Box::new(image::ImageExpose::new(core, initial))
        }
        FieldKind::ImageBatch => Box::new(batch::BatchExpose::new(core, initial)),
        FieldKind::File => Box::new(files::FileExpose::new(core, initial)),
        FieldKind::ProjectFile | FieldKind::ProjectFilesBatch => {
            Box::new(files::ProjectFileExpose::new(core, initial))
        }
        FieldKind::ConfigString
        | FieldKind::ConfigInteger
        | FieldKind::ConfigBoolean
        | FieldKind::ConfigFloat => Box::new(config::ConfigExpose::new(core)),
    }
}

/// `data.<key>` when set and not null.
pub fn data_value(spec: &FieldSpec, key: &str) -> Option<Value> {
    spec.data.get(key).filter(|value| !value.is_null()).cloned()
}
