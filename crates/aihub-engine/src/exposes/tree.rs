use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use aihub_contracts::catalogue::WorkflowCatalogue;
use aihub_contracts::conditions::{ConditionEvaluator, ConditionSpec};
use aihub_contracts::store::{FieldPath, SavedValueStore};
use anyhow::Result;
use serde_json::{Map, Value};

use super::{build_expose, BoundKind, Expose, FieldEnv};
use crate::debounce::KeyedDebouncer;
use crate::host::ImageHost;
use crate::upload::PendingUpload;

/// `dependent`'s `kind` bound follows `source`'s value plus `offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundLink {
    pub source: FieldPath,
    pub dependent: FieldPath,
    pub kind: BoundKind,
    pub offset: f64,
}

/// Why a run cannot start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// The field reports it cannot run with its current value.
    Invalid { label: String },
    /// A field condition failed; `message` is the evaluator's diagnostic.
    Condition { label: String, message: String },
}

impl Blocker {
    pub fn label(&self) -> &str {
        match self {
            Blocker::Invalid { label } | Blocker::Condition { label, .. } => label,
        }
    }
}

/// The fields of one selected workflow.
///
/// Owns every cross-field relation: delegated bounds are kept as
/// [`BoundLink`]s rebuilt by [`ExposeTree::rewire`] after any structural
/// change, and model changes are pushed to all fields from here. Dropping
/// the tree drops all of them at once.
#[derive(Debug)]
pub struct ExposeTree {
    context: String,
    workflow_id: String,
    fields: Vec<Box<dyn Expose>>,
    links: Vec<BoundLink>,
    store: SavedValueStore,
    writes: KeyedDebouncer<String, Value>,
}

fn conditions_of(field: &dyn Expose) -> Vec<ConditionSpec> {
    match field.spec().data.get("condition") {
        Some(Value::Array(items)) => items.iter().filter_map(ConditionSpec::from_value).collect(),
        Some(value) => ConditionSpec::from_value(value).into_iter().collect(),
        None => Vec::new(),
    }
}

impl ExposeTree {
    /// Builds the fields of `workflow_id`, restoring saved values from
    /// `store`. `None` when the catalogue has no such workflow.
    pub fn build(
        catalogue: &WorkflowCatalogue,
        workflow_id: &str,
        store: SavedValueStore,
        write_delay: Duration,
    ) -> Option<Self> {
        let workflow = catalogue.workflow(workflow_id)?;
        let specs = catalogue.prepare_fields(workflow_id)?;
        let mut fields: Vec<Box<dyn Expose>> = specs
            .into_iter()
            .map(|(id, spec)| {
                let path = FieldPath::single(id);
                let initial = store.get(&workflow.context, workflow_id, &path);
                build_expose(path, spec, initial)
            })
            .collect();
        fields.sort_by_key(|field| (field.get_index(), -field.get_special_priority()));

        let mut tree = Self {
            context: workflow.context.clone(),
            workflow_id: workflow_id.to_string(),
            fields,
            links: Vec::new(),
            store,
            writes: KeyedDebouncer::new(write_delay),
        };
        tree.rewire();
        tree.apply_all_bounds();
        Some(tree)
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Top-level fields in display order.
    pub fn fields(&self) -> impl Iterator<Item = &dyn Expose> {
        self.fields.iter().map(|field| field.as_ref() as &dyn Expose)
    }

    pub fn links(&self) -> &[BoundLink] {
        &self.links
    }

    pub fn field(&self, path: &FieldPath) -> Option<&dyn Expose> {
        let top = self
            .fields
            .iter()
            .find(|field| field.id().root() == path.root())?;
        if top.id() == path {
            return Some(top.as_ref());
        }
        top.children().into_iter().find(|child| child.id() == path)
    }

    fn field_mut(&mut self, path: &FieldPath) -> Option<&mut dyn Expose> {
        let top = self
            .fields
            .iter_mut()
            .find(|field| field.id().root() == path.root())?;
        if top.id() == path {
            return Some(top.as_mut());
        }
        top.child_mut(path)
    }

    fn all_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        for field in &self.fields {
            paths.push(field.id().clone());
            paths.extend(field.children().into_iter().map(|child| child.id().clone()));
        }
        paths
    }

    /// Rebuilds every bound link from the fields' current ids.
    ///
    /// A batch child first looks for the target among its own item's
    /// columns, then among top-level fields.
    pub fn rewire(&mut self) {
        let known: HashSet<FieldPath> = self.all_paths().into_iter().collect();
        let mut links = Vec::new();
        for path in &known {
            let Some(field) = self.field(path) else {
                continue;
            };
            for bound in field.bound_refs() {
                let local = path
                    .is_composite()
                    .then(|| path.with_last_key(bound.target.clone()))
                    .filter(|candidate| known.contains(candidate));
                let source = local.or_else(|| {
                    Some(FieldPath::single(bound.target.clone())).filter(|top| known.contains(top))
                });
                match source {
                    Some(source) => links.push(BoundLink {
                        source,
                        dependent: path.clone(),
                        kind: bound.kind,
                        offset: bound.offset,
                    }),
                    None => tracing::warn!(
                        field = %path,
                        target = %bound.target,
                        "bound refers to an unknown field"
                    ),
                }
            }
        }
        links.sort_by(|a, b| a.dependent.to_string().cmp(&b.dependent.to_string()));
        self.links = links;
    }

    /// Re-applies bounds flowing out of `source`, following clamped
    /// dependents transitively.
    fn propagate_from(&mut self, source: &FieldPath) {
        let mut pending = vec![source.clone()];
        let mut visited = HashSet::new();
        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(number) = self.field(&current).and_then(|field| field.state().as_f64()) else {
                continue;
            };
            let targets: Vec<BoundLink> = self
                .links
                .iter()
                .filter(|link| link.source == current)
                .cloned()
                .collect();
            for link in targets {
                if let Some(dependent) = self.field_mut(&link.dependent) {
                    if dependent.apply_bound(link.kind, number + link.offset) {
                        pending.push(link.dependent.clone());
                    }
                }
            }
        }
    }

    fn apply_all_bounds(&mut self) {
        let sources: Vec<FieldPath> = self.links.iter().map(|link| link.source.clone()).collect();
        for source in sources {
            self.propagate_from(&source);
        }
    }

    fn snapshot(&self) -> Vec<Value> {
        self.fields.iter().map(|field| field.state()).collect()
    }

    /// Queues a debounced write for every top-level field whose state moved.
    fn persist_changes(&mut self, before: &[Value], now: Instant) {
        for (field, old) in self.fields.iter().zip(before) {
            let state = field.state();
            if &state != old {
                if let Some(root) = field.id().root() {
                    self.writes.push(root.to_string(), state, now);
                }
            }
        }
    }

    /// Applies a user edit. Bounds and model defaults downstream of the
    /// edited field follow, and the changed fields are queued for saving.
    pub fn set_value(&mut self, path: &FieldPath, value: Value, now: Instant) -> Result<(), String> {
        let before = self.snapshot();
        let field = self
            .field_mut(path)
            .ok_or_else(|| format!("no field {path}"))?;
        let is_model = field.kind().is_model();
        let previous = is_model
            .then(|| field.selected_model().map(|model| model.id))
            .flatten();
        field.set_state(value)?;
        // Lora edits keep the model; only a new model resets its dependents.
        let model = is_model
            .then(|| field.selected_model())
            .flatten()
            .filter(|model| previous.as_deref() != Some(model.id.as_str()));

        if let Some(model) = model {
            for field in &mut self.fields {
                field.on_model_changed(&model);
            }
            self.apply_all_bounds();
        } else {
            self.propagate_from(path);
        }
        self.persist_changes(&before, now);
        Ok(())
    }

    /// Called once the image host is available: fields that read the open
    /// image refresh, then every bound is applied.
    pub fn after_ui_built(&mut self, host: &dyn ImageHost) {
        for field in &mut self.fields {
            field.refresh_from_host(host);
        }
        self.apply_all_bounds();
    }

    pub fn refresh_from_host(&mut self, host: &dyn ImageHost) {
        for field in &mut self.fields {
            field.refresh_from_host(host);
        }
    }

    fn condition_context(&self, env: &FieldEnv<'_>) -> Vec<(String, Value)> {
        self.fields
            .iter()
            .map(|field| (field.id().wire_key(), field.get_value(env)))
            .collect()
    }

    /// First field that stops the workflow from running, in display order.
    pub fn first_blocker(&self, env: &FieldEnv<'_>) -> Option<Blocker> {
        let mut context: Option<Vec<(String, Value)>> = None;
        for field in &self.fields {
            let conditions = conditions_of(field.as_ref());
            if !conditions.is_empty() {
                let values = context.get_or_insert_with(|| self.condition_context(env));
                for spec in conditions {
                    let mut evaluator = ConditionEvaluator::new(spec);
                    if !evaluator.evaluate(values.iter().cloned(), env.half_size, env.half_size_coords) {
                        return Some(Blocker::Condition {
                            label: field.label(),
                            message: evaluator.get_error_message(),
                        });
                    }
                }
            }
            if !field.can_run(env, None) {
                return Some(Blocker::Invalid { label: field.label() });
            }
        }
        None
    }

    /// Materializes upload payloads for all fields, in display order.
    pub fn upload_all(
        &mut self,
        host: &mut dyn ImageHost,
        env: &FieldEnv<'_>,
    ) -> Result<Vec<PendingUpload>, String> {
        let mut uploads = Vec::new();
        for field in &mut self.fields {
            uploads.extend(field.upload_binary(host, env)?);
        }
        Ok(uploads)
    }

    pub fn accept_upload(&mut self, field: &FieldPath, server_path: &str) {
        if let Some(top) = self
            .fields
            .iter_mut()
            .find(|top| top.id().root() == field.root())
        {
            top.accept_upload(field, server_path);
        }
    }

    /// The `expose` map of `WORKFLOW_OPERATION`.
    pub fn values(&self, env: &FieldEnv<'_>) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|field| (field.id().wire_key(), field.get_value(env)))
            .collect()
    }

    fn batch_op(
        &mut self,
        batch_id: &str,
        now: Instant,
        op: impl FnOnce(&mut super::BatchExpose) -> Result<(), String>,
    ) -> Result<(), String> {
        let before = self.snapshot();
        let path = FieldPath::single(batch_id);
        let batch = self
            .field_mut(&path)
            .and_then(|field| field.as_batch_mut())
            .ok_or_else(|| format!("{batch_id} is not an image batch"))?;
        op(batch)?;
        self.rewire();
        self.apply_all_bounds();
        self.persist_changes(&before, now);
        Ok(())
    }

    pub fn insert_batch_item(&mut self, batch_id: &str, index: usize, file: PathBuf, now: Instant) -> Result<(), String> {
        self.batch_op(batch_id, now, |batch| {
            batch.insert(index, file);
            Ok(())
        })
    }

    pub fn remove_batch_item(&mut self, batch_id: &str, index: usize, now: Instant) -> Result<(), String> {
        self.batch_op(batch_id, now, |batch| batch.remove(index))
    }

    pub fn move_batch_item(&mut self, batch_id: &str, from: usize, to: usize, now: Instant) -> Result<(), String> {
        self.batch_op(batch_id, now, |batch| batch.move_item(from, to))
    }

    fn write(&self, writes: Vec<(String, Value)>) -> Result<usize> {
        let count = writes.len();
        for (key, value) in writes {
            self.store
                .set(&self.context, &self.workflow_id, &FieldPath::single(key), value)?;
        }
        Ok(count)
    }

    /// Writes saved values whose quiet period has passed.
    pub fn poll_writes(&mut self, now: Instant) -> Result<usize> {
        let due = self.writes.poll(now);
        self.write(due)
    }

    /// Writes every queued value now; used before the tree is replaced.
    pub fn flush_writes(&mut self) -> Result<usize> {
        let due = self.writes.flush();
        self.write(due)
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use aihub_contracts::protocol::InfoList;
    use image::RgbaImage;
    use serde_json::json;

    use super::*;
    use crate::exposes::test_support::env;
    use crate::host::NullHost;

    fn catalogue(expose: Value) -> anyhow::Result<WorkflowCatalogue> {
        let info: InfoList = serde_json::from_value(json!({
            "workflows": {
                "wf": {"context": "image", "category": "gen", "label": "Gen", "expose": expose}
            },
            "models": [
                {"id": "base", "name": "Base", "context": "image", "family": "sdxl", "file": "base.safetensors",
                 "default_steps": 30, "default_cfg": 5.5, "default_scheduler": "karras"},
                {"id": "fast", "name": "Fast", "context": "image", "family": "sdxl", "file": "fast.safetensors",
                 "default_steps": 8, "default_cfg": 1.5}
            ],
            "loras": [],
            "samplers": ["euler"],
            "schedulers": ["normal", "karras"]
        }))?;
        Ok(WorkflowCatalogue::from_info_list(info)?)
    }

    fn tree(expose: Value, store: SavedValueStore) -> anyhow::Result<ExposeTree> {
        ExposeTree::build(&catalogue(expose)?, "wf", store, Duration::from_millis(300))
            .ok_or_else(|| anyhow::anyhow!("workflow missing"))
    }

    #[test]
    fn fields_sort_by_index_then_priority() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SavedValueStore::new(temp.path().join("saved.json"));
        let tree = tree(
            json!({
                "prompt": {"type": "AIHubExposeString", "data": {"index": 1, "multiline": true}},
                "model": {"type": "AIHubExposeModel", "data": {"index": 1}},
                "first": {"type": "AIHubExposeInteger", "data": {"index": 0}}
            }),
            store,
        )?;
        let order: Vec<String> = tree.fields().map(|field| field.id().to_string()).collect();
        assert_eq!(order, vec!["first", "model", "prompt"]);
        Ok(())
    }

    #[test]
    fn delegated_max_clamps_dependent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SavedValueStore::new(temp.path().join("saved.json"));
        let mut tree = tree(
            json!({
                "total": {"type": "AIHubExposeInteger", "data": {"value": 10}},
                "start": {"type": "AIHubExposeInteger", "data": {"value": 8, "max_expose_id": "total", "max_expose_offset": -1}}
            }),
            store,
        )?;
        assert_eq!(tree.links().len(), 1);
        let now = Instant::now();
        tree.set_value(&FieldPath::single("total"), json!(5), now)
            .map_err(anyhow::Error::msg)?;
        let start = tree.field(&FieldPath::single("start")).map(|field| field.state());
        assert_eq!(start, Some(json!(4)));
        Ok(())
    }

    #[test]
    fn model_change_resets_steps_and_scheduler() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SavedValueStore::new(temp.path().join("saved.json"));
        let mut tree = tree(
            json!({
                "model": {"type": "AIHubExposeModel", "data": {}},
                "steps": {"type": "AIHubExposeSteps", "data": {"value": 20}},
                "scheduler": {"type": "AIHubExposeScheduler", "data": {}}
            }),
            store,
        )?;
        tree.set_value(&FieldPath::single("model"), json!("fast"), Instant::now())
            .map_err(anyhow::Error::msg)?;
        let steps = tree.field(&FieldPath::single("steps")).map(|field| field.state());
        assert_eq!(steps, Some(json!(8)));

        tree.set_value(&FieldPath::single("model"), json!("base"), Instant::now())
            .map_err(anyhow::Error::msg)?;
        let scheduler = tree.field(&FieldPath::single("scheduler")).map(|field| field.state());
        assert_eq!(scheduler, Some(json!("karras")));
        Ok(())
    }

    #[test]
    fn lora_edits_keep_user_steps() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SavedValueStore::new(temp.path().join("saved.json"));
        let mut tree = tree(
            json!({
                "model": {"type": "AIHubExposeModel", "data": {}},
                "steps": {"type": "AIHubExposeSteps", "data": {"value": 20}}
            }),
            store,
        )?;
        let now = Instant::now();
        tree.set_value(&FieldPath::single("model"), json!("fast"), now)
            .map_err(anyhow::Error::msg)?;
        tree.set_value(&FieldPath::single("steps"), json!(35), now)
            .map_err(anyhow::Error::msg)?;
        tree.set_value(
            &FieldPath::single("model"),
            json!({"model": "fast", "loras": []}),
            now,
        )
        .map_err(anyhow::Error::msg)?;
        let steps = tree.field(&FieldPath::single("steps")).map(|field| field.state());
        assert_eq!(steps, Some(json!(35)));
        Ok(())
    }

    #[test]
    fn edits_are_saved_after_the_quiet_period() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let saved = temp.path().join("saved.json");
        let expose = json!({"prompt": {"type": "AIHubExposeString", "data": {}}});
        let mut first = tree(expose.clone(), SavedValueStore::new(&saved))?;
        let start = Instant::now();
        first
            .set_value(&FieldPath::single("prompt"), json!("a cat"), start)
            .map_err(anyhow::Error::msg)?;
        assert_eq!(first.poll_writes(start + Duration::from_millis(100))?, 0);
        assert_eq!(first.poll_writes(start + Duration::from_millis(400))?, 1);

        let second = tree(expose, SavedValueStore::new(&saved))?;
        let prompt = second.field(&FieldPath::single("prompt")).map(|field| field.state());
        assert_eq!(prompt, Some(json!("a cat")));
        Ok(())
    }

    #[test]
    fn blockers_report_invalid_fields_and_conditions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SavedValueStore::new(temp.path().join("saved.json"));
        let mut tree = tree(
            json!({
                "width": {"type": "AIHubExposeInteger", "data": {"value": 64, "max": 4096,
                    "condition": {"condition": "width % 8 == 0", "error": "Width must be a multiple of 8"}}},
                "input": {"type": "AIHubExposeImage", "data": {"label": "Input image", "type": "upload", "index": 5}}
            }),
            store,
        )?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        assert_eq!(
            tree.first_blocker(&env),
            Some(Blocker::Invalid { label: "Input image".to_string() })
        );

        tree.set_value(&FieldPath::single("width"), json!(65), Instant::now())
            .map_err(anyhow::Error::msg)?;
        assert_eq!(
            tree.first_blocker(&env),
            Some(Blocker::Condition {
                label: "width".to_string(),
                message: "Width must be a multiple of 8".to_string()
            })
        );
        Ok(())
    }

    #[test]
    fn batch_edits_rewire_column_bounds() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SavedValueStore::new(temp.path().join("saved.json"));
        let mut tree = tree(
            json!({
                "frames": {"type": "AIHubExposeInteger", "data": {"value": 50}},
                "keys": {"type": "AIHubExposeImageBatch", "data": {"metadata": "at INTEGER MAX:frames MAX_OFFSET:-1\nweight FLOAT"}}
            }),
            store,
        )?;
        let now = Instant::now();
        for index in 0..3 {
            let path = temp.path().join(format!("k{index}.png"));
            RgbaImage::new(2, 2).save(&path)?;
            tree.insert_batch_item("keys", index, path, now)
                .map_err(anyhow::Error::msg)?;
        }
        assert_eq!(tree.links().len(), 3);
        tree.remove_batch_item("keys", 0, now).map_err(anyhow::Error::msg)?;
        assert_eq!(tree.links().len(), 2);
        assert!(tree
            .links()
            .iter()
            .all(|link| link.source == FieldPath::single("frames")));

        let config = Map::new();
        let env = env(temp.path(), &config);
        let uploads = tree.upload_all(&mut NullHost, &env).map_err(anyhow::Error::msg)?;
        assert_eq!(uploads.len(), 2);
        tree.accept_upload(&uploads[0].field, "srv/k1.png");
        let values = tree.values(&env);
        assert_eq!(values["keys"][0]["value"]["local_file"], json!("srv/k1.png"));
        assert_eq!(tree.flush_writes()?, 1);
        Ok(())
    }
}
