use std::path::PathBuf;

use aihub_contracts::catalogue::{parse_metadata, MetaColumn};
use aihub_contracts::store::FieldPath;
use serde_json::{Map, Value};

use super::image::ImageExpose;
use super::{build_expose, Expose, FieldCore, FieldEnv, Siblings, Validity, IMAGE_PRIORITY};
use crate::host::ImageHost;
use crate::upload::PendingUpload;

const ITEM_KEY: &str = "value";

/// One batch entry: the image and its metadata column fields, in column order.
#[derive(Debug)]
pub struct BatchItem {
    pub image: ImageExpose,
    pub meta: Vec<Box<dyn Expose>>,
}

/// Ordered list of uploaded images with optional per-item metadata columns.
///
/// Child ids are `[batch, index, "value"]` for the image and
/// `[batch, index, column]` for metadata; every structural change renumbers
/// them so ids always match positions.
#[derive(Debug)]
pub struct BatchExpose {
    core: FieldCore,
    columns: Vec<MetaColumn>,
    column_error: Option<String>,
    items: Vec<BatchItem>,
}

impl BatchExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let (columns, column_error) = match parse_metadata(core.spec.str_of("metadata").unwrap_or("")) {
            Ok(columns) => (columns, None),
            Err(err) => (Vec::new(), Some(err.to_string())),
        };
        let mut field = Self {
            core,
            columns,
            column_error,
            items: Vec::new(),
        };
        if let Some(initial) = initial {
            if let Err(err) = field.set_state(initial) {
                tracing::debug!(field = %field.core.id, "dropping saved batch: {err}");
            }
        }
        field
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn columns(&self) -> &[MetaColumn] {
        &self.columns
    }

    fn bounds(&self) -> (usize, Option<usize>) {
        let floor = if self.core.spec.bool_of("optional") { 0 } else { 1 };
        let min = self
            .core
            .spec
            .i64_of("minlen")
            .map_or(floor, |min| usize::try_from(min).unwrap_or(0));
        let max = self
            .core
            .spec
            .i64_of("maxlen")
            .and_then(|max| usize::try_from(max).ok());
        (min, max)
    }

    fn new_item(&self, index: usize, local_file: Option<PathBuf>, saved: Option<&Map<String, Value>>) -> BatchItem {
        let base = self.core.id.push_index(index);
        let meta = self
            .columns
            .iter()
            .map(|column| {
                let initial = saved.and_then(|saved| saved.get(&column.id)).cloned();
                build_expose(base.push_key(column.id.clone()), column.spec.clone(), initial)
            })
            .collect();
        BatchItem {
            image: ImageExpose::batch_item(base.push_key(ITEM_KEY), local_file),
            meta,
        }
    }

    fn renumber(&mut self) {
        for (index, item) in self.items.iter_mut().enumerate() {
            let base = self.core.id.push_index(index);
            item.image.set_id(base.push_key(ITEM_KEY));
            for (column, meta) in self.columns.iter().zip(item.meta.iter_mut()) {
                meta.set_id(base.push_key(column.id.clone()));
            }
        }
    }

    /// Inserts an image at `index` (clamped to the end).
    pub fn insert(&mut self, index: usize, local_file: PathBuf) {
        let index = index.min(self.items.len());
        let item = self.new_item(index, Some(local_file), None);
        self.items.insert(index, item);
        self.renumber();
    }

    pub fn push(&mut self, local_file: PathBuf) {
        self.insert(self.items.len(), local_file);
    }

    pub fn remove(&mut self, index: usize) -> Result<(), String> {
        if index >= self.items.len() {
            return Err(format!("{} has no item {index}", self.label()));
        }
        self.items.remove(index);
        self.renumber();
        Ok(())
    }

    pub fn move_item(&mut self, from: usize, to: usize) -> Result<(), String> {
        if from >= self.items.len() || to >= self.items.len() {
            return Err(format!("{} cannot move item {from} to {to}", self.label()));
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        self.renumber();
        Ok(())
    }

    /// States of one metadata column across all items.
    pub fn column_values(&self, column: usize) -> Vec<Value> {
        self.items
            .iter()
            .filter_map(|item| item.meta.get(column).map(|meta| meta.state()))
            .collect()
    }

    fn count_problem(&self) -> Option<String> {
        if let Some(err) = &self.column_error {
            return Some(format!("{}: {err}", self.label()));
        }
        let (min, max) = self.bounds();
        let count = self.items.len();
        if count < min {
            return Some(format!("{} needs at least {min} images", self.label()));
        }
        match max {
            Some(max) if count > max => Some(format!("{} takes at most {max} images", self.label())),
            _ => None,
        }
    }

    /// First item-level problem, checking metadata against its column.
    fn item_problem(&self, runnable: impl Fn(&dyn Expose, Option<&Siblings<'_>>) -> Validity) -> Option<String> {
        let columns: Vec<Vec<Value>> = (0..self.columns.len())
            .map(|column| self.column_values(column))
            .collect();
        for (position, item) in self.items.iter().enumerate() {
            if let Validity::Invalid(message) = runnable(&item.image as &dyn Expose, None) {
                return Some(message);
            }
            for (column, meta) in item.meta.iter().enumerate() {
                let siblings = Siblings {
                    values: &columns[column],
                    position,
                };
                if let Validity::Invalid(message) = runnable(meta.as_ref(), Some(&siblings)) {
                    return Some(message);
                }
            }
        }
        None
    }
}

impl Expose for BatchExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn set_id(&mut self, id: FieldPath) {
        self.core.id = id;
        self.renumber();
    }

    fn state(&self) -> Value {
        Value::Array(
            self.items
                .iter()
                .map(|item| {
                    let mut entry = Map::new();
                    entry.insert(ITEM_KEY.to_string(), item.image.state());
                    for (column, meta) in self.columns.iter().zip(&item.meta) {
                        entry.insert(column.id.clone(), meta.state());
                    }
                    Value::Object(entry)
                })
                .collect(),
        )
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        let entries = match value {
            Value::Array(entries) => entries,
            Value::Null => Vec::new(),
            other => return Err(format!("{} expects a list of images, got {other}", self.label())),
        };
        let mut items = Vec::with_capacity(entries.len());
        for entry in &entries {
            let saved = entry.as_object();
            let image_state = saved
                .and_then(|saved| saved.get(ITEM_KEY))
                .unwrap_or(entry);
            let local_file = image_state
                .get("_local_file")
                .or(Some(image_state))
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .filter(|path| path.is_file());
            let Some(local_file) = local_file else {
                continue;
            };
            items.push(self.new_item(items.len(), Some(local_file), saved));
        }
        self.items = items;
        self.renumber();
        Ok(())
    }

    fn get_value(&self, env: &FieldEnv<'_>) -> Value {
        Value::Array(
            self.items
                .iter()
                .map(|item| {
                    let mut entry = Map::new();
                    entry.insert(ITEM_KEY.to_string(), item.image.get_value(env));
                    for (column, meta) in self.columns.iter().zip(&item.meta) {
                        entry.insert(column.id.clone(), meta.get_value(env));
                    }
                    Value::Object(entry)
                })
                .collect(),
        )
    }

    fn check_validity(&self, _siblings: Option<&Siblings<'_>>) -> Validity {
        self.count_problem()
            .or_else(|| self.item_problem(|field, siblings| field.check_validity(siblings)))
            .map_or(Validity::Valid, Validity::Invalid)
    }

    fn can_run(&self, env: &FieldEnv<'_>, _siblings: Option<&Siblings<'_>>) -> bool {
        self.count_problem().is_none()
            && self
                .item_problem(|field, siblings| {
                    if field.can_run(env, siblings) {
                        Validity::Valid
                    } else {
                        Validity::Invalid(field.label())
                    }
                })
                .is_none()
    }

    fn upload_binary(
        &mut self,
        host: &mut dyn ImageHost,
        env: &FieldEnv<'_>,
    ) -> Result<Vec<PendingUpload>, String> {
        let mut uploads = Vec::new();
        for item in &mut self.items {
            uploads.extend(item.image.upload_binary(host, env)?);
        }
        Ok(uploads)
    }

    fn accept_upload(&mut self, field: &FieldPath, server_path: &str) {
        if let Some(item) = self.items.iter_mut().find(|item| item.image.id() == field) {
            item.image.accept_upload(field, server_path);
        }
    }

    fn get_special_priority(&self) -> i64 {
        IMAGE_PRIORITY
    }

    fn children(&self) -> Vec<&dyn Expose> {
        self.items
            .iter()
            .flat_map(|item| {
                std::iter::once(&item.image as &dyn Expose)
                    .chain(item.meta.iter().map(|meta| meta.as_ref() as &dyn Expose))
            })
            .collect()
    }

    fn child_mut(&mut self, path: &FieldPath) -> Option<&mut dyn Expose> {
        for item in &mut self.items {
            if item.image.id() == path {
                return Some(&mut item.image);
            }
            if let Some(meta) = item.meta.iter_mut().find(|meta| meta.id() == path) {
                return Some(meta.as_mut());
            }
        }
        None
    }

    fn as_batch(&self) -> Option<&BatchExpose> {
        Some(self)
    }

    fn as_batch_mut(&mut self) -> Option<&mut BatchExpose> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use aihub_contracts::catalogue::FieldKind;
    use aihub_contracts::store::PathSegment;
    use image::RgbaImage;
    use serde_json::json;

    use super::*;
    use crate::exposes::test_support::{env, spec};
    use crate::host::NullHost;

    fn batch(data: Value, initial: Option<Value>) -> BatchExpose {
        BatchExpose::new(
            FieldCore::new(FieldPath::single("images"), spec(FieldKind::ImageBatch, data)),
            initial,
        )
    }

    fn pngs(dir: &Path, count: usize) -> anyhow::Result<Vec<PathBuf>> {
        (0..count)
            .map(|index| {
                let path = dir.join(format!("item_{index}.png"));
                RgbaImage::new(index as u32 + 1, 1).save(&path)?;
                Ok(path)
            })
            .collect()
    }

    fn index_of(path: &FieldPath) -> Option<usize> {
        match path.segments().get(1)? {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Key(_) => None,
        }
    }

    #[test]
    fn removing_an_item_renumbers_ids_and_columns() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let files = pngs(temp.path(), 4)?;
        let mut field = batch(json!({"metadata": "weight FLOAT DEFAULT:1 UNIQUE"}), None);
        for file in &files {
            field.push(file.clone());
        }
        for (index, item) in field.items.iter_mut().enumerate() {
            item.meta[0].set_state(json!(index as f64)).map_err(anyhow::Error::msg)?;
        }

        field.remove(1).map_err(anyhow::Error::msg)?;
        assert_eq!(field.len(), 3);
        for (position, item) in field.items().iter().enumerate() {
            assert_eq!(index_of(item.image.id()), Some(position));
            assert_eq!(index_of(item.meta[0].id()), Some(position));
            assert_eq!(item.meta[0].id().last_key(), Some("weight"));
        }
        assert_eq!(field.column_values(0), vec![json!(0.0), json!(2.0), json!(3.0)]);
        assert_eq!(field.items()[1].image.local_file(), Some(files[2].as_path()));
        Ok(())
    }

    #[test]
    fn moving_keeps_metadata_with_its_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let files = pngs(temp.path(), 3)?;
        let mut field = batch(json!({"metadata": "caption STRING"}), None);
        for file in &files {
            field.push(file.clone());
        }
        field.items[0].meta[0].set_state(json!("first")).map_err(anyhow::Error::msg)?;
        field.move_item(0, 2).map_err(anyhow::Error::msg)?;
        assert_eq!(field.items()[2].meta[0].state(), json!("first"));
        assert_eq!(index_of(field.items()[2].meta[0].id()), Some(2));
        assert!(field.move_item(0, 3).is_err());
        Ok(())
    }

    #[test]
    fn count_and_column_checks_gate_running() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let files = pngs(temp.path(), 3)?;
        let mut field = batch(
            json!({"label": "Refs", "maxlen": 2, "metadata": "order INTEGER SORTED"}),
            None,
        );
        assert!(!field.can_run(&env, None));
        assert_eq!(field.check_validity(None).message(), Some("Refs needs at least 1 images"));

        field.push(files[0].clone());
        field.push(files[1].clone());
        field.items[0].meta[0].set_state(json!(5)).map_err(anyhow::Error::msg)?;
        field.items[1].meta[0].set_state(json!(3)).map_err(anyhow::Error::msg)?;
        assert!(!field.can_run(&env, None));
        field.items[1].meta[0].set_state(json!(7)).map_err(anyhow::Error::msg)?;
        assert!(field.can_run(&env, None));

        field.push(files[2].clone());
        assert_eq!(field.check_validity(None).message(), Some("Refs takes at most 2 images"));
        Ok(())
    }

    #[test]
    fn state_round_trips_through_saved_entries() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = Map::new();
        let env = env(temp.path(), &config);
        let files = pngs(temp.path(), 2)?;
        let saved = json!([
            {"value": {"_local_file": files[0].display().to_string()}, "strength": 0.25},
            {"value": {"_local_file": "/gone.png"}, "strength": 0.5},
            {"value": {"_local_file": files[1].display().to_string()}}
        ]);
        let mut field = batch(json!({"metadata": "strength FLOAT DEFAULT:1"}), Some(saved));
        assert_eq!(field.len(), 2);
        assert_eq!(field.column_values(0), vec![json!(0.25), json!(1.0)]);

        let uploads = field.upload_binary(&mut NullHost, &env).map_err(anyhow::Error::msg)?;
        assert_eq!(uploads.len(), 2);
        field.accept_upload(&uploads[1].field, "server/b.png");
        let value = field.get_value(&env);
        assert_eq!(value[1]["value"]["local_file"], json!("server/b.png"));
        assert_eq!(value[0]["strength"], json!(0.25));
        assert_eq!(field.children().len(), 4);
        Ok(())
    }

    #[test]
    fn malformed_metadata_blocks_the_field() {
        let field = batch(json!({"label": "Refs", "optional": true, "metadata": "x WIDGET"}), None);
        assert!(field.columns().is_empty());
        assert!(field
            .check_validity(None)
            .message()
            .is_some_and(|message| message.contains("unknown column type")));
    }
}
