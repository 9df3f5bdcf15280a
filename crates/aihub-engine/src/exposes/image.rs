use std::path::{Path, PathBuf};

use aihub_contracts::catalogue::FieldKind;
use aihub_contracts::store::FieldPath;
use serde_json::{Map, Value};

use super::{Expose, FieldCore, FieldEnv, Siblings, Validity, IMAGE_PRIORITY};
use crate::host::{ExportSource, ImageHost, LayerHidden, LayerInfo, Rect};
use crate::upload::PendingUpload;

/// Where an image field takes its pixels from (`data.type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    CurrentLayer,
    MergedImage,
    MergedImageWithoutCurrentLayer,
    CurrentLayerIntersection,
    MergedImageCurrentLayerIntersection,
    MergedImageWithoutCurrentLayerIntersection,
    Upload,
}

impl ImageMode {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("upload") => ImageMode::Upload,
            Some("current_layer") => ImageMode::CurrentLayer,
            Some("merged_image_without_current_layer") => ImageMode::MergedImageWithoutCurrentLayer,
            Some("current_layer_intersection") => ImageMode::CurrentLayerIntersection,
            Some("merged_image_current_layer_intersection") => {
                ImageMode::MergedImageCurrentLayerIntersection
            }
            Some("merged_image_without_current_layer_intersection") => {
                ImageMode::MergedImageWithoutCurrentLayerIntersection
            }
            Some(_) => ImageMode::MergedImage,
        }
    }

    pub fn is_internal(self) -> bool {
        self != ImageMode::Upload
    }

    fn hides_current_layer(self) -> bool {
        matches!(
            self,
            ImageMode::MergedImageWithoutCurrentLayer
                | ImageMode::MergedImageWithoutCurrentLayerIntersection
        )
    }

    fn needs_layer(self) -> bool {
        !matches!(self, ImageMode::MergedImage | ImageMode::Upload)
    }
}

/// Position and size reported to the server next to the uploaded file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImagePlacement {
    pub pos_x: i64,
    pub pos_y: i64,
    pub width: u32,
    pub height: u32,
    pub layer_id: Option<u64>,
}

/// Reads width and height from a PNG `IHDR`.
fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let header = bytes.get(16..24)?;
    let width = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let height = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Some((width, height))
}

/// Image, info-only image and video frame fields.
#[derive(Debug, Clone)]
pub struct ImageExpose {
    core: FieldCore,
    mode: ImageMode,
    local_file: Option<PathBuf>,
    opened_image: Option<u64>,
    frame: Option<(u64, u64)>,
    placement: Option<ImagePlacement>,
    uploaded_server_path: Option<String>,
}

impl ImageExpose {
    pub fn new(core: FieldCore, initial: Option<Value>) -> Self {
        let mode = if core.spec.kind == FieldKind::Frame {
            ImageMode::Upload
        } else {
            ImageMode::parse(core.spec.str_of("type"))
        };
        let mut field = Self {
            core,
            mode,
            local_file: None,
            opened_image: None,
            frame: None,
            placement: None,
            uploaded_server_path: None,
        };
        if let Some(initial) = initial {
            // a saved file that has since disappeared is not restored
            if field.set_state(initial).is_err() || !field.local_file_exists() {
                field.local_file = None;
            }
            field.describe_upload();
        }
        field
    }

    /// Field for one item of an image batch.
    pub fn batch_item(id: FieldPath, local_file: Option<PathBuf>) -> Self {
        let spec = aihub_contracts::catalogue::FieldSpec {
            kind: FieldKind::Image,
            data: Map::new(),
        };
        let mut field = Self::new(FieldCore::new(id, spec), None);
        field.local_file = local_file;
        field.describe_upload();
        field
    }

    pub fn mode(&self) -> ImageMode {
        self.mode
    }

    pub fn local_file(&self) -> Option<&Path> {
        self.local_file.as_deref()
    }

    pub fn placement(&self) -> Option<ImagePlacement> {
        self.placement
    }

    pub fn uploaded_server_path(&self) -> Option<&str> {
        self.uploaded_server_path.as_deref()
    }

    fn is_info_only(&self) -> bool {
        self.core.spec.kind == FieldKind::ImageInfoOnly
    }

    fn is_optional(&self) -> bool {
        self.core.spec.bool_of("optional")
    }

    fn local_file_exists(&self) -> bool {
        self.local_file.as_deref().is_some_and(Path::is_file)
    }

    fn has_source(&self) -> bool {
        if self.mode.is_internal() {
            self.placement.is_some()
        } else {
            self.local_file_exists() || self.opened_image.is_some()
        }
    }

    fn describe_upload(&mut self) {
        if self.mode.is_internal() {
            return;
        }
        self.placement = if self.local_file_exists() {
            let (width, height) = self
                .local_file
                .as_deref()
                .and_then(|path| ::image::image_dimensions(path).ok())
                .unwrap_or((0, 0));
            Some(ImagePlacement {
                width,
                height,
                ..ImagePlacement::default()
            })
        } else if self.opened_image.is_some() {
            Some(ImagePlacement::default())
        } else {
            None
        };
    }

    /// Canvas rectangle the mode covers, and the layer it is relative to.
    fn internal_placement(&self, host: &dyn ImageHost) -> Option<(ImagePlacement, Option<LayerInfo>)> {
        let image = host.current_image()?;
        let layer = host.selected_layer();
        if self.mode.needs_layer() && layer.is_none() {
            return None;
        }
        let canvas = image.canvas();
        let whole = ImagePlacement {
            width: image.width,
            height: image.height,
            ..ImagePlacement::default()
        };
        let placement = match (self.mode, &layer) {
            (ImageMode::CurrentLayer, Some(layer)) => ImagePlacement {
                pos_x: layer.offset_x,
                pos_y: layer.offset_y,
                width: layer.width,
                height: layer.height,
                layer_id: Some(layer.id),
            },
            (
                ImageMode::CurrentLayerIntersection
                | ImageMode::MergedImageCurrentLayerIntersection
                | ImageMode::MergedImageWithoutCurrentLayerIntersection,
                Some(layer),
            ) => {
                let rect = layer.bounds().intersect(&canvas)?;
                ImagePlacement {
                    pos_x: rect.x,
                    pos_y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    layer_id: (self.mode == ImageMode::CurrentLayerIntersection)
                        .then_some(layer.id),
                }
            }
            _ => whole,
        };
        Some((placement, layer))
    }

    fn export_internal(&self, host: &mut dyn ImageHost) -> anyhow::Result<Option<Vec<u8>>> {
        let Some((placement, layer)) = self.internal_placement(host) else {
            return Ok(None);
        };
        let crop = Rect {
            x: placement.pos_x,
            y: placement.pos_y,
            width: placement.width,
            height: placement.height,
        };
        let source = match (self.mode, &layer) {
            (ImageMode::CurrentLayer, Some(layer)) => ExportSource::Layer(layer.id),
            (ImageMode::CurrentLayerIntersection, Some(layer)) => ExportSource::LayerCrop(layer.id, crop),
            (
                ImageMode::MergedImageCurrentLayerIntersection
                | ImageMode::MergedImageWithoutCurrentLayerIntersection,
                _,
            ) => ExportSource::MergedCrop(crop),
            _ => ExportSource::Merged,
        };

        match (self.mode.hides_current_layer(), layer) {
            (true, Some(layer)) => {
                let hidden = LayerHidden::new(host, &layer)?;
                hidden.export_png(source).map(Some)
            }
            _ => host.export_png(source).map(Some),
        }
    }
}

impl Expose for ImageExpose {
    fn core(&self) -> &FieldCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FieldCore {
        &mut self.core
    }

    fn state(&self) -> Value {
        let mut state = Map::new();
        if let Some(path) = &self.local_file {
            state.insert(
                "_local_file".to_string(),
                Value::String(path.display().to_string()),
            );
        }
        if let Some(image_id) = self.opened_image {
            state.insert("_image_id".to_string(), Value::from(image_id));
        }
        if let Some((index, total)) = self.frame {
            state.insert("frame_index".to_string(), Value::from(index));
            state.insert("total_frames".to_string(), Value::from(total));
        }
        if state.is_empty() {
            Value::Null
        } else {
            Value::Object(state)
        }
    }

    fn set_state(&mut self, value: Value) -> Result<(), String> {
        match &value {
            Value::Null => {
                self.local_file = None;
                self.opened_image = None;
                self.frame = None;
            }
            Value::String(path) => {
                self.local_file = Some(PathBuf::from(path));
                self.opened_image = None;
            }
            Value::Object(obj) => {
                self.local_file = obj
                    .get("_local_file")
                    .and_then(Value::as_str)
                    .map(PathBuf::from);
                self.opened_image = obj.get("_image_id").and_then(Value::as_u64);
                let index = obj.get("frame_index").and_then(Value::as_u64);
                let total = obj.get("total_frames").and_then(Value::as_u64);
                self.frame = index.zip(total);
            }
            other => return Err(format!("{} expects an image reference, got {other}", self.label())),
        }
        self.uploaded_server_path = None;
        self.describe_upload();
        Ok(())
    }

    fn get_value(&self, _env: &FieldEnv<'_>) -> Value {
        let Some(placement) = self.placement.filter(|_| self.has_source()) else {
            return Value::Null;
        };
        let mut value = Map::new();
        if !self.is_info_only() {
            value.insert(
                "local_file".to_string(),
                self.uploaded_server_path
                    .clone()
                    .map_or(Value::Null, Value::String),
            );
        }
        value.insert("pos_x".to_string(), Value::from(placement.pos_x));
        value.insert("pos_y".to_string(), Value::from(placement.pos_y));
        value.insert("width".to_string(), Value::from(placement.width));
        value.insert("height".to_string(), Value::from(placement.height));
        value.insert(
            "layer_id".to_string(),
            Value::String(placement.layer_id.map(|id| id.to_string()).unwrap_or_default()),
        );
        if let Some((index, total)) = self.frame {
            value.insert("frame_index".to_string(), Value::from(index));
            value.insert("total_frames".to_string(), Value::from(total));
        }
        Value::Object(value)
    }

    fn check_validity(&self, _siblings: Option<&Siblings<'_>>) -> Validity {
        if self.is_optional() || self.has_source() {
            Validity::Valid
        } else {
            Validity::Invalid(format!("{}: no image selected", self.label()))
        }
    }

    fn upload_binary(
        &mut self,
        host: &mut dyn ImageHost,
        _env: &FieldEnv<'_>,
    ) -> Result<Vec<PendingUpload>, String> {
        self.uploaded_server_path = None;
        if self.mode.is_internal() {
            self.refresh_from_host(host);
        }
        if self.is_info_only() {
            return Ok(Vec::new());
        }

        let bytes = if self.mode.is_internal() {
            self.export_internal(host)
                .map_err(|err| format!("{}: {err}", self.label()))?
        } else if self.local_file_exists() {
            let path = self.local_file.as_deref().unwrap_or(Path::new(""));
            Some(
                std::fs::read(path)
                    .map_err(|err| format!("{}: cannot read {}: {err}", self.label(), path.display()))?,
            )
        } else if let Some(image_id) = self.opened_image {
            let bytes = host
                .export_png(ExportSource::Image(image_id))
                .map_err(|err| format!("{}: {err}", self.label()))?;
            if let (Some(placement), Some((width, height))) =
                (self.placement.as_mut(), png_dimensions(&bytes))
            {
                placement.width = width;
                placement.height = height;
            }
            Some(bytes)
        } else {
            None
        };

        match bytes {
            Some(bytes) => Ok(vec![PendingUpload::new(
                self.core.id.clone(),
                self.local_file.clone().filter(|_| !self.mode.is_internal()),
                bytes,
            )]),
            None if self.is_optional() => Ok(Vec::new()),
            None => Err(format!("{}: no image selected", self.label())),
        }
    }

    fn accept_upload(&mut self, field: &FieldPath, server_path: &str) {
        if field == &self.core.id {
            self.uploaded_server_path = Some(server_path.to_string());
        }
    }

    fn get_special_priority(&self) -> i64 {
        IMAGE_PRIORITY
    }

    fn refresh_from_host(&mut self, host: &dyn ImageHost) {
        if self.mode.is_internal() {
            self.placement = self.internal_placement(host).map(|(placement, _)| placement);
        }
    }
}
