//! What the client needs from the image editor it runs inside.
//!
//! The real editor glue implements [`ImageHost`]; [`NullHost`] stands in when
//! no editor is attached and [`FileImageHost`] keeps layered images in memory
//! for the headless driver and tests.

use std::io::Cursor;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use aihub_contracts::protocol::{FilePlacement, LayerRef, ReferenceLayerAction};
use anyhow::{anyhow, bail, Context, Result};
use image::{imageops, DynamicImage, ImageFormat, RgbaImage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: u64,
    pub name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub id: u64,
    pub name: String,
    pub offset_x: i64,
    pub offset_y: i64,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
}

/// Canvas-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + i64::from(self.width)).min(other.x + i64::from(other.width));
        let bottom = (self.y + i64::from(self.height)).min(other.y + i64::from(other.height));
        if right <= left || bottom <= top {
            return None;
        }
        Some(Rect {
            x: left,
            y: top,
            width: u32::try_from(right - left).ok()?,
            height: u32::try_from(bottom - top).ok()?,
        })
    }
}

impl LayerInfo {
    pub fn bounds(&self) -> Rect {
        Rect {
            x: self.offset_x,
            y: self.offset_y,
            width: self.width,
            height: self.height,
        }
    }
}

impl ImageInfo {
    pub fn canvas(&self) -> Rect {
        Rect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }
}

/// Pixels to export from the current image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportSource {
    /// Visible layers flattened onto the canvas.
    Merged,
    Layer(u64),
    /// Any open image, flattened.
    Image(u64),
    MergedCrop(Rect),
    /// A layer cropped to a canvas-space rectangle.
    LayerCrop(u64, Rect),
}

pub trait ImageHost: Send {
    fn current_image(&self) -> Option<ImageInfo>;
    fn selected_layer(&self) -> Option<LayerInfo>;
    fn layers(&self) -> Vec<LayerInfo>;
    fn set_layer_visible(&mut self, layer_id: u64, visible: bool) -> Result<()>;
    /// PNG bytes of `source`.
    fn export_png(&self, source: ExportSource) -> Result<Vec<u8>>;
    fn open_as_image(&mut self, path: &Path) -> Result<()>;
    fn insert_layer(&mut self, path: &Path, placement: &FilePlacement) -> Result<()>;
}

/// Hides a layer until dropped, then restores its previous visibility.
pub struct LayerHidden<'a> {
    host: &'a mut dyn ImageHost,
    layer_id: u64,
    was_visible: bool,
}

impl<'a> LayerHidden<'a> {
    pub fn new(host: &'a mut dyn ImageHost, layer: &LayerInfo) -> Result<Self> {
        if layer.visible {
            host.set_layer_visible(layer.id, false)?;
        }
        Ok(Self {
            host,
            layer_id: layer.id,
            was_visible: layer.visible,
        })
    }
}

impl<'a> Deref for LayerHidden<'a> {
    type Target = dyn ImageHost + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.host
    }
}

impl DerefMut for LayerHidden<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.host
    }
}

impl Drop for LayerHidden<'_> {
    fn drop(&mut self) {
        if self.was_visible {
            if let Err(err) = self.host.set_layer_visible(self.layer_id, true) {
                tracing::warn!(layer_id = self.layer_id, "failed to restore layer visibility: {err}");
            }
        }
    }
}

/// No editor attached: nothing is open and nothing can be materialized.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl ImageHost for NullHost {
    fn current_image(&self) -> Option<ImageInfo> {
        None
    }

    fn selected_layer(&self) -> Option<LayerInfo> {
        None
    }

    fn layers(&self) -> Vec<LayerInfo> {
        Vec::new()
    }

    fn set_layer_visible(&mut self, layer_id: u64, _visible: bool) -> Result<()> {
        bail!("no layer {layer_id}: no image is open")
    }

    fn export_png(&self, _source: ExportSource) -> Result<Vec<u8>> {
        bail!("no image is open")
    }

    fn open_as_image(&mut self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "no host attached, not opening image");
        Ok(())
    }

    fn insert_layer(&mut self, path: &Path, _placement: &FilePlacement) -> Result<()> {
        tracing::debug!(path = %path.display(), "no host attached, not inserting layer");
        Ok(())
    }
}

#[derive(Debug)]
struct HostLayer {
    id: u64,
    name: String,
    offset_x: i64,
    offset_y: i64,
    pixels: RgbaImage,
    visible: bool,
}

impl HostLayer {
    fn info(&self) -> LayerInfo {
        LayerInfo {
            id: self.id,
            name: self.name.clone(),
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            width: self.pixels.width(),
            height: self.pixels.height(),
            visible: self.visible,
        }
    }
}

#[derive(Debug)]
struct HostImage {
    id: u64,
    name: String,
    width: u32,
    height: u32,
    /// Top layer first.
    layers: Vec<HostLayer>,
    selected: Option<u64>,
}

impl HostImage {
    fn info(&self) -> ImageInfo {
        ImageInfo {
            id: self.id,
            name: self.name.clone(),
            width: self.width,
            height: self.height,
        }
    }

    fn layer(&self, id: u64) -> Result<&HostLayer> {
        self.layers
            .iter()
            .find(|layer| layer.id == id)
            .ok_or_else(|| anyhow!("image {} has no layer {id}", self.id))
    }

    fn flatten(&self) -> RgbaImage {
        let mut canvas = RgbaImage::new(self.width, self.height);
        for layer in self.layers.iter().rev().filter(|layer| layer.visible) {
            imageops::overlay(&mut canvas, &layer.pixels, layer.offset_x, layer.offset_y);
        }
        canvas
    }
}

/// Layered images held in memory, loaded from and exported to files with
/// the `image` crate.
#[derive(Debug, Default)]
pub struct FileImageHost {
    images: Vec<HostImage>,
    current: Option<u64>,
    next_id: u64,
}

impl FileImageHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Opens `path` as a new single-layer image and makes it current.
    pub fn load(&mut self, path: &Path) -> Result<u64> {
        let pixels = read_pixels(path)?;
        let name = display_name(path);
        let image_id = self.allocate_id();
        let layer_id = self.allocate_id();
        self.images.push(HostImage {
            id: image_id,
            name: name.clone(),
            width: pixels.width(),
            height: pixels.height(),
            layers: vec![HostLayer {
                id: layer_id,
                name,
                offset_x: 0,
                offset_y: 0,
                pixels,
                visible: true,
            }],
            selected: Some(layer_id),
        });
        self.current = Some(image_id);
        Ok(image_id)
    }

    pub fn images(&self) -> Vec<ImageInfo> {
        self.images.iter().map(HostImage::info).collect()
    }

    pub fn set_current_image(&mut self, image_id: u64) -> Result<()> {
        if !self.images.iter().any(|image| image.id == image_id) {
            bail!("no image {image_id}");
        }
        self.current = Some(image_id);
        Ok(())
    }

    pub fn select_layer(&mut self, layer_id: u64) -> Result<()> {
        let image = self.current_mut()?;
        image.layer(layer_id)?;
        image.selected = Some(layer_id);
        Ok(())
    }

    /// Writes the flattened current image to `path`.
    pub fn save_merged(&self, path: &Path) -> Result<()> {
        let image = self.current()?;
        image
            .flatten()
            .save(path)
            .with_context(|| format!("save {}", path.display()))
    }

    fn current(&self) -> Result<&HostImage> {
        self.current
            .and_then(|id| self.images.iter().find(|image| image.id == id))
            .ok_or_else(|| anyhow!("no image is open"))
    }

    fn current_mut(&mut self) -> Result<&mut HostImage> {
        let current = self.current;
        current
            .and_then(|id| self.images.iter_mut().find(|image| image.id == id))
            .ok_or_else(|| anyhow!("no image is open"))
    }
}

impl ImageHost for FileImageHost {
    fn current_image(&self) -> Option<ImageInfo> {
        self.current().ok().map(HostImage::info)
    }

    fn selected_layer(&self) -> Option<LayerInfo> {
        let image = self.current().ok()?;
        image.layer(image.selected?).ok().map(HostLayer::info)
    }

    fn layers(&self) -> Vec<LayerInfo> {
        self.current()
            .map(|image| image.layers.iter().map(HostLayer::info).collect())
            .unwrap_or_default()
    }

    fn set_layer_visible(&mut self, layer_id: u64, visible: bool) -> Result<()> {
        let image = self.current_mut()?;
        let layer = image
            .layers
            .iter_mut()
            .find(|layer| layer.id == layer_id)
            .ok_or_else(|| anyhow!("no layer {layer_id}"))?;
        layer.visible = visible;
        Ok(())
    }

    fn export_png(&self, source: ExportSource) -> Result<Vec<u8>> {
        let pixels = match source {
            ExportSource::Merged => self.current()?.flatten(),
            ExportSource::Image(id) => self
                .images
                .iter()
                .find(|image| image.id == id)
                .ok_or_else(|| anyhow!("no image {id}"))?
                .flatten(),
            ExportSource::Layer(id) => self.current()?.layer(id)?.pixels.clone(),
            ExportSource::MergedCrop(rect) => crop(&self.current()?.flatten(), 0, 0, rect)?,
            ExportSource::LayerCrop(id, rect) => {
                let layer = self.current()?.layer(id)?;
                crop(&layer.pixels, layer.offset_x, layer.offset_y, rect)?
            }
        };
        encode_png(pixels)
    }

    fn open_as_image(&mut self, path: &Path) -> Result<()> {
        self.load(path).map(|_| ())
    }

    fn insert_layer(&mut self, path: &Path, placement: &FilePlacement) -> Result<()> {
        if self.current().is_err() {
            return self.open_as_image(path);
        }
        let pixels = read_pixels(path)?;
        let layer_id = self.allocate_id();
        let image = self.current_mut()?;
        let layer = HostLayer {
            id: layer_id,
            name: placement.layer_name().to_string(),
            offset_x: placement.pos_x,
            offset_y: placement.pos_y,
            pixels,
            visible: true,
        };

        let reference = match placement.reference_layer() {
            Some(LayerRef::Id(id)) => image.layers.iter().position(|layer| layer.id == id),
            Some(LayerRef::First) if !image.layers.is_empty() => Some(0),
            Some(LayerRef::Last) => image.layers.len().checked_sub(1),
            _ => None,
        };
        match (reference, placement.reference_layer_action()) {
            (Some(index), ReferenceLayerAction::NewBefore) => image.layers.insert(index, layer),
            (Some(index), ReferenceLayerAction::Replace) => {
                // the reference stays in the stack, hidden
                image.layers[index].visible = false;
                image.layers.insert(index, layer);
            }
            (Some(index), _) => image.layers.insert(index + 1, layer),
            (None, _) => image.layers.insert(0, layer),
        }
        image.selected = Some(layer_id);
        Ok(())
    }
}

fn read_pixels(path: &Path) -> Result<RgbaImage> {
    Ok(image::open(path)
        .with_context(|| format!("open image {}", path.display()))?
        .to_rgba8())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}

/// Crops `pixels`, placed at (`origin_x`, `origin_y`) on the canvas, to the
/// canvas-space `rect`.
fn crop(pixels: &RgbaImage, origin_x: i64, origin_y: i64, rect: Rect) -> Result<RgbaImage> {
    let own = Rect {
        x: origin_x,
        y: origin_y,
        width: pixels.width(),
        height: pixels.height(),
    };
    let visible = own
        .intersect(&rect)
        .ok_or_else(|| anyhow!("crop rectangle does not overlap the pixels"))?;
    let local_x = u32::try_from(visible.x - origin_x)?;
    let local_y = u32::try_from(visible.y - origin_y)?;
    Ok(imageops::crop_imm(pixels, local_x, local_y, visible.width, visible.height).to_image())
}

pub fn encode_png(pixels: RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(pixels)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("encode png")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use aihub_contracts::protocol::PlacementKind;
    use image::Rgba;
    use serde_json::json;

    use super::*;

    fn write_solid(dir: &Path, name: &str, width: u32, height: u32, color: [u8; 4]) -> Result<PathBuf> {
        let path = dir.join(name);
        RgbaImage::from_pixel(width, height, Rgba(color)).save(&path)?;
        Ok(path)
    }

    fn decode(bytes: &[u8]) -> Result<RgbaImage> {
        Ok(image::load_from_memory(bytes)?.to_rgba8())
    }

    #[test]
    fn rect_intersection() {
        let canvas = Rect { x: 0, y: 0, width: 100, height: 50 };
        let layer = Rect { x: 80, y: -10, width: 40, height: 30 };
        assert_eq!(
            canvas.intersect(&layer),
            Some(Rect { x: 80, y: 0, width: 20, height: 20 })
        );
        let outside = Rect { x: 200, y: 0, width: 5, height: 5 };
        assert_eq!(canvas.intersect(&outside), None);
    }

    #[test]
    fn hidden_layer_is_restored_on_drop() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base = write_solid(temp.path(), "base.png", 4, 4, [255, 0, 0, 255])?;
        let mut host = FileImageHost::new();
        host.load(&base)?;
        let layer = host.selected_layer().ok_or_else(|| anyhow!("no layer"))?;

        {
            let hidden = LayerHidden::new(&mut host, &layer)?;
            assert!(!hidden.layers()[0].visible);
            let merged = decode(&hidden.export_png(ExportSource::Merged)?)?;
            assert_eq!(merged.get_pixel(0, 0).0[3], 0);
        }
        assert!(host.layers()[0].visible);
        Ok(())
    }

    #[test]
    fn merged_export_composites_visible_layers() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base = write_solid(temp.path(), "base.png", 8, 8, [255, 0, 0, 255])?;
        let patch = write_solid(temp.path(), "patch.png", 2, 2, [0, 0, 255, 255])?;
        let mut host = FileImageHost::new();
        host.load(&base)?;

        let placement: FilePlacement = serde_json::from_value(json!({
            "action": "NEW_LAYER", "pos_x": 6, "pos_y": 6, "name": "patch",
            "reference_layer_id": "__first__", "reference_layer_action": "NEW_BEFORE"
        }))?;
        assert_eq!(placement.action, Some(PlacementKind::NewLayer));
        host.insert_layer(&patch, &placement)?;

        let layers = host.layers();
        assert_eq!(layers[0].name, "patch");
        assert_eq!(host.selected_layer().map(|layer| layer.name), Some("patch".to_string()));

        let merged = decode(&host.export_png(ExportSource::Merged)?)?;
        assert_eq!(merged.get_pixel(7, 7).0, [0, 0, 255, 255]);
        assert_eq!(merged.get_pixel(0, 0).0, [255, 0, 0, 255]);

        let crop = decode(&host.export_png(ExportSource::MergedCrop(Rect {
            x: 6,
            y: 6,
            width: 2,
            height: 2,
        }))?)?;
        assert_eq!(crop.dimensions(), (2, 2));
        Ok(())
    }

    #[test]
    fn replace_placement_hides_reference_layer() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let base = write_solid(temp.path(), "base.png", 4, 4, [255, 0, 0, 255])?;
        let mut host = FileImageHost::new();
        host.load(&base)?;
        let base_id = host.layers()[0].id;

        let placement: FilePlacement = serde_json::from_value(json!({
            "action": "NEW_LAYER",
            "reference_layer_id": base_id.to_string(),
            "reference_layer_action": "REPLACE"
        }))?;
        host.insert_layer(&base, &placement)?;
        let layers = host.layers();
        assert_eq!(layers.len(), 2);
        assert!(layers[0].visible);
        assert_eq!(layers[1].id, base_id);
        assert!(!layers[1].visible);
        Ok(())
    }

    #[test]
    fn null_host_has_nothing_to_export() {
        let host = NullHost;
        assert!(host.current_image().is_none());
        assert!(host.export_png(ExportSource::Merged).is_err());
    }
}
