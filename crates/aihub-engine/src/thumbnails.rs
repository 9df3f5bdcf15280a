//! Fixed-width previews of timeline files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use aihub_contracts::project::files::FILES_DIR;
use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use walkdir::WalkDir;

pub const THUMBNAIL_WIDTH: u32 = 96;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "bmp", "tif", "tiff"];

#[derive(Debug, Clone)]
struct Entry {
    modified: Option<SystemTime>,
    thumbnail: Arc<RgbaImage>,
}

/// Owned by whoever shows timeline files; nothing here is global.
///
/// Entries are keyed by path and remember the file's mtime, so a rewritten
/// file is decoded again. Project and timeline changes call
/// [`ThumbnailCache::invalidate`] since they change which files exist.
#[derive(Debug)]
pub struct ThumbnailCache {
    width: u32,
    entries: HashMap<PathBuf, Entry>,
    placeholder: Option<Arc<RgbaImage>>,
}

impl Default for ThumbnailCache {
    fn default() -> Self {
        Self::new(THUMBNAIL_WIDTH)
    }
}

impl ThumbnailCache {
    pub fn new(width: u32) -> Self {
        Self {
            width: width.max(1),
            entries: HashMap::new(),
            placeholder: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Square grey tile shown for files that cannot be decoded.
    pub fn placeholder(&mut self) -> Arc<RgbaImage> {
        let width = self.width;
        self.placeholder
            .get_or_insert_with(|| {
                Arc::new(RgbaImage::from_pixel(width, width, Rgba([96, 96, 96, 255])))
            })
            .clone()
    }

    /// Thumbnail of `path`, decoded on first use or after the file changed.
    pub fn get(&mut self, path: &Path) -> Arc<RgbaImage> {
        let modified = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok();
        if let Some(entry) = self.entries.get(path) {
            if entry.modified == modified {
                return entry.thumbnail.clone();
            }
        }

        let thumbnail = match image::open(path) {
            Ok(decoded) => {
                let height = scaled_height(decoded.width(), decoded.height(), self.width);
                Arc::new(
                    decoded
                        .resize_exact(self.width, height, FilterType::Triangle)
                        .to_rgba8(),
                )
            }
            Err(err) => {
                tracing::debug!(path = %path.display(), "no thumbnail: {err}");
                self.placeholder()
            }
        };
        self.entries.insert(
            path.to_path_buf(),
            Entry {
                modified,
                thumbnail: thumbnail.clone(),
            },
        );
        thumbnail
    }

    /// Thumbnails of the image files of one timeline folder, by file name.
    pub fn for_timeline(&mut self, timeline_dir: &Path) -> Vec<(PathBuf, Arc<RgbaImage>)> {
        let mut files: Vec<PathBuf> = WalkDir::new(timeline_dir.join(FILES_DIR))
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && is_image_file(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        files
            .into_iter()
            .map(|path| {
                let thumbnail = self.get(&path);
                (path, thumbnail)
            })
            .collect()
    }

    pub fn invalidate(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(count = self.entries.len(), "dropping cached thumbnails");
        }
        self.entries.clear();
    }
}

fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return target_width;
    }
    let scaled = u64::from(height) * u64::from(target_width) / u64::from(width);
    u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
