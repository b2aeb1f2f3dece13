//! Directory-to-tensor loading.
//!
//! Every file under a directory tree whose extension matches is decoded into a
//! `(C, H, W)` array, normalised, and stacked into one `(N, C, H, W)` tensor.
//! The stack order is the global filename order, which is what lets two
//! independently loaded directories line up sample by sample.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis};
use ndarray_npy::{ReadNpyError, ReadNpyExt};
use tracing::{debug, info};

use crate::cfa::{expand_mosaic, CfaPattern, Colorizer};
use crate::device::Device;
use crate::error::DatasetError;

const IMAGE_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "jpg", "jpeg", "bmp"];
const RAW_EXTENSIONS: &[&str] = &["npy"];

/// A loaded dataset: the stacked tensor plus the file each sample came from.
#[derive(Debug, Clone)]
pub struct ImageStack {
    pub data: Array4<f32>,
    pub sources: Vec<PathBuf>,
}

impl ImageStack {
    pub fn new(data: Array4<f32>, sources: Vec<PathBuf>) -> Self {
        Self { data, sources }
    }

    pub fn len(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(C, H, W)` of every sample.
    pub fn sample_shape(&self) -> [usize; 3] {
        let (_, c, h, w) = self.data.dim();
        [c, h, w]
    }

    pub fn sample(&self, index: usize) -> Result<ArrayView3<'_, f32>, DatasetError> {
        if index >= self.len() {
            return Err(DatasetError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(self.data.index_axis(Axis(0), index))
    }
}

/// How a directory is decoded.
#[derive(Clone)]
pub struct LoadOptions {
    /// File extension to pick up, with or without the leading dot.
    pub extension: String,
    /// Wrap raw mosaics into `expand_channels` channels instead of colorizing.
    pub expand: bool,
    pub expand_channels: usize,
    pub colorizer: Arc<dyn Colorizer>,
    pub device: Device,
}

impl LoadOptions {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            ..Self::default()
        }
    }

    pub fn with_expand(mut self, expand: bool) -> Self {
        self.expand = expand;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    fn normalized_extension(&self) -> String {
        normalize_extension(&self.extension)
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            extension: "png".to_string(),
            expand: false,
            expand_channels: 3,
            colorizer: Arc::new(CfaPattern::default()),
            device: Device::Cpu,
        }
    }
}

impl std::fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOptions")
            .field("extension", &self.extension)
            .field("expand", &self.expand)
            .field("expand_channels", &self.expand_channels)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Load every matching file under `directory` into one stack.
///
/// A missing directory and a directory without matches both fail with
/// [`DatasetError::Empty`]. Files of differing shape fail with
/// [`DatasetError::ShapeMismatch`]. Any decode failure aborts the load.
pub fn load_images(directory: &Path, options: &LoadOptions) -> Result<ImageStack> {
    let extension = options.normalized_extension();
    if !IMAGE_EXTENSIONS.contains(&extension.as_str())
        && !RAW_EXTENSIONS.contains(&extension.as_str())
    {
        bail!("unsupported image type '{}'", options.extension);
    }

    let files = collect_files(directory, &extension)?;
    if files.is_empty() {
        return Err(DatasetError::Empty {
            directory: directory.to_path_buf(),
            extension,
        }
        .into());
    }
    debug!(
        directory = %directory.display(),
        count = files.len(),
        extension = %extension,
        "Decoding dataset files"
    );

    let decoded = options.device.map_indexed(files.len(), |index| {
        let path = &files[index];
        let mut array = decode_file(path, &extension, options)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        normalize_in_place(&mut array);
        Ok(array)
    })?;

    let data = stack_checked(&files, &decoded)?;
    info!(
        directory = %directory.display(),
        samples = files.len(),
        shape = ?data.shape(),
        "Loaded dataset"
    );
    Ok(ImageStack::new(data, files))
}

/// Recursively collect files with `extension`, sorted by file name.
fn collect_files(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?;

        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            // Linked directories are never entered or collected.
            if file_type.is_symlink() && path.is_dir() {
                continue;
            }

            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
            if matches {
                files.push(path);
            }
        }
    }

    // Walk order is filesystem dependent; the filename is the pairing key.
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    Ok(files)
}

fn decode_file(path: &Path, extension: &str, options: &LoadOptions) -> Result<Array3<f32>> {
    if RAW_EXTENSIONS.contains(&extension) {
        let mosaic = read_mosaic(path)?;
        if options.expand {
            expand_mosaic(mosaic.view(), options.expand_channels)
        } else {
            options.colorizer.colorize(mosaic.view())
        }
    } else {
        decode_image(path)
    }
}

/// Decode a standard image to 8-bit RGB, channel-first.
fn decode_image(path: &Path) -> Result<Array3<f32>> {
    let rgb = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let (width, height) = (width as usize, height as usize);

    let hwc = Array3::from_shape_vec((height, width, 3), rgb.into_raw())
        .context("decoded image buffer has unexpected length")?;
    Ok(Array3::from_shape_fn((3, height, width), |(c, y, x)| {
        f32::from(hwc[[y, x, c]])
    }))
}

/// Read a 2-D `.npy` mosaic of any supported numeric dtype as f32.
fn read_mosaic(path: &Path) -> Result<Array2<f32>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    macro_rules! try_dtype {
        ($ty:ty) => {
            match Array2::<$ty>::read_npy(Cursor::new(&bytes)) {
                Ok(array) => return Ok(array.mapv(|v| v as f32)),
                Err(ReadNpyError::WrongDescriptor(_)) => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to parse npy {}", path.display()))
                }
            }
        };
    }

    try_dtype!(f32);
    try_dtype!(f64);
    try_dtype!(u16);
    try_dtype!(u8);
    try_dtype!(i32);

    bail!(
        "{} is not a 2-D f32, f64, u16, u8 or i32 array",
        path.display()
    )
}

/// Divide by 256 when the array holds values above 1.
///
/// Assumes an 8-bit source; deeper sources stay above 1 after scaling.
pub fn normalize_in_place(array: &mut Array3<f32>) {
    let max = array.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > 1.0 {
        array.mapv_inplace(|v| v / 256.0);
    }
}

fn stack_checked(files: &[PathBuf], decoded: &[Array3<f32>]) -> Result<Array4<f32>> {
    let first = decoded.first().context("nothing to stack")?;
    let (c, h, w) = first.dim();
    let expected = [c, h, w];

    for (path, array) in files.iter().zip(decoded) {
        let (ac, ah, aw) = array.dim();
        if [ac, ah, aw] != expected {
            return Err(DatasetError::ShapeMismatch {
                path: path.clone(),
                first: files[0].clone(),
                expected,
                actual: [ac, ah, aw],
            }
            .into());
        }
    }

    let views: Vec<_> = decoded.iter().map(|a| a.view()).collect();
    ndarray::stack(Axis(0), &views).context("failed to stack dataset tensors")
}
