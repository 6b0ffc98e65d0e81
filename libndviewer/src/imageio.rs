use human_bytes::human_bytes;
use image::GrayImage;
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy, WritableElement};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tiff::encoder::{colortype, TiffEncoder};

use super::display::Levels;
use super::error::ImageIoError;
use super::frame::{Frame, FrameStats, PixelType};

/// Supported output formats, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Npy,
    Png,
    Text,
    Tiff,
}

impl ImageFormat {
    pub fn from_path(path: &Path) -> Result<Self, ImageIoError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("npy") => Ok(Self::Npy),
            Some("png") => Ok(Self::Png),
            Some("txt") | Some("tsv") => Ok(Self::Text),
            Some("tif") | Some("tiff") => Ok(Self::Tiff),
            _ => Err(ImageIoError::UnsupportedExtension(path.to_path_buf())),
        }
    }
}

fn log_written(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        spdlog::info!(
            "Wrote {} ({})",
            path.display(),
            human_bytes(meta.len() as f64)
        );
    }
}

pub fn save_npy<A: WritableElement>(path: &Path, data: &Array2<A>) -> Result<(), ImageIoError> {
    write_npy(path, data)?;
    log_written(path);
    Ok(())
}

/// Load a 2D npy array of any common numeric dtype as f64
pub fn load_npy(path: &Path) -> Result<Array2<f64>, ImageIoError> {
    if let Ok(a) = read_npy::<_, Array2<f64>>(path) {
        return Ok(a);
    }
    if let Ok(a) = read_npy::<_, Array2<f32>>(path) {
        return Ok(a.mapv(f64::from));
    }
    if let Ok(a) = read_npy::<_, Array2<u16>>(path) {
        return Ok(a.mapv(f64::from));
    }
    if let Ok(a) = read_npy::<_, Array2<u8>>(path) {
        return Ok(a.mapv(f64::from));
    }
    if let Ok(a) = read_npy::<_, Array2<i16>>(path) {
        return Ok(a.mapv(f64::from));
    }
    if let Ok(a) = read_npy::<_, Array2<u32>>(path) {
        return Ok(a.mapv(f64::from));
    }
    if let Ok(a) = read_npy::<_, Array2<i32>>(path) {
        return Ok(a.mapv(f64::from));
    }
    if let Ok(a) = read_npy::<_, Array2<u64>>(path) {
        return Ok(a.mapv(|v| v as f64));
    }
    let a = read_npy::<_, Array2<i64>>(path)?;
    Ok(a.mapv(|v| v as f64))
}

/// Load an npy image as a frame, guessing the pixel type from the values
pub fn load_npy_frame(path: &Path) -> Result<Frame, ImageIoError> {
    let data = load_npy(path)?;
    let integral = data.iter().all(|v| v.fract() == 0.0);
    let pixel_type = match FrameStats::from_values(data.iter().copied()) {
        Some(stats) if integral && stats.min >= 0.0 && stats.max <= u8::MAX as f64 => {
            PixelType::U8
        }
        Some(stats) if integral && stats.min >= 0.0 && stats.max <= u16::MAX as f64 => {
            PixelType::U16
        }
        _ => PixelType::F64,
    };
    Ok(Frame::from_data(pixel_type, data))
}

/// Write an 8-bit grayscale PNG scaled by `levels`, or by the data min/max
pub fn save_png(path: &Path, data: &Array2<f64>, levels: Option<Levels>) -> Result<(), ImageIoError> {
    let levels = levels.unwrap_or_else(|| match FrameStats::from_values(data.iter().copied()) {
        Some(stats) => Levels::manual(stats.min, stats.max),
        None => Levels::default(),
    });
    let (height, width) = data.dim();
    let pixels: Vec<u8> = data.iter().map(|v| levels.to_u8(*v)).collect();
    let len = pixels.len();
    let image = GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or(ImageIoError::BadBuffer(len, width, height))?;
    image.save(path)?;
    log_written(path);
    Ok(())
}

/// Tab separated integer text, one image row per line
pub fn save_text(path: &Path, data: &Array2<f64>) -> Result<(), ImageIoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in data.rows() {
        let line: Vec<String> = row
            .iter()
            .map(|v| format!("{}", v.round() as i64))
            .collect();
        writeln!(writer, "{}", line.join("\t"))?;
    }
    writer.flush()?;
    log_written(path);
    Ok(())
}

pub fn load_text(path: &Path) -> Result<Array2<f64>, ImageIoError> {
    let text = std::fs::read_to_string(path)?;
    let mut values = Vec::new();
    let mut ncols = None;
    let mut nrows = 0;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let row = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|_| ImageIoError::TextParse(tok.to_string()))
            })
            .collect::<Result<Vec<f64>, ImageIoError>>()?;
        match ncols {
            None => ncols = Some(row.len()),
            Some(n) if n != row.len() => {
                return Err(ImageIoError::TextParse(format!(
                    "row {nrows} has {} columns, expected {n}",
                    row.len()
                )))
            }
            _ => (),
        }
        values.extend(row);
        nrows += 1;
    }
    Ok(Array2::from_shape_vec((nrows, ncols.unwrap_or(0)), values)?)
}

/// Convert a frame to 16-bit pixels.
///
/// uint16 data is used as is; anything else is stretched from its min/max to
/// the full range, and a constant frame becomes zeros.
pub fn to_u16_normalized(frame: &Frame) -> Vec<u16> {
    if frame.pixel_type == PixelType::U16 {
        return frame
            .data
            .iter()
            .map(|v| v.clamp(0.0, u16::MAX as f64) as u16)
            .collect();
    }
    match frame.stats() {
        Some(stats) if stats.max > stats.min => {
            let span = stats.max - stats.min;
            frame
                .data
                .iter()
                .map(|v| {
                    if v.is_finite() {
                        ((v - stats.min) / span * u16::MAX as f64).round() as u16
                    } else {
                        0
                    }
                })
                .collect()
        }
        _ => vec![0; frame.data.len()],
    }
}

/// Write frames as pages of a 16-bit grayscale TIFF
pub fn save_tiff_stack(path: &Path, frames: &[Frame]) -> Result<(), ImageIoError> {
    let first = frames.first().ok_or(ImageIoError::EmptyStack)?;
    let shape = first.shape();
    if let Some((idx, bad)) = frames.iter().enumerate().find(|(_, f)| f.shape() != shape) {
        return Err(ImageIoError::InconsistentShape(idx, bad.shape(), shape));
    }
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    for frame in frames {
        let pixels = to_u16_normalized(frame);
        encoder.write_image::<colortype::Gray16>(
            frame.width() as u32,
            frame.height() as u32,
            &pixels,
        )?;
    }
    drop(encoder);
    log_written(path);
    Ok(())
}

/// Save one frame in the format implied by the path's extension
pub fn save_frame(path: &Path, frame: &Frame, levels: Option<Levels>) -> Result<(), ImageIoError> {
    match ImageFormat::from_path(path)? {
        ImageFormat::Npy => save_npy(path, &frame.data),
        ImageFormat::Png => save_png(path, &frame.data, levels),
        ImageFormat::Text => save_text(path, &frame.data),
        ImageFormat::Tiff => save_tiff_stack(path, std::slice::from_ref(frame)),
    }
}

/// Load an image from npy or text
pub fn load_image(path: &Path) -> Result<Frame, ImageIoError> {
    match ImageFormat::from_path(path)? {
        ImageFormat::Npy => load_npy_frame(path),
        ImageFormat::Text => Ok(Frame::from_data(PixelType::F64, load_text(path)?)),
        _ => Err(ImageIoError::UnsupportedExtension(path.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_npy_roundtrip_u16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.npy");
        let data: Array2<u16> = array![[1, 2, 3], [4, 5, 65535]];
        save_npy(&path, &data).unwrap();
        let loaded = load_npy(&path).unwrap();
        assert_eq!(loaded[[1, 2]], 65535.0);
        let frame = load_npy_frame(&path).unwrap();
        assert_eq!(frame.pixel_type, PixelType::U16);
    }

    #[test]
    fn test_png_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        let data = array![[0.0, 50.0], [100.0, 200.0]];
        save_png(&path, &data, Some(Levels::manual(0.0, 100.0))).unwrap();
        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.get_pixel(0, 0).0[0], 0);
        assert_eq!(loaded.get_pixel(1, 0).0[0], 128);
        assert_eq!(loaded.get_pixel(1, 1).0[0], 255);
    }

    #[test]
    fn test_text_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.txt");
        let data = array![[1.2, 2.0], [3.0, 4.6]];
        save_text(&path, &data).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "1\t2\n3\t5\n");
        assert_eq!(load_text(&path).unwrap(), array![[1.0, 2.0], [3.0, 5.0]]);
    }

    #[test]
    fn test_normalization() {
        let frame = Frame::new(0, 0.0, PixelType::F32, array![[1.0, 3.0]]);
        assert_eq!(to_u16_normalized(&frame), vec![0, 65535]);
        let frame = Frame::new(0, 0.0, PixelType::F32, array![[7.0, 7.0]]);
        assert_eq!(to_u16_normalized(&frame), vec![0, 0]);
        let frame = Frame::new(0, 0.0, PixelType::U16, array![[7.0, 9.0]]);
        assert_eq!(to_u16_normalized(&frame), vec![7, 9]);
    }

    #[test]
    fn test_tiff_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.tiff");
        let frames = vec![
            Frame::new(1, 0.0, PixelType::U16, array![[1.0, 2.0]]),
            Frame::new(2, 0.0, PixelType::U16, array![[3.0, 4.0]]),
        ];
        save_tiff_stack(&path, &frames).unwrap();
        let mut decoder =
            tiff::decoder::Decoder::new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (2, 1));
        assert!(decoder.more_images());
        decoder.next_image().unwrap();
        match decoder.read_image().unwrap() {
            tiff::decoder::DecodingResult::U16(px) => assert_eq!(px, vec![3, 4]),
            _ => panic!("expected 16 bit pixels"),
        }

        assert!(matches!(
            save_tiff_stack(&path, &[]),
            Err(ImageIoError::EmptyStack)
        ));
        let mixed = vec![
            frames[0].clone(),
            Frame::new(3, 0.0, PixelType::U16, array![[1.0], [2.0]]),
        ];
        assert!(matches!(
            save_tiff_stack(&path, &mixed),
            Err(ImageIoError::InconsistentShape(1, _, _))
        ));
    }

    #[test]
    fn test_unsupported_extension() {
        let frame = Frame::new(0, 0.0, PixelType::U8, array![[1.0]]);
        assert!(matches!(
            save_frame(Path::new("/tmp/out.bmp"), &frame, None),
            Err(ImageIoError::UnsupportedExtension(_))
        ));
    }
}
