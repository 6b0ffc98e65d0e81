use eframe::egui::{ColorImage, Context, TextureHandle, TextureOptions};
use egui_plot::{PlotImage, PlotPoint, PlotUi};
use ndarray::Array2;

use libndviewer::display::{to_gray8, Levels};

/// Upload `data` as a gray texture, reusing `slot` when it already holds one
pub fn update_texture(
    ctx: &Context,
    slot: &mut Option<TextureHandle>,
    name: &str,
    data: &Array2<f64>,
    levels: Levels,
) {
    let (h, w) = data.dim();
    let image = ColorImage::from_gray([w, h], &to_gray8(data, levels));
    match slot {
        Some(texture) => texture.set(image, TextureOptions::NEAREST),
        None => *slot = Some(ctx.load_texture(name, image, TextureOptions::NEAREST)),
    }
}

/// Plot coordinates of image position (x = column, y = row). The image is drawn
/// with row 0 at the top.
pub fn to_plot(x: f64, y: f64, img_h: usize) -> PlotPoint {
    PlotPoint::new(x, img_h as f64 - y)
}

/// Image position of a plot coordinate, the inverse of [`to_plot`]
pub fn from_plot(point: PlotPoint, img_h: usize) -> (f64, f64) {
    (point.x, img_h as f64 - point.y)
}

/// Draw an image of `w` x `h` pixels covering `[0, w] x [0, h]` in plot space
pub fn draw_image(plot_ui: &mut PlotUi, texture: &TextureHandle, w: usize, h: usize) {
    plot_ui.image(PlotImage::new(
        texture,
        PlotPoint::new(w as f64 / 2.0, h as f64 / 2.0),
        [w as f32, h as f32],
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plot_roundtrip() {
        let p = to_plot(3.0, 1.0, 10);
        assert_eq!((p.x, p.y), (3.0, 9.0));
        assert_eq!(from_plot(p, 10), (3.0, 1.0));
    }
}
