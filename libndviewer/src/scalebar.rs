use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Corner {
    #[default]
    BottomRight,
    BottomLeft,
    TopRight,
    TopLeft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleBar {
    /// Physical size of one pixel in `unit`
    pub pixel_size: f64,
    pub unit: String,
    /// Target bar width as a fraction of the image width
    pub width_fraction: f64,
    pub corner: Corner,
    /// Bar thickness in pixels
    pub bar_height: f64,
    pub margin: f64,
}

impl Default for ScaleBar {
    fn default() -> Self {
        Self {
            pixel_size: 1.0,
            unit: String::from("nm"),
            width_fraction: 0.25,
            corner: Corner::default(),
            bar_height: 8.0,
            margin: 20.0,
        }
    }
}

/// Geometry of a placed bar in image pixel coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleBarLayout {
    pub x: f64,
    pub y: f64,
    pub width_px: f64,
    pub height_px: f64,
    pub label: String,
    /// Label anchor, centred just above the bar
    pub text_x: f64,
    pub text_y: f64,
}

/// Round to 1, 2, 5 or 10 times a power of ten
pub fn nice_value(value: f64) -> f64 {
    if value <= 0.0 || !value.is_finite() {
        return 1.0;
    }
    let magnitude = 10f64.powf(value.log10().floor());
    let normalized = value / magnitude;
    let nice = if normalized < 1.5 {
        1.0
    } else if normalized < 3.5 {
        2.0
    } else if normalized < 7.5 {
        5.0
    } else {
        10.0
    };
    nice * magnitude
}

fn next_unit(unit: &str) -> Option<&'static str> {
    match unit {
        "nm" => Some("µm"),
        "µm" | "um" => Some("mm"),
        "mm" => Some("m"),
        _ => None,
    }
}

/// Label text, promoting to the next unit at 1000 and above
pub fn format_length(value: f64, unit: &str) -> String {
    if value >= 1000.0 {
        if let Some(next) = next_unit(unit) {
            return format!("{:.1} {next}", value / 1000.0);
        }
    }
    if value >= 100.0 {
        format!("{} {unit}", value as i64)
    } else if value >= 10.0 {
        format!("{value:.1} {unit}")
    } else {
        format!("{value:.2} {unit}")
    }
}

impl ScaleBar {
    /// Place the bar on an image of the given width and height in pixels
    pub fn layout(&self, img_w: usize, img_h: usize) -> ScaleBarLayout {
        let pixel_size = if self.pixel_size > 0.0 {
            self.pixel_size
        } else {
            1.0
        };
        let real = nice_value(img_w as f64 * self.width_fraction * pixel_size);
        let width_px = real / pixel_size;
        let (w, h) = (img_w as f64, img_h as f64);
        let right = w - width_px - self.margin;
        let bottom = h - self.bar_height - self.margin;
        let (x, y) = match self.corner {
            Corner::BottomRight => (right, bottom),
            Corner::BottomLeft => (self.margin, bottom),
            Corner::TopRight => (right, self.margin),
            Corner::TopLeft => (self.margin, self.margin),
        };
        ScaleBarLayout {
            x,
            y,
            width_px,
            height_px: self.bar_height,
            label: format_length(real, &self.unit),
            text_x: x + width_px / 2.0,
            text_y: y - 5.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nice_values() {
        assert_eq!(nice_value(1.2), 1.0);
        assert_eq!(nice_value(3.0), 2.0);
        assert_eq!(nice_value(7.0), 5.0);
        assert_eq!(nice_value(80.0), 100.0);
        assert_eq!(nice_value(0.0), 1.0);
        assert!((nice_value(0.031) - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_format() {
        assert_eq!(format_length(2000.0, "nm"), "2.0 µm");
        assert_eq!(format_length(2000.0, "m"), "2000 m");
        assert_eq!(format_length(200.0, "nm"), "200 nm");
        assert_eq!(format_length(20.0, "µm"), "20.0 µm");
        assert_eq!(format_length(2.0, "mm"), "2.00 mm");
    }

    #[test]
    fn test_layout() {
        let bar = ScaleBar {
            pixel_size: 2.0,
            ..Default::default()
        };
        // 400 px * 0.25 * 2 nm = 200 nm -> 100 px
        let layout = bar.layout(400, 300);
        assert_eq!(layout.width_px, 100.0);
        assert_eq!(layout.x, 400.0 - 100.0 - 20.0);
        assert_eq!(layout.y, 300.0 - 8.0 - 20.0);
        assert_eq!(layout.label, "200 nm");
        let top_left = ScaleBar {
            corner: Corner::TopLeft,
            ..bar
        };
        let layout = top_left.layout(400, 300);
        assert_eq!((layout.x, layout.y), (20.0, 20.0));
        assert_eq!(layout.text_x, 70.0);
    }
}
