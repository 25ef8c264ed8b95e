use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Colors closer than this are treated as the same swatch.
pub const SIMILARITY_THRESHOLD: f64 = 50.0;

/// Distance between black and white, the largest the metric can report.
pub const MAX_DISTANCE: f64 = 441.672_955_930_063_7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ColorError {
    #[error("Invalid color: {value}")]
    InvalidColor { value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#RRGGBB` (the leading `#` is optional, digits in either case).
    pub fn from_hex(value: &str) -> Result<Self, ColorError> {
        let invalid = || ColorError::InvalidColor {
            value: value.to_string(),
        };

        let digits = value.trim().strip_prefix('#').unwrap_or(value.trim());
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&digits[range], 16).map_err(|_| invalid())
        };

        Ok(Self {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    /// Euclidean distance in RGB space.
    pub fn distance(&self, other: &Rgb) -> f64 {
        let dr = self.r as f64 - other.r as f64;
        let dg = self.g as f64 - other.g as f64;
        let db = self.b as f64 - other.b as f64;
        (dr * dr + dg * dg + db * db).sqrt()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Distance between two hex colors.
pub fn distance(a: &str, b: &str) -> Result<f64, ColorError> {
    Ok(Rgb::from_hex(a)?.distance(&Rgb::from_hex(b)?))
}

/// Whether two hex colors fall within `threshold` of each other.
pub fn is_similar(a: &str, b: &str, threshold: f64) -> Result<bool, ColorError> {
    Ok(distance(a, b)? <= threshold)
}

/// Canonical `#RRGGBB` form, or `None` if the value is not a color.
pub fn normalize_hex(value: &str) -> Option<String> {
    Rgb::from_hex(value).ok().map(|rgb| rgb.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(Rgb::from_hex("#4A90E2").unwrap(), Rgb::new(0x4A, 0x90, 0xE2));
        assert_eq!(Rgb::from_hex("4a90e2").unwrap(), Rgb::new(0x4A, 0x90, 0xE2));
        assert_eq!(Rgb::from_hex(" #ffffff ").unwrap(), Rgb::new(255, 255, 255));
    }

    #[test]
    fn test_malformed_hex_is_rejected() {
        for bad in ["", "#", "#FFF", "#GGGGGG", "#1234567", "red", "##123456"] {
            assert!(
                matches!(Rgb::from_hex(bad), Err(ColorError::InvalidColor { .. })),
                "{bad} should be rejected"
            );
        }
        assert!(distance("#000000", "nope").is_err());
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        for color in ["#000000", "#FFFFFF", "#4A90E2", "#7ED321"] {
            assert_eq!(distance(color, color).unwrap(), 0.0);
        }
    }

    #[test]
    fn test_distance_is_symmetric() {
        let pairs = [("#4A90E2", "#7ED321"), ("#FF0000", "#00FF00"), ("#808080", "#A0A0A0")];
        for (a, b) in pairs {
            assert_eq!(distance(a, b).unwrap(), distance(b, a).unwrap());
        }
    }

    #[test]
    fn test_black_to_white_is_max() {
        let d = distance("#000000", "#FFFFFF").unwrap();
        assert!((d - MAX_DISTANCE).abs() < 1e-9);
        assert!((d - 441.67).abs() < 0.01);
    }

    #[test]
    fn test_similarity_threshold() {
        // 30 on each channel: sqrt(2700) ~ 51.96
        assert!(!is_similar("#000000", "#1E1E1E", SIMILARITY_THRESHOLD).unwrap());
        // 50 on one channel sits exactly on the threshold
        assert!(is_similar("#000000", "#320000", SIMILARITY_THRESHOLD).unwrap());
        assert!(is_similar("#808080", "#909090", SIMILARITY_THRESHOLD).unwrap());
        // 32 on each channel: sqrt(3072) ~ 55.4
        assert!(!is_similar("#808080", "#A0A0A0", SIMILARITY_THRESHOLD).unwrap());
    }

    #[test]
    fn test_normalize_hex() {
        assert_eq!(normalize_hex("#a0a0a0"), Some("#A0A0A0".to_string()));
        assert_eq!(normalize_hex("f5a623"), Some("#F5A623".to_string()));
        assert_eq!(normalize_hex("blue"), None);
    }
}
