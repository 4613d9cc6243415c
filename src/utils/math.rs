use glam::{Vec3, Vec4};

/// Below this magnitude a vector is treated as zero when normalizing.
pub const FP_MAG_THRESHOLD: f32 = 0.000_000_1;

/// Normalize `v`, collapsing anything shorter than [`FP_MAG_THRESHOLD`] (including
/// NaN lengths) to the zero vector.
pub fn normalize_or_zero(v: Vec3) -> Vec3 {
    let mag = v.length();
    if mag > FP_MAG_THRESHOLD {
        v * (1.0 / mag)
    } else {
        Vec3::ZERO
    }
}

fn parse_floats(value: &str) -> Result<Vec<f32>, String> {
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_start_matches('r').parse::<f32>())
        .collect::<Result<Vec<f32>, _>>()
        .map_err(|e| format!("Invalid number in '{}': {}", value, e))
}

/// Parse a 3-vector from definition files: "0.0 0.1 1.0", "0, 0.1, 1" or "[r0, r0.1, r1]"
pub fn parse_vec3(value: &str) -> Result<Vec3, String> {
    match parse_floats(value)?.as_slice() {
        [x, y, z, ..] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(format!("Invalid vector format: {}", value)),
    }
}

/// Parse an 8-bit RGBA color ("255, 128, 0, 255") into 0..1 components.
/// A missing alpha is opaque.
pub fn parse_color(value: &str) -> Result<Vec4, String> {
    let c = parse_floats(value)?;
    let rgba = match c.as_slice() {
        [r, g, b] => Vec4::new(*r, *g, *b, 255.0),
        [r, g, b, a, ..] => Vec4::new(*r, *g, *b, *a),
        _ => return Err(format!("Invalid color format: {}", value)),
    };
    Ok(rgba / 255.0)
}

/// Utility functions for parsing attribute values
pub mod parsing {
    /// Parse a boolean value
    pub fn parse_bool(value: &str) -> Result<bool, String> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(format!("Invalid boolean value: {}", value)),
        }
    }

    /// Parse a UUID from string
    pub fn parse_uuid(value: &str) -> Result<uuid::Uuid, String> {
        uuid::Uuid::parse_str(value).map_err(|e| format!("Invalid UUID: {} - {}", value, e))
    }

    /// Split "NAME=VALUE"
    pub fn parse_assignment(value: &str) -> Result<(&str, &str), String> {
        value
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, _)| !k.is_empty())
            .ok_or_else(|| format!("Expected NAME=VALUE, got '{}'", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vec3_formats() {
        assert_eq!(parse_vec3("0.0 0.5 1.067").unwrap(), Vec3::new(0.0, 0.5, 1.067));
        assert_eq!(parse_vec3("1, 2, 3").unwrap(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(parse_vec3("[r1, r0, r-2]").unwrap(), Vec3::new(1.0, 0.0, -2.0));
        assert!(parse_vec3("1 2").is_err());
        assert!(parse_vec3("a b c").is_err());
    }

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("255, 0, 0, 255").unwrap(), Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(parse_color("0 0 255").unwrap(), Vec4::new(0.0, 0.0, 1.0, 1.0));
        assert!(parse_color("12").is_err());
    }

    #[test]
    fn test_normalize_or_zero() {
        assert_eq!(normalize_or_zero(Vec3::ZERO), Vec3::ZERO);
        assert_eq!(normalize_or_zero(Vec3::splat(f32::NAN)), Vec3::ZERO);
        assert!((normalize_or_zero(Vec3::new(3.0, 4.0, 0.0)) - Vec3::new(0.6, 0.8, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parsing::parse_assignment("Big_Belly=0.5").unwrap(), ("Big_Belly", "0.5"));
        assert!(parsing::parse_assignment("=1").is_err());
        assert!(parsing::parse_assignment("nothing").is_err());
    }
}
