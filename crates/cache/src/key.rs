//! Stable cache key construction.

/// Builds the cache key for one processed-image request.
///
/// The key concatenates image id, target dimensions, quality rounded to
/// two decimals, format tag and the aspect-ratio flag; identical
/// requests always produce identical keys.
pub fn cache_key(
    image_id: &str,
    width: u32,
    height: u32,
    quality: f64,
    format: &str,
    preserve_aspect: bool,
) -> String {
    format!(
        "{image_id}|{width}x{height}|q{quality:.2}|{format}|ar{}",
        u8::from(preserve_aspect)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_quality_rounds_to_two_decimals() {
        let a = cache_key("img-7", 800, 600, 0.8, "webp", true);
        let b = cache_key("img-7", 800, 600, 0.80001, "webp", true);
        assert_eq!(a, b);
        assert_eq!(a, "img-7|800x600|q0.80|webp|ar1");

        let c = cache_key("img-7", 800, 600, 0.8, "webp", false);
        assert_ne!(a, c);
    }
}
