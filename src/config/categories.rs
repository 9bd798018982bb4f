/// Fixed mapping from config category names to on-disk directory names.
///
/// `clip` is an alias of `text_encoder` and shares its directory.
pub const CATEGORY_DIRS: &[(&str, &str)] = &[
    ("checkpoints", "Stable-diffusion"),
    ("lora", "Lora"),
    ("vae", "VAE"),
    ("controlnet", "ControlNet"),
    ("esrgan", "ESRGAN"),
    ("embeddings", "embeddings"),
    ("hypernetworks", "hypernetworks"),
    ("text_encoder", "text_encoder"),
    ("clip", "text_encoder"),
];

/// Directory for a category; unknown categories keep their own name
#[must_use]
pub fn category_dir(category: &str) -> &str {
    CATEGORY_DIRS
        .iter()
        .find(|(name, _)| *name == category)
        .map_or(category, |(_, dir)| *dir)
}

/// Whether `category` is one of the names in [`CATEGORY_DIRS`]
#[must_use]
pub fn is_known(category: &str) -> bool {
    CATEGORY_DIRS.iter().any(|(name, _)| *name == category)
}
