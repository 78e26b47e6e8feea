use std::sync::LazyLock;

/// Short git commit of the build, if the build script could read it.
const COMMIT_SHA: Option<&str> = option_env!("VERGEN_GIT_SHA");

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        COMMIT_SHA.unwrap_or("unknown"),
        if option_env!("VERGEN_GIT_DIRTY") == Some("true") {
            "-dirty"
        } else {
            ""
        }
    )
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_image_version() {
        assert!(VERSION.starts_with(env!("IMAGE_VERSION")));
        assert!(VERSION.len() > env!("IMAGE_VERSION").len());
    }
}
