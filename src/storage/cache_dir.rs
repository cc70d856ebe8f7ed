use std::path::PathBuf;

/// Get default cache directory following XDG conventions
///
/// - Linux/Unix: $XDG_CACHE_HOME/precis or ~/.cache/precis
/// - macOS: ~/Library/Caches/precis
/// - Windows: %LOCALAPPDATA%/precis/cache
pub fn default_cache_dir() -> PathBuf {
    if let Some(cache_dir) = dirs::cache_dir() {
        cache_dir.join("precis")
    } else {
        // Fallback to current directory if we can't determine cache dir
        PathBuf::from(".precis/cache")
    }
}

/// Default publish directory, relative to the working directory
pub fn default_output_dir() -> PathBuf {
    PathBuf::from(".precis/output")
}
