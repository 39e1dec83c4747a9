//! Centralized path utilities

use std::path::PathBuf;

const DATA_DIR_NAME: &str = ".scope";
const DATABASE_FILE: &str = "scope.db";

/// Data directory: `$SCOPE_DATA_DIR`, else `~/.scope`
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SCOPE_DATA_DIR").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

/// SQLite database file inside a data directory
pub fn database_path_in(dir: &std::path::Path) -> PathBuf {
    dir.join(DATABASE_FILE)
}

/// Default SQLite database file (`<data_dir>/scope.db`)
pub fn database_path() -> PathBuf {
    database_path_in(&data_dir())
}
