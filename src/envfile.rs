use std::collections::HashMap;
use std::path::Path;

/// Project env files, highest priority first. Local overrides come before
/// the shared base variants.
pub const DEFAULT_ENV_FILES: &[&str] = &[
    ".env.local",
    ".env.development.local",
    ".env.development",
    ".env",
];

/// Read the env files named in `names` from `dir`.
///
/// Files earlier in `names` win when the same key appears in several files.
/// Missing files are skipped; malformed lines are logged and skipped so one
/// bad entry never prevents the shell from starting.
pub fn load_project_env(dir: &Path, names: &[String]) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for name in names {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let iter = match dotenvy::from_path_iter(&path) {
            Ok(iter) => iter,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open env file");
                continue;
            }
        };
        let mut loaded = 0usize;
        for item in iter {
            match item {
                Ok((key, value)) => {
                    vars.entry(key).or_insert(value);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed env line");
                }
            }
        }
        tracing::debug!(path = %path.display(), loaded, "loaded env file");
    }
    vars
}

/// Overlay `project` on top of `ambient`. Project values win.
pub fn merge_env(
    ambient: impl IntoIterator<Item = (String, String)>,
    project: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = ambient.into_iter().collect();
    merged.extend(project);
    merged
}
