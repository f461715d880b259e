use crate::error::AppError;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Resolves `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves a caller-supplied path and checks it lies inside `root`.
///
/// Relative paths are taken relative to the root. Paths escaping the root,
/// lexically or through symlinks, are rejected with `AccessDenied` before the
/// existence check, so nothing outside the root is ever probed for callers.
pub fn ensure_inside_root(root: &Path, raw: &Path) -> Result<PathBuf, AppError> {
    let candidate = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        root.join(raw)
    };
    let normalized = lexical_normalize(&candidate);
    let denied = || AppError::AccessDenied(format!("{} is outside the collection", raw.display()));

    let real = match normalized.canonicalize() {
        Ok(real) => real,
        Err(_) if !normalized.starts_with(root) => return Err(denied()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(AppError::NotFound(raw.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    if !real.starts_with(root) {
        return Err(denied());
    }
    Ok(real)
}

/// Returns the top-level project folder that contains `path`.
pub fn project_folder_of(root: &Path, path: &Path) -> Result<PathBuf, AppError> {
    let first = path
        .strip_prefix(root)
        .ok()
        .and_then(|rest| rest.components().next())
        .ok_or_else(|| {
            AppError::AccessDenied(format!("{} is not inside a project folder", path.display()))
        })?;
    Ok(root.join(first.as_os_str()))
}

/// Resolves `raw` to an existing project folder directly under `root`.
pub fn resolve_project_folder(root: &Path, raw: &Path) -> Result<PathBuf, AppError> {
    let real = ensure_inside_root(root, raw)?;
    if real == root {
        return Err(AppError::AccessDenied(
            "the collection root is not a project folder".into(),
        ));
    }
    if !real.is_dir() {
        return Err(AppError::NotFound(format!("folder {}", raw.display())));
    }
    if real.parent() != Some(root) {
        return Err(AppError::InvalidInput(format!(
            "{} is not a top-level project folder",
            raw.display()
        )));
    }
    Ok(real)
}

/// Checks that `name` can be used as a project folder name.
pub fn validate_folder_name(name: &str) -> Result<&str, AppError> {
    let name = name.trim();
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if name.is_empty() || !single || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(AppError::InvalidInput(format!("invalid folder name {:?}", name)));
    }
    Ok(name)
}
