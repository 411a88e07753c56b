// Filename and folder policy — everything written under the library root goes
// through here so that a hostile or sloppy upstream cannot escape it.

use std::path::{Path, PathBuf};

/// Collapse whitespace runs to single dashes. Empty input stays empty.
pub fn dashify(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join("-")
}

/// Sanitize a candidate download filename.
///
/// The result carries no directory components, no spaces or periods in the
/// stem, always has an extension (`.safetensors` by default), and starts with
/// `<version_id>-`. The transform is idempotent.
pub fn sanitize_filename(candidate: &str, version_id: &str) -> String {
    let version_id = version_id.trim();
    let version_id = if version_id.is_empty() { "0" } else { version_id };

    let mut name = candidate.trim();
    if name.is_empty() {
        name = "model.safetensors";
    }

    // Keep only the final path segment.
    name = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let (stem, ext) = match name.rfind('.') {
        Some(at) => (&name[..at], &name[at..]),
        None => (name, ""),
    };
    let ext = if ext.is_empty() {
        ".safetensors".to_string()
    } else {
        ext.replace(' ', "")
    };

    let mut stem = dashify(stem).replace('.', "-");
    stem = stem.trim_matches('-').to_string();
    if stem.is_empty() {
        stem = "model".to_string();
    }

    let prefix = format!("{version_id}-");
    if stem.starts_with(&prefix) {
        format!("{stem}{ext}")
    } else {
        format!("{prefix}{stem}{ext}")
    }
}

/// Extract the `filename` parameter from a Content-Disposition header.
/// Path separators are replaced so the value can never name a directory.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    for part in header.split(';').skip(1) {
        let part = part.trim();
        let Some(value) = part
            .strip_prefix("filename=")
            .or_else(|| part.strip_prefix("FILENAME="))
        else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim();
        if value.is_empty() {
            return None;
        }
        return Some(value.replace(['/', '\\'], "_"));
    }
    None
}

/// Resolve the model and lora library roots from the configured base
/// directory. A base named `models` or `loras` is taken as that root, with
/// the other as a sibling; anything else gets both as children.
pub fn library_roots(base_dir: &str) -> Option<(PathBuf, PathBuf)> {
    let base_dir = base_dir.trim();
    if base_dir.is_empty() {
        return None;
    }
    let base = PathBuf::from(base_dir);
    let parent = base.parent().map(Path::to_path_buf).unwrap_or_default();

    let basename = base
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match basename.as_str() {
        "models" => Some((base.clone(), parent.join("loras"))),
        "loras" => Some((parent.join("models"), base)),
        _ => Some((base.join("models"), base.join("loras"))),
    }
}

/// Pick the destination folder for a download: the category root chosen by
/// the model type, plus one level for the (dashified) base model.
pub fn resolve_folder(base_dir: &str, base_model: &str, model_type: &str) -> Option<PathBuf> {
    let base_model = dashify(base_model.trim());
    if base_model.is_empty() {
        return None;
    }

    let (model_root, lora_root) = library_roots(base_dir)?;
    let model_type = model_type.trim().to_lowercase();

    if model_type.contains("checkpoint") {
        Some(model_root.join(base_model))
    } else if model_type.contains("lora") {
        Some(lora_root.join(base_model))
    } else {
        None
    }
}
