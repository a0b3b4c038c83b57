//! Local env files, the on-disk side of a sync.
//!
//! Format: one `KEY=VALUE` per line. Blank lines and `#` comments are
//! ignored, an `export ` prefix is accepted, values may be single-quoted
//! (literal) or double-quoted (`\n`, `\"`, `\\` escapes). Unquoted values are
//! trimmed and lose any ` #` trailing comment.
//!
//! Saves use the same `.tmp` + rename pattern as the config file.

use std::path::Path;

use crate::error::{env_io, EnvFileError};
use crate::types::KeyValueSnapshot;

/// Load and merge env files in order; later files override earlier keys.
///
/// A missing file is an error: callers decide which files are required.
pub fn load_snapshot<P: AsRef<Path>>(paths: &[P]) -> Result<KeyValueSnapshot, EnvFileError> {
    let mut snapshot = KeyValueSnapshot::new();
    for path in paths {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| env_io(path, e))?;
        snapshot.merge(&parse(path, &contents)?);
    }
    Ok(snapshot)
}

/// Atomically write `snapshot` to `path` (mode 0600 on unix).
pub fn save_snapshot(path: &Path, snapshot: &KeyValueSnapshot) -> Result<(), EnvFileError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| env_io(parent, e))?;
    }

    let tmp = path.with_file_name(format!(
        "{}.keysync.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    std::fs::write(&tmp, render(snapshot)).map_err(|e| env_io(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(env_io(path, e));
    }
    Ok(())
}

/// Parse env-file text. `path` is only used for error messages.
pub fn parse(path: &Path, contents: &str) -> Result<KeyValueSnapshot, EnvFileError> {
    let mut snapshot = KeyValueSnapshot::new();
    for (idx, raw) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_err(path, line_no, "expected KEY=VALUE"));
        };
        let key = key.trim();
        if !is_valid_key(key) {
            return Err(parse_err(path, line_no, format!("invalid key '{key}'")));
        }
        let value = parse_value(value.trim())
            .map_err(|message| parse_err(path, line_no, message))?;
        snapshot.insert(key, value);
    }
    Ok(snapshot)
}

/// Render a snapshot as env-file text, quoting values where needed.
pub fn render(snapshot: &KeyValueSnapshot) -> String {
    let mut out = String::new();
    for (key, value) in snapshot.iter() {
        out.push_str(key);
        out.push('=');
        if needs_quotes(value) {
            out.push('"');
            for ch in value.chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    other => out.push(other),
                }
            }
            out.push('"');
        } else {
            out.push_str(value);
        }
        out.push('\n');
    }
    out
}

fn parse_value(value: &str) -> Result<String, String> {
    if let Some(rest) = value.strip_prefix('\'') {
        let Some(end) = rest.find('\'') else {
            return Err("unterminated single-quoted value".into());
        };
        return Ok(rest[..end].to_string());
    }

    if let Some(rest) = value.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '"' => return Ok(out),
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => break,
                },
                other => out.push(other),
            }
        }
        return Err("unterminated double-quoted value".into());
    }

    let unquoted = match value.find(" #") {
        Some(pos) => &value[..pos],
        None => value,
    };
    Ok(unquoted.trim().to_string())
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value.starts_with('\'')
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\\'))
}

fn parse_err(path: &Path, line: usize, message: impl Into<String>) -> EnvFileError {
    EnvFileError::Parse {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), EnvFileError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| env_io(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), EnvFileError> {
    Ok(())
}
