use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde_json::{Map, Value};

use crate::protocol::FileAction;
use crate::store::get_dot_path;

pub const FILES_DIR: &str = "files";

/// Splits `frame.png` into (`frame`, `.png`).
pub fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => (&file_name[..dot], &file_name[dot..]),
        _ => (file_name, ""),
    }
}

/// Writes a server-pushed file under `<routing_dir>/files/`.
///
/// Returns the final path, which for APPEND carries the chosen `_N` suffix.
pub fn store_project_file(
    routing_dir: &Path,
    file_name: &str,
    action: FileAction,
    bytes: &[u8],
    separator: &[u8],
) -> anyhow::Result<PathBuf> {
    let files_dir = routing_dir.join(FILES_DIR);
    std::fs::create_dir_all(&files_dir)
        .with_context(|| format!("create {}", files_dir.display()))?;
    let target = files_dir.join(file_name);

    match action {
        FileAction::Replace => {
            std::fs::write(&target, bytes)
                .with_context(|| format!("write {}", target.display()))?;
            Ok(target)
        }
        FileAction::Append => {
            let (base, ext) = split_name(file_name);
            let mut index = 1;
            let mut candidate = files_dir.join(format!("{base}_{index}{ext}"));
            while candidate.exists() {
                index += 1;
                candidate = files_dir.join(format!("{base}_{index}{ext}"));
            }
            std::fs::write(&candidate, bytes)
                .with_context(|| format!("write {}", candidate.display()))?;
            Ok(candidate)
        }
        FileAction::Join => {
            let existed = target.exists();
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .with_context(|| format!("open {}", target.display()))?;
            if existed && !separator.is_empty() {
                file.write_all(separator)?;
            }
            file.write_all(bytes)?;
            Ok(target)
        }
        FileAction::Unsupported => {
            bail!("Invalid file_action, must be REPLACE, APPEND or JOIN")
        }
    }
}

/// Files named `<prefix>_<N><ext>` in `<routing_dir>/files/`, sorted by N.
pub fn numbered_files(routing_dir: &Path, file_name: &str) -> Vec<(u64, PathBuf)> {
    let (prefix, ext) = split_name(file_name);
    let files_dir = routing_dir.join(FILES_DIR);
    let Ok(entries) = std::fs::read_dir(&files_dir) else {
        return Vec::new();
    };
    let mut matches: Vec<(u64, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let number = name
                .strip_prefix(prefix)?
                .strip_prefix('_')?
                .strip_suffix(ext)?
                .parse::<u64>()
                .ok()?;
            Some((number, entry.path()))
        })
        .collect();
    matches.sort_by_key(|(number, _)| *number);
    matches
}

/// Removes every numbered file of a batch before a REPLACE batch arrives.
pub fn clear_batch(routing_dir: &Path, file_name: &str) -> anyhow::Result<usize> {
    let files = numbered_files(routing_dir, file_name);
    for (_, path) in &files {
        std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(files.len())
}

/// Parses one index token: a literal integer, or `+key`/`-key` reading an
/// integer from the timeline config (negated for `-`).
pub fn parse_index(token: &str, config: &Map<String, Value>) -> Result<i64, String> {
    let token = token.trim();
    if token.is_empty() {
        return Err("empty index".to_string());
    }
    if let Ok(literal) = token.parse::<i64>() {
        return Ok(literal);
    }
    let (negate, key) = if let Some(key) = token.strip_prefix('+') {
        (false, key)
    } else if let Some(key) = token.strip_prefix('-') {
        (true, key)
    } else {
        return Err(format!("invalid index '{token}'"));
    };
    let value = get_dot_path(config, key)
        .ok_or_else(|| format!("config value '{key}' is not set"))?;
    let number = value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| format!("config value '{key}' is not an integer"))?;
    if !negate {
        return Ok(number);
    }
    number
        .checked_neg()
        .ok_or_else(|| format!("config value '{key}' cannot be negated"))
}

fn resolve(index: i64, count: usize) -> Result<usize, String> {
    let count_i = i64::try_from(count).unwrap_or(i64::MAX);
    let resolved = if index < 0 { count_i + index } else { index };
    if resolved < 0 || resolved >= count_i {
        return Err(format!("index {index} is out of range for {count} files"));
    }
    usize::try_from(resolved).map_err(|err| err.to_string())
}

/// Selects positions out of `count` files.
///
/// Accepted forms: empty (everything), `3`, `1,4,-1`, `start:end` (end
/// exclusive, either side optional, negatives count from the end).
pub fn select_indices(
    selector: &str,
    count: usize,
    config: &Map<String, Value>,
) -> Result<Vec<usize>, String> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Ok((0..count).collect());
    }

    if let Some((start_raw, end_raw)) = selector.split_once(':') {
        let count_i = i64::try_from(count).unwrap_or(i64::MAX);
        let start = if start_raw.trim().is_empty() {
            0
        } else {
            parse_index(start_raw, config)?
        };
        let end = if end_raw.trim().is_empty() {
            count_i
        } else {
            parse_index(end_raw, config)?
        };
        let start = if start < 0 { count_i + start } else { start };
        let end = if end < 0 { count_i + end } else { end };
        if start < 0 || end > count_i || start > end {
            return Err(format!(
                "range {selector} is out of range for {count} files"
            ));
        }
        let start = usize::try_from(start).map_err(|err| err.to_string())?;
        let end = usize::try_from(end).map_err(|err| err.to_string())?;
        return Ok((start..end).collect());
    }

    selector
        .split(',')
        .map(|token| parse_index(token, config).and_then(|index| resolve(index, count)))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;

    fn config() -> Map<String, Value> {
        json!({"frames": {"current": 2}, "bad": "x"})
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn append_picks_lowest_unused_suffix() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = store_project_file(temp.path(), "out.png", FileAction::Append, b"1", b"")?;
        let second = store_project_file(temp.path(), "out.png", FileAction::Append, b"2", b"")?;
        assert!(first.ends_with("files/out_1.png"));
        assert!(second.ends_with("files/out_2.png"));

        std::fs::remove_file(&first)?;
        let third = store_project_file(temp.path(), "out.png", FileAction::Append, b"3", b"")?;
        assert!(third.ends_with("files/out_1.png"));
        Ok(())
    }

    #[test]
    fn replace_overwrites_and_join_appends_with_separator() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = store_project_file(temp.path(), "log.txt", FileAction::Replace, b"a", b"")?;
        store_project_file(temp.path(), "log.txt", FileAction::Replace, b"b", b"")?;
        assert_eq!(std::fs::read(&path)?, b"b");

        let joined = store_project_file(temp.path(), "story.txt", FileAction::Join, b"one", b"\n")?;
        store_project_file(temp.path(), "story.txt", FileAction::Join, b"two", b"\n")?;
        assert_eq!(std::fs::read(&joined)?, b"one\ntwo");
        Ok(())
    }

    #[test]
    fn unsupported_action_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert!(store_project_file(temp.path(), "x", FileAction::Unsupported, b"", b"").is_err());
        Ok(())
    }

    #[test]
    fn numbered_files_sort_numerically_and_clear() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let files = temp.path().join(FILES_DIR);
        std::fs::create_dir_all(&files)?;
        for name in ["frame_10.png", "frame_2.png", "frame_1.png", "frame_x.png", "other_1.png", "frame_3.jpg"] {
            std::fs::write(files.join(name), b"")?;
        }
        let found: Vec<u64> = numbered_files(temp.path(), "frame.png")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(found, vec![1, 2, 10]);

        assert_eq!(clear_batch(temp.path(), "frame.png")?, 3);
        assert!(numbered_files(temp.path(), "frame.png").is_empty());
        assert!(files.join("frame_3.jpg").exists());
        Ok(())
    }

    #[test]
    fn parse_index_literals_and_config_refs() {
        let config = config();
        assert_eq!(parse_index("3", &config), Ok(3));
        assert_eq!(parse_index("-1", &config), Ok(-1));
        assert_eq!(parse_index("+frames.current", &config), Ok(2));
        assert_eq!(parse_index("-frames.current", &config), Ok(-2));
        assert!(parse_index("+bad", &config).is_err());
        assert!(parse_index("+missing", &config).is_err());
        assert!(parse_index("abc", &config).is_err());

        let extreme = json!({"low": i64::MIN}).as_object().cloned().unwrap_or_default();
        assert_eq!(parse_index("+low", &extreme), Ok(i64::MIN));
        assert!(parse_index("-low", &extreme).is_err());
    }

    #[test]
    fn select_indices_forms() {
        let config = config();
        assert_eq!(select_indices("", 3, &config), Ok(vec![0, 1, 2]));
        assert_eq!(select_indices("-1", 4, &config), Ok(vec![3]));
        assert_eq!(select_indices("0,-1,+frames.current", 4, &config), Ok(vec![0, 3, 2]));
        assert_eq!(select_indices("1:", 4, &config), Ok(vec![1, 2, 3]));
        assert_eq!(select_indices(":-1", 4, &config), Ok(vec![0, 1, 2]));
        assert!(select_indices("5", 4, &config).is_err());
        assert!(select_indices("-5", 4, &config).is_err());
        assert!(select_indices("0:9", 4, &config).is_err());
    }
}
