//! `.env` file parsing (`KEY=VALUE` lines)

use std::path::Path;

/// Parse the contents of an env file into ordered key/value pairs
///
/// Supports `#` comments, blank lines, an optional `export ` prefix,
/// single-quoted literals and double-quoted values with `\n`, `\t`, `\"`
/// and `\\` escapes. Unquoted values may carry a trailing ` # comment`.
pub fn parse_env_file(content: &str) -> Result<Vec<(String, String)>, EnvFileError> {
    let mut vars = Vec::new();

    for (index, raw_line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            return Err(EnvFileError::Syntax {
                line: line_no,
                message: format!("expected KEY=VALUE, got '{}'", line),
            });
        };

        let key = key.trim();
        if !is_valid_key(key) {
            return Err(EnvFileError::Syntax {
                line: line_no,
                message: format!("invalid variable name '{}'", key),
            });
        }

        let value = parse_value(value.trim(), line_no)?;
        vars.push((key.to_string(), value));
    }

    Ok(vars)
}

/// Load and parse an env file from disk
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>, EnvFileError> {
    let content = std::fs::read_to_string(path).map_err(|e| EnvFileError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_env_file(&content)
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn parse_value(value: &str, line: usize) -> Result<String, EnvFileError> {
    if let Some(rest) = value.strip_prefix('\'') {
        let end = rest.find('\'').ok_or_else(|| EnvFileError::Syntax {
            line,
            message: "unterminated single quote".to_string(),
        })?;
        return Ok(rest[..end].to_string());
    }

    if let Some(rest) = value.strip_prefix('"') {
        let mut out = String::with_capacity(rest.len());
        let mut chars = rest.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => return Ok(out),
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => break,
                },
                other => out.push(other),
            }
        }
        return Err(EnvFileError::Syntax {
            line,
            message: "unterminated double quote".to_string(),
        });
    }

    // Inline comments need a preceding space, so URLs with fragments survive
    let value = match value.find(" #") {
        Some(pos) => &value[..pos],
        None => value,
    };
    Ok(value.trim_end().to_string())
}

/// Errors that can occur when reading an env file
#[derive(Debug, thiserror::Error)]
pub enum EnvFileError {
    #[error("Failed to read env file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Env file syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_env_file() {
        let content = r#"
# Database settings
DATABASE_NAME=contracts
DATABASE_USER = app
export DATABASE_HOST=db
DATABASE_PORT=5432 # default postgres port
"#;
        let vars = parse_env_file(content).unwrap();
        assert_eq!(
            vars,
            vec![
                ("DATABASE_NAME".to_string(), "contracts".to_string()),
                ("DATABASE_USER".to_string(), "app".to_string()),
                ("DATABASE_HOST".to_string(), "db".to_string()),
                ("DATABASE_PORT".to_string(), "5432".to_string()),
            ]
        );
    }

    #[test]
    fn test_quoted_values() {
        let content = "A='literal $HOME # not a comment'\nB=\"line\\nbreak\"\nC=\"\"";
        let vars = parse_env_file(content).unwrap();
        assert_eq!(vars[0].1, "literal $HOME # not a comment");
        assert_eq!(vars[1].1, "line\nbreak");
        assert_eq!(vars[2].1, "");
    }

    #[test]
    fn test_hash_without_space_is_kept() {
        let vars = parse_env_file("URL=http://host/page#section").unwrap();
        assert_eq!(vars[0].1, "http://host/page#section");
    }

    #[test]
    fn test_missing_equals_is_an_error() {
        let result = parse_env_file("VALID=1\nnot a pair");
        assert!(matches!(result, Err(EnvFileError::Syntax { line: 2, .. })));
    }

    #[test]
    fn test_unterminated_quote_is_an_error() {
        assert!(parse_env_file("A=\"open").is_err());
        assert!(parse_env_file("A='open").is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "GOOGLE_PROJECT=demo\n").unwrap();

        let vars = load_env_file(&path).unwrap();
        assert_eq!(vars, vec![("GOOGLE_PROJECT".to_string(), "demo".to_string())]);

        let missing = load_env_file(&dir.path().join("missing.env"));
        assert!(matches!(missing, Err(EnvFileError::Io { .. })));
    }
}
