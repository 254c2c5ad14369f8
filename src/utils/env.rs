use std::collections::BTreeMap;
use std::path::Path;

/// Process environment overlaid by an optional `.env` file. Values from the
/// file win; blank values count as unset.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("dotenv_keys", &keys).finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    /// Loads `path` when it exists; a missing file yields the bare process env.
    pub async fn load(path: Option<&Path>) -> std::io::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Self::parse_dotenv(&contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value.to_string());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_strips_quotes_exports_and_comments() {
        let env = Env::parse_dotenv(
            "# vault\nexport VUZO_ENCRYPTION_KEY=\"s3cret\"\nEMPTY=\nOTHER='x y'\n",
        );
        assert_eq!(env.get("VUZO_ENCRYPTION_KEY").as_deref(), Some("s3cret"));
        assert_eq!(env.dotenv.get("OTHER").map(String::as_str), Some("x y"));
        assert!(!env.dotenv.contains_key("EMPTY"));
    }

    #[tokio::test]
    async fn missing_dotenv_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Env::load(Some(&dir.path().join("absent.env")))
            .await
            .expect("load");
        assert!(env.dotenv.is_empty());
    }
}
