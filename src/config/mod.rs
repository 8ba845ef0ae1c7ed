// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config = parse_config(&contents, path)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        }
        _ => serde_json::from_str(contents).context("Failed to parse JSON config")?,
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_by_default() {
        let json = r#"{"backends":[{"name":"a","address":"127.0.0.1:9000"}]}"#;
        let config = parse_config(json, Path::new("lb.json")).unwrap();
        assert_eq!(config.backends, vec![BackendConfig::new("a", "127.0.0.1:9000")]);
    }

    #[tokio::test]
    async fn missing_file_reports_context() {
        let err = load_config("/definitely/not/here.yaml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_after_parse() {
        let path = std::env::temp_dir().join(format!("tcp-balancer-{}.yaml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "backends: []\n").await.unwrap();
        let result = load_config(&path).await;
        let _ = tokio::fs::remove_file(&path).await;
        assert!(result.is_err());
    }
}
