// Language configuration management for Codo Worker
use anyhow::{bail, Context, Result};
use codo_common::error::UnsupportedLanguage;
use codo_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Per-language compile/run strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    /// Docker image used by the docker sandbox
    pub image: String,
    /// File name the source is written to inside the scratch directory
    pub source_file: String,
    /// Compile command, run inside the scratch directory
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Run command; `{memory_mb}` is replaced with the memory limit
    pub run: Vec<String>,
    /// Headroom added on top of the problem's memory limit for the runtime
    #[serde(default)]
    pub extra_memory_mb: u64,
    /// Whether an address-space rlimit can be applied (JVM and V8 reserve
    /// far more virtual memory than they use, so they rely on flags instead)
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
}

fn default_true() -> bool {
    true
}

fn default_cpu_limit() -> f64 {
    1.0
}

impl LanguageConfig {
    pub fn compile_command(&self, memory_mb: u64) -> Option<Vec<String>> {
        self.compile
            .as_ref()
            .map(|argv| render_command(argv, memory_mb))
    }

    pub fn run_command(&self, memory_mb: u64) -> Vec<String> {
        render_command(&self.run, memory_mb)
    }

    /// Memory granted to the whole runtime, in megabytes
    pub fn memory_ceiling_mb(&self, memory_mb: u64) -> u64 {
        memory_mb + self.extra_memory_mb
    }
}

fn render_command(argv: &[String], memory_mb: u64) -> Vec<String> {
    argv.iter()
        .map(|arg| arg.replace("{memory_mb}", &memory_mb.to_string()))
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;

        Self::from_json(&content)
    }

    /// Parse and validate a languages.json document
    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for config in languages_json.languages {
            let language: Language = config
                .name
                .parse()
                .with_context(|| format!("Unknown language '{}' in languages.json", config.name))?;
            if config.run.is_empty() {
                bail!("Language '{}' has an empty run command", config.name);
            }
            if matches!(&config.compile, Some(argv) if argv.is_empty()) {
                bail!("Language '{}' has an empty compile command", config.name);
            }
            if language.is_compiled() && config.compile.is_none() {
                bail!("Language '{}' requires a compile command", config.name);
            }
            configs.insert(language, config);
        }

        if configs.is_empty() {
            bail!("No languages configured in languages.json");
        }

        Ok(Self { configs })
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig, UnsupportedLanguage> {
        self.configs
            .get(language)
            .ok_or_else(|| UnsupportedLanguage(language.to_string()))
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "languages": [
            {
                "name": "python",
                "version": "3.12",
                "image": "python:3.12-slim",
                "source_file": "main.py",
                "run": ["python3", "-u", "main.py"]
            },
            {
                "name": "java",
                "version": "21",
                "image": "eclipse-temurin:21-jdk",
                "source_file": "Main.java",
                "compile": ["javac", "Main.java"],
                "run": ["java", "-Xmx{memory_mb}m", "Main"],
                "extra_memory_mb": 256,
                "limit_address_space": false
            }
        ]
    }"#;

    #[test]
    fn test_parse_and_lookup() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();
        assert_eq!(manager.list_languages(), vec!["java", "python"]);

        let python = manager.get_config(&Language::Python).unwrap();
        assert!(python.limit_address_space);
        assert_eq!(python.cpu_limit, 1.0);
        assert!(python.compile_command(256).is_none());

        let java = manager.get_config(&Language::Java).unwrap();
        assert_eq!(java.run_command(128), vec!["java", "-Xmx128m", "Main"]);
        assert_eq!(java.memory_ceiling_mb(128), 384);
    }

    #[test]
    fn test_missing_language_is_unsupported() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();
        let err = manager.get_config(&Language::Cpp).unwrap_err();
        assert_eq!(err, UnsupportedLanguage("cpp".to_string()));
    }

    #[test]
    fn test_rejects_unknown_language_name() {
        let json = r#"{"languages":[{"name":"cobol","version":"1","image":"x","source_file":"a","run":["x"]}]}"#;
        let err = LanguageConfigManager::from_json(json).unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_compiled_language_needs_compile_command() {
        let json = r#"{"languages":[{"name":"cpp","version":"13","image":"gcc","source_file":"main.cpp","run":["./main"]}]}"#;
        assert!(LanguageConfigManager::from_json(json).is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let manager = LanguageConfigManager::load(Path::new("../../config/languages.json")).unwrap();
        for language in Language::ALL {
            assert!(manager.get_config(&language).is_ok(), "{} missing", language);
        }
    }
}
