// Language configuration management
// Loads the enabled languages from languages.json so submissions for a
// language no worker can judge are refused at the boundary.

use codo_common::error::UnsupportedLanguage;
use codo_common::types::Language;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Only the name matters here; the worker owns the execution strategy
#[derive(Debug, Clone, Deserialize)]
struct LanguageEntry {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageEntry>,
}

/// Registry of configured languages
/// This is the authoritative source for which languages are enabled
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    enabled_languages: HashSet<Language>,
}

impl LanguageRegistry {
    /// Load language configuration from languages.json
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read languages.json: {}", e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, String> {
        let config: LanguagesFile = serde_json::from_str(content)
            .map_err(|e| format!("Failed to parse languages.json: {}", e))?;

        let mut enabled_languages = HashSet::new();
        for entry in &config.languages {
            let language = entry
                .name
                .parse::<Language>()
                .map_err(|_| format!("Unknown language '{}' in languages.json", entry.name))?;
            enabled_languages.insert(language);
        }

        if enabled_languages.is_empty() {
            return Err("No languages configured in languages.json".to_string());
        }

        Ok(Self { enabled_languages })
    }

    /// Every known language enabled
    #[cfg(test)]
    pub fn all() -> Self {
        Self {
            enabled_languages: Language::ALL.into_iter().collect(),
        }
    }

    /// Check if a language is enabled
    pub fn is_enabled(&self, language: Language) -> bool {
        self.enabled_languages.contains(&language)
    }

    /// Parse a client-supplied language tag and make sure it is enabled
    pub fn resolve(&self, tag: &str) -> Result<Language, UnsupportedLanguage> {
        let language: Language = tag.parse()?;
        if !self.is_enabled(language) {
            return Err(UnsupportedLanguage(tag.to_string()));
        }
        Ok(language)
    }

    /// Get all enabled languages, sorted by name
    pub fn enabled_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .enabled_languages
            .iter()
            .map(|l| l.to_string())
            .collect();
        names.sort();
        names
    }
}
