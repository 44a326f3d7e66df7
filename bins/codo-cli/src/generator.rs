// Default languages.json generation

use codo_common::types::Language;
use serde::Serialize;

/// One languages.json entry, in the shape the worker's registry loads
#[derive(Debug, Clone, Serialize)]
pub struct LanguageTemplate {
    pub name: &'static str,
    pub version: &'static str,
    pub image: &'static str,
    pub source_file: &'static str,
    pub compile: Option<Vec<&'static str>>,
    pub run: Vec<&'static str>,
    pub extra_memory_mb: u64,
    pub limit_address_space: bool,
    pub cpu_limit: f64,
}

#[derive(Debug, Serialize)]
struct LanguagesFile {
    languages: Vec<LanguageTemplate>,
}

pub struct TemplateGenerator;

impl TemplateGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn template_for(&self, language: Language) -> LanguageTemplate {
        match language {
            Language::Python => LanguageTemplate {
                name: "python",
                version: "3.12",
                image: "python:3.12-slim",
                source_file: "main.py",
                compile: None,
                run: vec!["python3", "-u", "main.py"],
                extra_memory_mb: 0,
                limit_address_space: true,
                cpu_limit: 1.0,
            },
            // JVM heap is sized by the flag, so the address-space rlimit stays off
            Language::Java => LanguageTemplate {
                name: "java",
                version: "21",
                image: "eclipse-temurin:21-jdk",
                source_file: "Main.java",
                compile: Some(vec!["javac", "-J-Xmx512m", "Main.java"]),
                run: vec!["java", "-Xmx{memory_mb}m", "-Xss64m", "-XX:+UseSerialGC", "Main"],
                extra_memory_mb: 256,
                limit_address_space: false,
                cpu_limit: 1.0,
            },
            Language::Cpp => LanguageTemplate {
                name: "cpp",
                version: "13",
                image: "gcc:13",
                source_file: "main.cpp",
                compile: Some(vec!["g++", "-O2", "-std=c++17", "-o", "main", "main.cpp"]),
                run: vec!["./main"],
                extra_memory_mb: 0,
                limit_address_space: true,
                cpu_limit: 1.0,
            },
            Language::Javascript => LanguageTemplate {
                name: "javascript",
                version: "20",
                image: "node:20-slim",
                source_file: "main.js",
                compile: None,
                run: vec!["node", "--max-old-space-size={memory_mb}", "main.js"],
                extra_memory_mb: 128,
                limit_address_space: false,
                cpu_limit: 1.0,
            },
        }
    }

    /// Render languages.json for the given languages
    pub fn render_languages(&self, languages: &[Language]) -> serde_json::Result<String> {
        let file = LanguagesFile {
            languages: languages.iter().map(|l| self.template_for(*l)).collect(),
        };
        let mut json = serde_json::to_string_pretty(&file)?;
        json.push('\n');
        Ok(json)
    }
}
