use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::engine::error::EngineError;

/// How a language turns source text into something the runner can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageKind {
    Native,
    Managed,
    Interpreted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Cpp,
    Java,
    Python,
}

impl Language {
    pub fn kind(self) -> LanguageKind {
        match self {
            Language::Cpp => LanguageKind::Native,
            Language::Java => LanguageKind::Managed,
            Language::Python => LanguageKind::Interpreted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Python => "py",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpp" | "c++" => Ok(Self::Cpp),
            "java" => Ok(Self::Java),
            "py" | "python" => Ok(Self::Python),
            _ => Err(EngineError::UnsupportedLanguage(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub output: String,
}

/// Per-request ceilings. Time is wall-clock seconds, memory is megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub time_limit_secs: u64,
    pub memory_limit_mb: u64,
}

impl ExecutionLimits {
    pub fn normalized(mut self) -> Self {
        self.time_limit_secs = self.time_limit_secs.clamp(1, 30);
        self.memory_limit_mb = self.memory_limit_mb.clamp(16, 2048);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub input_data: String,
    #[serde(default)]
    pub time_limit: Option<u64>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    pub code: String,
    pub testcases: Vec<TestCase>,
    #[serde(default)]
    pub time_limit: Option<u64>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub verdict: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
