//! Manual test-case files and test-id discovery.
//!
//! Test cases for a story live in `<manual_root>/<storyId>/<type>_test_cases.md`.
//! Smoke cases carry `SMK_` ids, regression cases `REG_` ids.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use autoscribe_types::{AutoscribeError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseType {
    Smoke,
    Regression,
}

impl TestCaseType {
    /// Prefix every test id of this type starts with.
    pub fn prefix(self) -> &'static str {
        match self {
            TestCaseType::Smoke => "SMK_",
            TestCaseType::Regression => "REG_",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestCaseType::Smoke => "smoke",
            TestCaseType::Regression => "regression",
        }
    }

    /// File name of the test-case document for this type.
    pub fn file_name(self) -> String {
        format!("{}_test_cases.md", self.as_str())
    }

    /// Location of the test-case document for `story_id`.
    pub fn file_path(self, manual_root: &Path, story_id: &str) -> PathBuf {
        manual_root.join(story_id).join(self.file_name())
    }

    /// Infer the type from a test id's prefix.
    pub fn from_test_id(test_id: &str) -> Option<Self> {
        [TestCaseType::Smoke, TestCaseType::Regression]
            .into_iter()
            .find(|t| test_id.starts_with(t.prefix()))
    }
}

impl fmt::Display for TestCaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestCaseType {
    type Err = AutoscribeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smoke" | "smk" => Ok(TestCaseType::Smoke),
            "regression" | "reg" => Ok(TestCaseType::Regression),
            other => Err(AutoscribeError::Validation(format!(
                "unknown test case type '{other}' (expected smoke or regression)"
            ))),
        }
    }
}

/// Every distinct test id of `kind` in `content`, in order of first appearance.
pub fn extract_test_ids(content: &str, kind: TestCaseType) -> Vec<String> {
    let pattern = format!(r"\b{}\w+", regex::escape(kind.prefix()));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::error!(pattern = %pattern, error = %e, "Invalid test id pattern");
            return Vec::new();
        }
    };

    let mut ids: Vec<String> = Vec::new();
    for m in re.find_iter(content) {
        let id = m.as_str();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Read the story's test-case document and list its test ids.
pub async fn discover_test_ids(
    manual_root: &Path,
    story_id: &str,
    kind: TestCaseType,
) -> Result<Vec<String>> {
    let path = kind.file_path(manual_root, story_id);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AutoscribeError::MissingInput {
                field: format!("test case file {}", path.display()),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let ids = extract_test_ids(&content, kind);
    tracing::info!(
        story = %story_id,
        kind = %kind,
        path = %path.display(),
        count = ids.len(),
        "Discovered test ids"
    );
    Ok(ids)
}
