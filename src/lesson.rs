//! Lesson submissions: run code against stored test cases.
//!
//! The store is an external collaborator; this module only needs test cases
//! for a lesson and somewhere to report the pass/fail outcome.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::{ExecutionBackend, ExecutionRequest, ExecutionResult};
use crate::error::ExecError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    #[serde(alias = "output")]
    pub expected_output: String,
}

/// Result of one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub result: ExecutionResult,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub lesson_id: String,
    pub passed: bool,
    pub results: Vec<CaseResult>,
}

/// Source of lesson test cases and sink for outcomes.
#[async_trait]
pub trait LessonStore: Send + Sync {
    /// Test cases for `lesson_id`, or `None` for an unknown lesson.
    async fn test_cases(&self, lesson_id: &str) -> Option<Vec<TestCase>>;

    /// Record whether `user_id` passed `lesson_id`.
    async fn record_outcome(&self, user_id: &str, lesson_id: &str, passed: bool);
}

/// Lesson store backed by a JSON file of `{lessonId: [{input, expectedOutput}]}`.
///
/// Outcomes are kept in memory only.
#[derive(Debug, Default)]
pub struct JsonLessonStore {
    lessons: HashMap<String, Vec<TestCase>>,
    outcomes: RwLock<HashMap<(String, String), bool>>,
}

impl JsonLessonStore {
    pub fn new(lessons: HashMap<String, Vec<TestCase>>) -> Self {
        Self {
            lessons,
            outcomes: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lessons file {}", path.display()))?;
        let lessons: HashMap<String, Vec<TestCase>> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse lessons file {}", path.display()))?;
        info!(lessons = lessons.len(), path = %path.display(), "Loaded lessons");
        Ok(Self::new(lessons))
    }

    pub async fn outcome(&self, user_id: &str, lesson_id: &str) -> Option<bool> {
        self.outcomes
            .read()
            .await
            .get(&(user_id.to_string(), lesson_id.to_string()))
            .copied()
    }
}

#[async_trait]
impl LessonStore for JsonLessonStore {
    async fn test_cases(&self, lesson_id: &str) -> Option<Vec<TestCase>> {
        self.lessons.get(lesson_id).cloned()
    }

    async fn record_outcome(&self, user_id: &str, lesson_id: &str, passed: bool) {
        self.outcomes
            .write()
            .await
            .insert((user_id.to_string(), lesson_id.to_string()), passed);
    }
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Whether `result` counts as a pass for `case`.
pub fn case_passed(result: &ExecutionResult, case: &TestCase) -> bool {
    !result.is_waiting_for_input
        && !result.timed_out
        && normalize(&result.stdout) == normalize(&case.expected_output)
}

/// Run `code` once per test case, sequentially, feeding each case's input.
pub async fn grade(
    backend: &dyn ExecutionBackend,
    lesson_id: &str,
    cases: &[TestCase],
    code: &str,
    language: &str,
) -> Result<Submission, ExecError> {
    let mut results = Vec::with_capacity(cases.len());
    for (index, case) in cases.iter().enumerate() {
        let request = ExecutionRequest {
            code: code.to_string(),
            language: language.to_string(),
            stdin: (!case.input.is_empty()).then(|| case.input.clone()),
            interactive: false,
        };
        let result = backend.execute(request).await?;
        let passed = case_passed(&result, case);
        debug!(lesson = %lesson_id, case = index, passed, "Graded test case");
        results.push(CaseResult { result, passed });
    }

    let passed = !results.is_empty() && results.iter().all(|r| r.passed);
    Ok(Submission {
        lesson_id: lesson_id.to_string(),
        passed,
        results,
    })
}
