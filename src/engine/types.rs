//! Request, state and report types for brand perception executions.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trace::now_epoch_ms;

// =============================================================================
// Request
// =============================================================================

/// A model the caller wants queried, as selected in the request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSelection {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ModelSelection {
    pub fn enabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }
}

/// Input for one brand × question × model execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionRequest {
    /// Caller-chosen id. A uuid is generated when empty.
    #[serde(default)]
    pub execution_id: String,
    pub main_brand: String,
    #[serde(default)]
    pub competitor_brands: Vec<String>,
    pub questions: Vec<String>,
    pub models: Vec<ModelSelection>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_level: Option<String>,
    /// Overall deadline. Zero means "use the engine default".
    #[serde(default)]
    pub timeout_seconds: u64,
}

impl ExecutionRequest {
    /// Main brand first, then competitors in request order. Blank names and
    /// repeats are dropped.
    pub fn brands(&self) -> Vec<String> {
        let mut brands: Vec<String> = Vec::with_capacity(1 + self.competitor_brands.len());
        for brand in std::iter::once(&self.main_brand).chain(self.competitor_brands.iter()) {
            let brand = brand.trim();
            if !brand.is_empty() && !brands.iter().any(|b| b == brand) {
                brands.push(brand.to_string());
            }
        }
        brands
    }

    /// Names of the enabled models, in request order.
    pub fn enabled_models(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.name.clone())
            .collect()
    }
}

// =============================================================================
// Task
// =============================================================================

/// One (brand, question, model) unit of work.
///
/// Identity is the three fields; `competitors` is context for prompt
/// rendering and parsing and does not take part in equality.
#[derive(Debug, Clone)]
pub struct Task {
    pub brand: String,
    pub question: String,
    pub model: String,
    pub competitors: Arc<[String]>,
}

impl Task {
    pub fn new(
        brand: impl Into<String>,
        question: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            brand: brand.into(),
            question: question.into(),
            model: model.into(),
            competitors: Arc::from(Vec::new()),
        }
    }

    pub fn with_competitors(mut self, competitors: Arc<[String]>) -> Self {
        self.competitors = competitors;
        self
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.brand == other.brand && self.question == other.question && self.model == other.model
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.brand.hash(state);
        self.question.hash(state);
        self.model.hash(state);
    }
}

// =============================================================================
// Execution state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot served to pollers. Always a copy; never shared mutably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub total: usize,
    pub completed: usize,
    pub status: ExecutionStatus,
    pub stage: String,
    pub progress_percent: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub missing_count: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn pending(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            total: 0,
            completed: 0,
            status: ExecutionStatus::Pending,
            stage: "pending".to_string(),
            progress_percent: 0,
            deadline: None,
            error_message: None,
            missing_count: None,
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn recompute_percent(&mut self) {
        self.progress_percent = if self.total == 0 {
            0
        } else {
            ((self.completed.min(self.total) * 100) / self.total) as u8
        };
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Loosely-typed fields extracted from an answer (brand_mentioned, rank,
/// sentiment, ...). Ordered so hashing and serialization are canonical.
pub type ParsedData = BTreeMap<String, serde_json::Value>;

/// The recorded result of one task. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutcome {
    pub brand: String,
    pub question: String,
    pub model: String,
    pub success: bool,
    /// The model's circuit was open; no call was made.
    #[serde(default)]
    pub skipped: bool,
    pub response: Option<String>,
    pub parsed_data: Option<ParsedData>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub timestamp_ms: i64,
}

pub const CIRCUIT_OPEN_MESSAGE: &str = "circuit open";

impl RawOutcome {
    fn base(task: &Task) -> Self {
        Self {
            brand: task.brand.clone(),
            question: task.question.clone(),
            model: task.model.clone(),
            success: false,
            skipped: false,
            response: None,
            parsed_data: None,
            error_message: None,
            attempts: 0,
            timestamp_ms: now_epoch_ms(),
        }
    }

    pub fn success(task: &Task, response: String, parsed: ParsedData, attempts: u32) -> Self {
        Self {
            success: true,
            response: Some(response),
            parsed_data: Some(parsed),
            attempts,
            ..Self::base(task)
        }
    }

    pub fn failure(task: &Task, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            error_message: Some(error.into()),
            attempts,
            ..Self::base(task)
        }
    }

    pub fn skipped(task: &Task) -> Self {
        Self {
            skipped: true,
            error_message: Some(CIRCUIT_OPEN_MESSAGE.to_string()),
            ..Self::base(task)
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Per-brand aggregate, derived from outcomes on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandSummary {
    pub brand: String,
    pub mention_count: usize,
    pub avg_rank: f64,
    pub avg_sentiment: f64,
    pub positive_count: usize,
    pub negative_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletenessCheck {
    pub ok: bool,
    pub missing: usize,
}

/// The single report produced for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub created_at: String,
    pub total_tasks: usize,
    pub outcomes: Vec<RawOutcome>,
    pub missing_count: usize,
    pub brand_summaries: Vec<BrandSummary>,
    pub quality_score: f64,
    pub quality_level: String,
    pub warnings: Vec<String>,
    pub insights: Option<BTreeMap<String, serde_json::Value>>,
}

impl FinalReport {
    /// Empty but valid report, used when report construction itself fails.
    pub fn degraded(
        execution_id: impl Into<String>,
        status: ExecutionStatus,
        total_tasks: usize,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            status,
            created_at: Utc::now().to_rfc3339(),
            total_tasks,
            outcomes: Vec::new(),
            missing_count: total_tasks,
            brand_summaries: Vec::new(),
            quality_score: 0.0,
            quality_level: "unknown".to_string(),
            warnings,
            insights: None,
        }
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }
}
