//! Generation Orchestrator
//!
//! Drives one natural-language request to a scoped SQL statement:
//!
//! * view mode: the model writes SQL over the approved views; every reply is
//!   cleaned and validated, and failures are fed back as a correction turn
//!   until an attempt passes or the attempt budget is spent.
//! * fragment mode: the model selects fragments as JSON; unparseable replies
//!   are retried the same way, structural composition errors are not.
//!
//! In both modes the caller's [`AccessScope`] is forced onto the final SQL
//! regardless of what the model wrote. Dropping the future returned by
//! [`QueryGenerator::handle`] abandons any in-flight LLM or database call and
//! starts no further attempts.

use crate::composer::{Complexity, FragmentComposer};
use crate::config::AppConfig;
use crate::error::{QueryError, Result};
use crate::executor::{QueryExecutor, Row};
use crate::fragments::FragmentStore;
use crate::interpretation::{parse_interpretation, AIInterpretation, Clarification};
use crate::llm::{ChatMessage, ChatModel, ChatResponse};
use crate::prompts::{
    fragment_system_prompt, interpretation_correction_prompt, view_correction_prompt,
    view_system_prompt,
};
use crate::sql_text::table_refs;
use crate::scope::{enforce_fragment_scope, AccessScope, SchoolId, SchoolScope, TeacherId};
use crate::validator::{ValidationResult, ViewSqlValidator};
use crate::view_builder::{
    clean_llm_response, format_sql, inject_teacher_filter, inject_tenant_filters, main_from,
    tenant_filters,
};
use crate::views::{ViewCatalog, ROSTER_VIEW};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Fragment,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub mode: GenerationMode,
    #[serde(default)]
    pub execute: bool,
}

/// Retry-loop state. `n` is the 1-based attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Attempting(u8),
    Retrying(u8),
    Validated(u8),
    Exhausted(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Passed,
    Failed,
}

impl GenerationState {
    pub fn start(self) -> Self {
        match self {
            GenerationState::Idle => GenerationState::Attempting(1),
            other => other,
        }
    }

    /// Record the outcome of the current attempt.
    pub fn advance(self, outcome: AttemptOutcome, max_attempts: u8) -> Self {
        match (self, outcome) {
            (GenerationState::Attempting(n), AttemptOutcome::Passed) => GenerationState::Validated(n),
            (GenerationState::Attempting(n), AttemptOutcome::Failed) if n >= max_attempts => {
                GenerationState::Exhausted(n)
            }
            (GenerationState::Attempting(n), AttemptOutcome::Failed) => GenerationState::Retrying(n),
            (other, _) => other,
        }
    }

    pub fn retry(self) -> Self {
        match self {
            GenerationState::Retrying(n) => GenerationState::Attempting(n.saturating_add(1)),
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationState::Validated(_) | GenerationState::Exhausted(_))
    }

    pub fn attempt(&self) -> u8 {
        match self {
            GenerationState::Idle => 0,
            GenerationState::Attempting(n)
            | GenerationState::Retrying(n)
            | GenerationState::Validated(n)
            | GenerationState::Exhausted(n) => *n,
        }
    }
}

/// One LLM round trip, kept for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAttempt {
    pub attempt: u8,
    pub sql: String,
    pub raw_response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction_prompt: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    pub mode: GenerationMode,
    pub school_scope: SchoolScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragments_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_views: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<Complexity>,
    pub warnings: Vec<String>,
    pub attempt_count: u8,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub success: bool,
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_error: Option<String>,
    pub metadata: ResponseMetadata,
}

/// Coarse failure class, used by front ends to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureKind {
    BadRequest,
    Forbidden,
    NeedsClarification,
    Unprocessable,
    #[default]
    Internal,
}

impl FailureKind {
    pub fn status_code(&self) -> u16 {
        match self {
            FailureKind::BadRequest => 400,
            FailureKind::Forbidden => 403,
            FailureKind::NeedsClarification => 200,
            FailureKind::Unprocessable => 422,
            FailureKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_clarification: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clarifications: Vec<Clarification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<QueryAttempt>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip)]
    pub kind: FailureKind,
}

impl FailureResponse {
    fn new(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            kind,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationResponse {
    Success(Box<SuccessResponse>),
    Failure(FailureResponse),
}

impl GenerationResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResponse::Success(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            GenerationResponse::Success(_) => 200,
            GenerationResponse::Failure(f) => f.kind.status_code(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub max_attempts: u8,
    pub clarification_threshold: f64,
    pub llm_timeout: Duration,
    pub default_base_fragment: String,
    pub fragment_scope_column: String,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for GeneratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            clarification_threshold: config.clarification_threshold,
            llm_timeout: config.llm_timeout,
            default_base_fragment: config.default_base_fragment.clone(),
            fragment_scope_column: config.fragment_scope_column.clone(),
        }
    }
}

/// Per-request bookkeeping shared by both modes.
struct RequestContext<'r> {
    id: String,
    started: Instant,
    request: &'r GenerationRequest,
    scope: &'r AccessScope,
    schools: Option<Vec<SchoolId>>,
}

impl RequestContext<'_> {
    fn failure(&self, mut failure: FailureResponse) -> GenerationResponse {
        failure.request_id = Some(self.id.clone());
        GenerationResponse::Failure(failure)
    }

    fn diagnostics(&self, attempts: Vec<QueryAttempt>) -> Option<Vec<QueryAttempt>> {
        self.scope.diagnostics.then_some(attempts)
    }
}

pub struct QueryGenerator {
    llm: Arc<dyn ChatModel>,
    fragments: Arc<dyn FragmentStore>,
    executor: Option<Arc<dyn QueryExecutor>>,
    catalog: ViewCatalog,
    settings: GeneratorSettings,
}

impl QueryGenerator {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        fragments: Arc<dyn FragmentStore>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            llm,
            fragments,
            executor: None,
            catalog: ViewCatalog::standard().clone(),
            settings,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_catalog(mut self, catalog: ViewCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Run one request. Never fails: unexpected errors become a generic
    /// failure response.
    pub async fn handle(&self, request: &GenerationRequest, scope: &AccessScope) -> GenerationResponse {
        let request_id = Uuid::new_v4().to_string();
        info!(
            "[{}] {:?} request: {}",
            request_id,
            request.mode,
            request.prompt.chars().take(200).collect::<String>()
        );

        match self.generate(request, scope, request_id.clone()).await {
            Ok(response) => response,
            Err(e) => {
                error!("[{}] Generation failed: {}", request_id, e);
                let (kind, message) = match e {
                    QueryError::Scope(_) => (FailureKind::Forbidden, "Access denied"),
                    QueryError::Timeout(_) => (
                        FailureKind::Internal,
                        "The language model did not respond in time",
                    ),
                    _ => (FailureKind::Internal, "Query generation failed"),
                };
                let mut failure = FailureResponse::new(kind, message);
                failure.request_id = Some(request_id);
                GenerationResponse::Failure(failure)
            }
        }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        scope: &AccessScope,
        id: String,
    ) -> Result<GenerationResponse> {
        let mut ctx = RequestContext {
            id,
            started: Instant::now(),
            request,
            scope,
            schools: None,
        };

        if request.prompt.trim().is_empty() {
            return Ok(ctx.failure(FailureResponse::new(
                FailureKind::BadRequest,
                "Prompt must not be empty",
            )));
        }
        if !scope.has_access() {
            warn!("[{}] Caller has no school access", ctx.id);
            return Ok(ctx.failure(FailureResponse::new(
                FailureKind::Forbidden,
                "No school access",
            )));
        }
        ctx.schools = scope.effective_schools()?;

        match request.mode {
            GenerationMode::View => self.generate_from_views(&ctx).await,
            GenerationMode::Fragment => self.generate_from_fragments(&ctx).await,
        }
    }

    async fn call_model(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        tokio::time::timeout(self.settings.llm_timeout, self.llm.chat(messages))
            .await
            .map_err(|_| {
                QueryError::Timeout(format!(
                    "no LLM response within {}s",
                    self.settings.llm_timeout.as_secs()
                ))
            })?
    }

    async fn generate_from_views(&self, ctx: &RequestContext<'_>) -> Result<GenerationResponse> {
        let validator = ViewSqlValidator::new(&self.catalog);
        let mut messages = vec![
            ChatMessage::system(view_system_prompt(&self.catalog)),
            ChatMessage::user(ctx.request.prompt.clone()),
        ];
        let mut attempts: Vec<QueryAttempt> = Vec::new();
        let mut accepted: Option<(String, ValidationResult)> = None;
        let mut state = GenerationState::Idle;

        while !state.is_terminal() {
            state = match state {
                GenerationState::Idle => state.start(),
                GenerationState::Retrying(_) => state.retry(),
                GenerationState::Attempting(n) => {
                    let reply = self.call_model(&messages).await?;
                    let sql = clean_llm_response(&reply.content);
                    let mut validation = validator.validate(&sql);

                    if validation.valid {
                        match self.scope_view_sql(&sql, ctx.schools.as_deref(), ctx.scope.roster_teacher) {
                            Ok(scoped) => {
                                let recheck = validator.validate(&scoped);
                                if recheck.valid {
                                    accepted = Some((scoped, recheck));
                                } else {
                                    validation.valid = false;
                                    validation.errors.extend(recheck.errors);
                                }
                            }
                            Err(message) => {
                                validation.valid = false;
                                validation.errors.push(message);
                            }
                        }
                    }

                    let outcome = if accepted.is_some() {
                        AttemptOutcome::Passed
                    } else {
                        AttemptOutcome::Failed
                    };
                    let next = state.advance(outcome, self.settings.max_attempts);

                    let correction = matches!(next, GenerationState::Retrying(_))
                        .then(|| view_correction_prompt(&sql, &validation.errors));
                    if outcome == AttemptOutcome::Failed {
                        warn!(
                            "[{}] Attempt {} rejected: {}",
                            ctx.id,
                            n,
                            validation.errors.join("; ")
                        );
                    }
                    if let Some(correction) = &correction {
                        messages.push(ChatMessage::assistant(reply.content.clone()));
                        messages.push(ChatMessage::user(correction.clone()));
                    }

                    attempts.push(QueryAttempt {
                        attempt: n,
                        sql,
                        raw_response: reply.content,
                        validation: Some(validation),
                        parse_error: None,
                        correction_prompt: correction,
                        timestamp: Utc::now(),
                    });
                    next
                }
                terminal => terminal,
            };
        }

        let attempt_count = state.attempt();
        let Some((sql, validation)) = accepted else {
            let last_errors = attempts
                .last()
                .and_then(|a| a.validation.as_ref())
                .map(|v| v.errors.clone())
                .unwrap_or_default();
            let mut failure = FailureResponse::new(
                FailureKind::Unprocessable,
                format!("Could not generate a valid query after {} attempts", attempt_count),
            );
            if ctx.scope.diagnostics {
                failure.errors = last_errors;
            }
            failure.attempts = ctx.diagnostics(attempts);
            return Ok(ctx.failure(failure));
        };

        info!("[{}] Query validated on attempt {}", ctx.id, attempt_count);

        let ValidationResult {
            warnings,
            referenced_views,
            ..
        } = validation;

        let metadata = ResponseMetadata {
            request_id: ctx.id.clone(),
            mode: GenerationMode::View,
            school_scope: ctx.scope.summary(),
            fragments_used: None,
            referenced_views: Some(referenced_views),
            estimated_complexity: None,
            warnings,
            attempt_count,
            duration_ms: 0,
        };
        Ok(self.finish(ctx, sql, None, metadata).await)
    }

    /// Force the caller's scope onto validated view SQL. An `Err` is fed back
    /// to the model as a validation error.
    fn scope_view_sql(
        &self,
        sql: &str,
        schools: Option<&[SchoolId]>,
        teacher: Option<TeacherId>,
    ) -> std::result::Result<String, String> {
        if schools.is_none() && teacher.is_none() {
            return Ok(sql.to_string());
        }

        let main = main_from(sql).ok_or_else(|| {
            "The query must select FROM one approved view with an alias so the school scope can be applied"
                .to_string()
        })?;

        let mut scoped = sql.to_string();
        if let Some(ids) = schools {
            let tenant = self.catalog.tenant_column.as_str();
            let refs = table_refs(&scoped);
            let mut aliases: Vec<&str> = Vec::new();
            for relation in &refs {
                if !self.catalog.is_allowed_view(&relation.name) {
                    return Err(format!(
                        "View '{}' is not approved, so it cannot be limited to the caller's schools",
                        relation.name
                    ));
                }
                if !self.catalog.has_column(&relation.name, tenant) {
                    continue;
                }
                if relation.depth > 0 {
                    return Err(format!(
                        "Subqueries over '{}' cannot be limited to the caller's schools; join the view in the main query instead",
                        relation.name
                    ));
                }
                aliases.push(relation.effective_alias());
            }

            scoped = inject_tenant_filters(&scoped, &aliases, tenant, ids);
            if aliases.is_empty() || !scoped.contains(&tenant_filters(&aliases, tenant, ids)) {
                return Err("The school scope could not be applied to this query".to_string());
            }
        }

        if let Some(teacher) = teacher {
            if !self.catalog.has_column(&main.name, "student_id") {
                return Err(format!(
                    "The query must select FROM a view with student_id (not '{}') so it can be limited to the teacher's roster",
                    main.name
                ));
            }
            scoped = inject_teacher_filter(&scoped, teacher);
            if !scoped.contains(&format!("JOIN {} ", ROSTER_VIEW)) {
                return Err("The roster scope could not be applied to this query".to_string());
            }
        }

        debug!("Scoped SQL: {}", scoped);
        Ok(scoped)
    }

    async fn generate_from_fragments(&self, ctx: &RequestContext<'_>) -> Result<GenerationResponse> {
        if ctx.scope.roster_teacher.is_some() {
            return Ok(ctx.failure(FailureResponse::new(
                FailureKind::Forbidden,
                "Fragment mode is not available for roster-scoped access",
            )));
        }

        let library = self.fragments.load_fragment_library().await?;
        let mut messages = vec![
            ChatMessage::system(fragment_system_prompt(&library)),
            ChatMessage::user(ctx.request.prompt.clone()),
        ];
        let mut attempts: Vec<QueryAttempt> = Vec::new();
        let mut interpretation: Option<AIInterpretation> = None;
        let mut state = GenerationState::Idle;

        while !state.is_terminal() {
            state = match state {
                GenerationState::Idle => state.start(),
                GenerationState::Retrying(_) => state.retry(),
                GenerationState::Attempting(n) => {
                    let reply = self.call_model(&messages).await?;
                    interpretation =
                        parse_interpretation(&reply.content, &library, &self.settings.default_base_fragment);

                    let outcome = if interpretation.is_some() {
                        AttemptOutcome::Passed
                    } else {
                        warn!("[{}] Attempt {}: interpretation could not be parsed", ctx.id, n);
                        AttemptOutcome::Failed
                    };
                    let next = state.advance(outcome, self.settings.max_attempts);
                    let correction = matches!(next, GenerationState::Retrying(_))
                        .then(interpretation_correction_prompt);
                    if let Some(correction) = &correction {
                        messages.push(ChatMessage::assistant(reply.content.clone()));
                        messages.push(ChatMessage::user(correction.clone()));
                    }

                    attempts.push(QueryAttempt {
                        attempt: n,
                        sql: String::new(),
                        raw_response: reply.content,
                        validation: None,
                        parse_error: interpretation
                            .is_none()
                            .then(|| "Failed to parse interpretation".to_string()),
                        correction_prompt: correction,
                        timestamp: Utc::now(),
                    });
                    next
                }
                terminal => terminal,
            };
        }

        let attempt_count = state.attempt();
        let Some(interpretation) = interpretation else {
            let mut failure = FailureResponse::new(
                FailureKind::Unprocessable,
                "Failed to parse the model's interpretation of the request",
            );
            failure.attempts = ctx.diagnostics(attempts);
            return Ok(ctx.failure(failure));
        };

        if interpretation.needs_clarification(self.settings.clarification_threshold) {
            info!(
                "[{}] Clarification needed (confidence {:.2})",
                ctx.id, interpretation.confidence
            );
            let mut failure = FailureResponse::new(
                FailureKind::NeedsClarification,
                "The request is ambiguous; please clarify",
            );
            failure.needs_clarification = true;
            failure.clarifications = interpretation.clarifications;
            return Ok(ctx.failure(failure));
        }

        let composition = FragmentComposer::new(&library)
            .with_default_base(self.settings.default_base_fragment.clone())
            .compose(&interpretation);

        if !composition.success {
            warn!(
                "[{}] Composition failed: {}",
                ctx.id,
                composition.errors.iter().join("; ")
            );
            let mut failure = FailureResponse::new(
                FailureKind::BadRequest,
                "Could not compose a query from the selected fragments",
            );
            failure.errors = composition.errors.iter().map(|e| e.to_string()).collect();
            return Ok(ctx.failure(failure));
        }

        let enforced = enforce_fragment_scope(
            &composition.query,
            &self.settings.fragment_scope_column,
            ctx.schools.as_deref(),
        );
        if enforced.corrected {
            warn!("[{}] School scope corrected on composed query", ctx.id);
        }

        let mut warnings = interpretation.warnings.clone();
        warnings.extend(composition.warnings.iter().cloned());

        let metadata = ResponseMetadata {
            request_id: ctx.id.clone(),
            mode: GenerationMode::Fragment,
            school_scope: ctx.scope.summary(),
            fragments_used: Some(composition.metadata.fragments_used.clone()),
            referenced_views: None,
            estimated_complexity: Some(composition.metadata.estimated_complexity),
            warnings,
            attempt_count,
            duration_ms: 0,
        };
        Ok(self
            .finish(ctx, enforced.sql, Some(composition.explanation), metadata)
            .await)
    }

    /// Optionally execute, then build the success response.
    async fn finish(
        &self,
        ctx: &RequestContext<'_>,
        sql: String,
        explanation: Option<String>,
        mut metadata: ResponseMetadata,
    ) -> GenerationResponse {
        let (data, execute_error) = if ctx.request.execute {
            match &self.executor {
                Some(executor) => match executor.run(&sql).await {
                    Ok(rows) => (Some(rows), None),
                    Err(e) => {
                        warn!("[{}] Execution failed: {}", ctx.id, e);
                        (None, Some(e.to_string()))
                    }
                },
                None => (None, Some("No query executor is configured".to_string())),
            }
        } else {
            (None, None)
        };

        metadata.duration_ms = ctx.started.elapsed().as_millis() as u64;
        GenerationResponse::Success(Box::new(SuccessResponse {
            success: true,
            formatted_sql: Some(format_sql(&sql)),
            row_count: data.as_ref().map(|rows| rows.len()),
            sql,
            explanation,
            data,
            execute_error,
            metadata,
        }))
    }
}
