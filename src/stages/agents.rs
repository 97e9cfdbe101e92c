//! The built-in agent stages.
//!
//! Every stage asks its completion client for a JSON reply and reads the
//! fields it knows. A missing field, or a reply that is not JSON at all,
//! falls back to that stage's default: the run keeps moving on degraded
//! upstream output instead of failing.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_common::{
    AnalysisRecord, IntakeRecord, OutputRecord, RunMode, StageInput, StageRecord, ValidationReport,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::llm::{CompletionClient, UpstreamReply};
use super::search::SearchClient;
use super::{Stage, StageKind, prompts};
use crate::errors::StageFailure;

const DEFAULT_CONFIDENCE: f64 = 0.8;

async fn ask<T: DeserializeOwned + Default>(
    client: &dyn CompletionClient,
    system: &str,
    user: &str,
) -> Result<T, StageFailure> {
    let raw = client
        .complete(system, user)
        .await
        .map_err(|e| StageFailure::upstream("completion", format!("{:#}", e)))?;
    match UpstreamReply::<T>::parse(&raw) {
        UpstreamReply::Structured(reply) => Ok(reply),
        UpstreamReply::Text(text) => {
            tracing::debug!(chars = text.len(), "Completion reply was not structured; using defaults");
            Ok(T::default())
        }
    }
}

fn non_empty(list: Option<Vec<String>>) -> Option<Vec<String>> {
    list.filter(|items| !items.is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct IntakeReply {
    #[serde(default)]
    normalized_query: Option<String>,
    #[serde(default)]
    engagement_mode: Option<String>,
    #[serde(default)]
    tools_needed: Option<Vec<String>>,
    #[serde(default)]
    constraints: Option<Vec<String>>,
}

pub struct IntakeStage {
    pub client: Arc<dyn CompletionClient>,
    pub prompt: String,
}

#[async_trait]
impl Stage for IntakeStage {
    async fn invoke(&self, input: &StageInput) -> Result<StageRecord, StageFailure> {
        let reply: IntakeReply = ask(self.client.as_ref(), &self.prompt, &prompts::intake(input)).await?;

        let normalized_query = reply
            .normalized_query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| input.query.trim().to_string());
        let engagement_mode = reply
            .engagement_mode
            .and_then(|m| m.parse::<RunMode>().ok())
            .unwrap_or(input.mode);
        let tools_needed = non_empty(reply.tools_needed).unwrap_or_else(|| {
            StageKind::PIPELINE
                .iter()
                .filter(|k| **k != StageKind::Intake)
                .map(|k| k.as_str().to_string())
                .collect()
        });

        Ok(StageRecord::Intake(IntakeRecord {
            normalized_query,
            engagement_mode,
            tools_needed,
            constraints: reply.constraints.unwrap_or_default(),
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResearchReply {
    #[serde(default)]
    candidates: Option<Vec<String>>,
}

pub struct ResearchStage {
    pub client: Arc<dyn CompletionClient>,
    pub search: Arc<dyn SearchClient>,
    pub prompt: String,
}

#[async_trait]
impl Stage for ResearchStage {
    async fn invoke(&self, input: &StageInput) -> Result<StageRecord, StageFailure> {
        let snippets = self
            .search
            .search(&input.query)
            .await
            .map_err(|e| StageFailure::upstream("search", format!("{:#}", e)))?;

        let reply: ResearchReply = ask(
            self.client.as_ref(),
            &self.prompt,
            &prompts::research(&input.query, &snippets),
        )
        .await?;

        Ok(StageRecord::candidates(
            non_empty(reply.candidates).unwrap_or(snippets),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    options: Option<Vec<String>>,
    #[serde(default)]
    rationale: Option<String>,
}

pub struct AnalysisStage {
    pub client: Arc<dyn CompletionClient>,
    pub prompt: String,
}

#[async_trait]
impl Stage for AnalysisStage {
    async fn invoke(&self, input: &StageInput) -> Result<StageRecord, StageFailure> {
        let subject = input.subject();
        let reply: AnalysisReply =
            ask(self.client.as_ref(), &self.prompt, &prompts::analysis(subject)).await?;

        Ok(StageRecord::Analysis(AnalysisRecord {
            options: non_empty(reply.options).unwrap_or_else(|| vec![subject.to_string()]),
            rationale: reply
                .rationale
                .unwrap_or_else(|| "No rationale returned; carrying the research pick forward.".to_string()),
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ValidationReply {
    #[serde(default)]
    is_consistent: Option<bool>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    notes: Option<String>,
}

pub struct ValidationStage {
    pub client: Arc<dyn CompletionClient>,
    pub prompt: String,
}

#[async_trait]
impl Stage for ValidationStage {
    async fn invoke(&self, input: &StageInput) -> Result<StageRecord, StageFailure> {
        let reply: ValidationReply = ask(
            self.client.as_ref(),
            &self.prompt,
            &prompts::validation(input.subject()),
        )
        .await?;

        Ok(StageRecord::Validation(ValidationReport::new(
            reply.is_consistent.unwrap_or(true),
            reply.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            reply
                .notes
                .unwrap_or_else(|| "No validation notes returned.".to_string()),
        )))
    }
}

#[derive(Debug, Default, Deserialize)]
struct OutputReply {
    #[serde(default)]
    final_text: Option<String>,
}

pub struct OutputStage {
    pub client: Arc<dyn CompletionClient>,
    pub prompt: String,
}

#[async_trait]
impl Stage for OutputStage {
    async fn invoke(&self, input: &StageInput) -> Result<StageRecord, StageFailure> {
        let option = input.subject();
        let reply: OutputReply = ask(
            self.client.as_ref(),
            &self.prompt,
            &prompts::output(option, input.validation.as_ref()),
        )
        .await?;

        Ok(StageRecord::Output(OutputRecord {
            final_text: reply
                .final_text
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| option.to_string()),
        }))
    }
}
