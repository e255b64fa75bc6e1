//! Prompt construction from the transaction log.
//!
//! Every oracle call sees the whole log as a chat transcript: outputs as user
//! turns, code as assistant turns. The final turn is replaced by a tail
//! rendered for the current [`PromptMode`].

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use thiserror::Error;
use tracing::debug;

use crate::core::excerpt::truncate_excerpt;
use crate::core::transaction::{Transaction, TransactionKind, TransactionLog};
use crate::core::types::{ChatMessage, Role};
use crate::core::verdict::{COMPLETION_TOKEN, CONTINUE_TOKEN};

const CODING_TEMPLATE: &str = include_str!("prompts/coding.md");
const EVALUATION_TEMPLATE: &str = include_str!("prompts/evaluation.md");
const WHAT_DID_WE_DO_TEMPLATE: &str = include_str!("prompts/whatdidwedo.md");
const WHAT_TO_DO_TEMPLATE: &str = include_str!("prompts/whattodo.md");
const SYSTEM_CODER_TEMPLATE: &str = include_str!("prompts/system_coder.md");
const SYSTEM_EVALUATOR_TEMPLATE: &str = include_str!("prompts/system_evaluator.md");
const SYSTEM_PACKAGES: &str = include_str!("prompts/system_packages.md");

const SYSTEM_SUMMARY: &str = "As an AI agent, analyze what has been done so far.";
const SYSTEM_PLANNER: &str = "You are an AI assistant that gives only the single next task needed \
     to complete the mission. Consider the progress so far and the results of the previous work. \
     Leave out code and anything unnecessary, answer with one sentence in the language of the \
     mission, and skip optional work.";

/// Placeholder for the first turn once the transcript has more than one turn.
pub const FIRST_TURN_PLACEHOLDER: &str = "make the first code to do";

/// Violations of the transcript shape. Raised, never corrected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("no transactions to build a prompt from")]
    EmptyLog,
    #[error("last transaction maps to role {role}, expected user")]
    TrailingRole { role: Role },
}

/// What the final turn asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode<'a> {
    Coding {
        what_we_did: Option<&'a str>,
        what_to_do: &'a str,
    },
    Evaluation,
    WhatDidWeDo,
    WhatToDo,
}

impl PromptMode<'_> {
    fn template_name(&self) -> &'static str {
        match self {
            PromptMode::Coding { .. } => "coding",
            PromptMode::Evaluation => "evaluation",
            PromptMode::WhatDidWeDo => "whatdidwedo",
            PromptMode::WhatToDo => "whattodo",
        }
    }
}

/// Renders transcripts and system instructions with minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        for (name, source) in [
            ("coding", CODING_TEMPLATE),
            ("evaluation", EVALUATION_TEMPLATE),
            ("whatdidwedo", WHAT_DID_WE_DO_TEMPLATE),
            ("whattodo", WHAT_TO_DO_TEMPLATE),
            ("system_coder", SYSTEM_CODER_TEMPLATE),
            ("system_evaluator", SYSTEM_EVALUATOR_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    /// Map the log to chat turns and replace the last turn with the mode tail.
    pub fn build_messages(
        &self,
        log: &TransactionLog,
        mode: PromptMode<'_>,
        mission: &str,
    ) -> Result<Vec<ChatMessage>> {
        let Some(last) = log.last() else {
            return Err(PromptError::EmptyLog.into());
        };

        let mut messages: Vec<ChatMessage> = log.entries().iter().map(render_transaction).collect();
        if let Some(trailing) = messages.last().map(|m| m.role)
            && trailing != Role::User
        {
            return Err(PromptError::TrailingRole { role: trailing }.into());
        }

        if messages.len() > 1 {
            messages[0].content = FIRST_TURN_PLACEHOLDER.to_string();
        }

        let tail = self.render_tail(mode, mission, last.payload.as_deref())?;
        if let Some(slot) = messages.last_mut() {
            *slot = ChatMessage::user(tail);
        }
        debug!(
            mode = mode.template_name(),
            turns = messages.len(),
            "built prompt transcript"
        );
        Ok(messages)
    }

    fn render_tail(&self, mode: PromptMode<'_>, mission: &str, last: Option<&str>) -> Result<String> {
        let last_output = last.map(truncate_excerpt);
        let template = self.env.get_template(mode.template_name())?;
        let rendered = match mode {
            PromptMode::Coding {
                what_we_did,
                what_to_do,
            } => template.render(context! {
                mission => mission,
                what_to_do => what_to_do.lines().collect::<Vec<_>>().join(" "),
                what_we_did => what_we_did.unwrap_or_default(),
                has_output => last_output.is_some(),
                last_output => last_output.as_deref().unwrap_or_default(),
            })?,
            PromptMode::Evaluation | PromptMode::WhatDidWeDo | PromptMode::WhatToDo => {
                template.render(context! {
                    mission => mission,
                    has_output => last_output.is_some(),
                    last_output => last_output.as_deref().unwrap_or_default(),
                    completion_token => COMPLETION_TOKEN,
                    continue_token => CONTINUE_TOKEN,
                })?
            }
        };
        Ok(rendered)
    }

    /// System instruction for code generation.
    pub fn coder_system(&self, mission: &str, what_to_do: &str) -> Result<String> {
        let rendered = self.env.get_template("system_coder")?.render(context! {
            mission => mission,
            what_to_do => what_to_do,
        })?;
        Ok(rendered)
    }

    /// System instruction for the completion check.
    pub fn evaluator_system(&self, mission: &str) -> Result<String> {
        let rendered = self
            .env
            .get_template("system_evaluator")?
            .render(context! { mission => mission })?;
        Ok(rendered)
    }

    pub fn summary_system(&self) -> &'static str {
        SYSTEM_SUMMARY
    }

    pub fn planner_system(&self) -> &'static str {
        SYSTEM_PLANNER
    }

    pub fn packages_system(&self) -> &'static str {
        SYSTEM_PACKAGES.trim_end()
    }
}

fn render_transaction(tx: &Transaction) -> ChatMessage {
    let body = tx.payload.as_deref().unwrap_or_default();
    match tx.kind {
        TransactionKind::Output => ChatMessage::user(format!(
            "Output of the Execution\n```shell\n$ node code.js\n{}\n```",
            truncate_excerpt(body)
        )),
        TransactionKind::Code => {
            ChatMessage::assistant(format!("Code to execute\n```javascript\n{body}\n```"))
        }
    }
}
