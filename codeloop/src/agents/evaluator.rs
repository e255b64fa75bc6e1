//! Completion check at the end of a round.

use anyhow::Result;
use tracing::{info, instrument};

use super::ask;
use crate::cancel::CancelToken;
use crate::core::transaction::TransactionLog;
use crate::core::types::Purpose;
use crate::core::verdict::{CompletionMatch, signals_completion};
use crate::io::oracle::Oracle;
use crate::io::prompt::{PromptBuilder, PromptMode};

pub struct Evaluator<'a> {
    prompts: &'a PromptBuilder,
    matching: CompletionMatch,
}

impl<'a> Evaluator<'a> {
    pub fn new(prompts: &'a PromptBuilder, matching: CompletionMatch) -> Self {
        Self { prompts, matching }
    }

    #[instrument(skip_all, fields(rounds = log.rounds(), matching = ?self.matching))]
    pub fn is_mission_complete<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        log: &TransactionLog,
        mission: &str,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let messages = self
            .prompts
            .build_messages(log, PromptMode::Evaluation, mission)?;
        let system = self.prompts.evaluator_system(mission)?;
        let response = ask(oracle, system, messages, Purpose::EvaluateCode, cancel)?;
        let complete = signals_completion(&response, self.matching);
        info!(complete, "evaluated round");
        Ok(complete)
    }
}
