//! Decides the next action of a round.

use anyhow::Result;
use tracing::{info, instrument};

use super::ask;
use crate::cancel::CancelToken;
use crate::core::sanitize::tidy_lines;
use crate::core::transaction::TransactionLog;
use crate::core::types::{Plan, Purpose};
use crate::io::oracle::{Oracle, OracleError};
use crate::io::prompt::{PromptBuilder, PromptMode};

pub struct Planner<'a> {
    prompts: &'a PromptBuilder,
}

impl<'a> Planner<'a> {
    pub fn new(prompts: &'a PromptBuilder) -> Self {
        Self { prompts }
    }

    /// Summarize the work so far (skipped while only the seed is logged) and
    /// ask for the single next action.
    #[instrument(skip_all, fields(log_len = log.len()))]
    pub fn plan_next<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        log: &TransactionLog,
        mission: &str,
        cancel: &CancelToken,
    ) -> Result<Plan> {
        let what_we_did = if log.len() > 1 {
            let messages = self
                .prompts
                .build_messages(log, PromptMode::WhatDidWeDo, mission)?;
            let raw = ask(
                oracle,
                self.prompts.summary_system(),
                messages,
                Purpose::WhatDidWeDo,
                cancel,
            )?;
            Some(tidied(&raw, Purpose::WhatDidWeDo)?)
        } else {
            None
        };

        let messages = self
            .prompts
            .build_messages(log, PromptMode::WhatToDo, mission)?;
        let raw = ask(
            oracle,
            self.prompts.planner_system(),
            messages,
            Purpose::WhatToDo,
            cancel,
        )?;
        let what_to_do = tidied(&raw, Purpose::WhatToDo)?;
        info!(summarized = what_we_did.is_some(), "planned next action");
        Ok(Plan {
            what_we_did,
            what_to_do,
        })
    }
}

fn tidied(raw: &str, purpose: Purpose) -> Result<String> {
    let text = tidy_lines(raw);
    if text.is_empty() {
        return Err(OracleError::EmptyResponse { purpose }.into());
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedOracle;

    #[test]
    fn first_round_skips_summary() {
        let prompts = PromptBuilder::new().expect("prompts");
        let oracle = ScriptedOracle::new().respond(Purpose::WhatToDo, "  read data.csv  \n\n");
        let mut log = TransactionLog::new();
        log.seed_if_empty();

        let plan = Planner::new(&prompts)
            .plan_next(&oracle, &log, "count lines", &CancelToken::new())
            .expect("plan");

        assert_eq!(plan.what_we_did, None);
        assert_eq!(plan.what_to_do, "read data.csv");
        assert_eq!(oracle.purposes(), [Purpose::WhatToDo]);
    }

    #[test]
    fn later_rounds_summarize_first() {
        let prompts = PromptBuilder::new().expect("prompts");
        let oracle = ScriptedOracle::new()
            .respond(Purpose::WhatDidWeDo, " read the file\n\n  counted 3 lines ")
            .respond(Purpose::WhatToDo, "write result.txt");
        let mut log = TransactionLog::new();
        log.seed_if_empty();
        log.record_round("code", "3");

        let plan = Planner::new(&prompts)
            .plan_next(&oracle, &log, "count lines", &CancelToken::new())
            .expect("plan");

        assert_eq!(
            plan.what_we_did.as_deref(),
            Some("read the file\ncounted 3 lines")
        );
        assert_eq!(oracle.purposes(), [Purpose::WhatDidWeDo, Purpose::WhatToDo]);
    }

    #[test]
    fn blank_plan_is_fatal() {
        let prompts = PromptBuilder::new().expect("prompts");
        let oracle = ScriptedOracle::new().respond(Purpose::WhatToDo, "\n   \n");
        let mut log = TransactionLog::new();
        log.seed_if_empty();

        let err = Planner::new(&prompts)
            .plan_next(&oracle, &log, "m", &CancelToken::new())
            .unwrap_err();
        assert!(err.downcast_ref::<OracleError>().is_some());
    }
}
