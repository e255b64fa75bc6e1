//! The three oracle-backed roles of a round: plan, write code, judge.

use anyhow::Result;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::core::types::{ChatMessage, Purpose};
use crate::io::oracle::{Oracle, OracleRequest, require_text};

pub mod coder;
pub mod evaluator;
pub mod planner;

pub use coder::CodeGenerator;
pub use evaluator::Evaluator;
pub use planner::Planner;

/// One oracle call whose answer must carry text.
fn ask<O: Oracle + ?Sized>(
    oracle: &O,
    system: impl Into<String>,
    messages: Vec<ChatMessage>,
    purpose: Purpose,
    cancel: &CancelToken,
) -> Result<String> {
    let request = OracleRequest {
        system: system.into(),
        messages,
        purpose,
    };
    debug!(%purpose, turns = request.messages.len(), "asking oracle");
    let response = oracle.chat_completion(&request, cancel)?;
    require_text(response, purpose)
}
