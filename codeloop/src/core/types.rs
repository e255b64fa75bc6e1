//! Shared deterministic types for the mission loop.
//!
//! These types define the contracts between the planner, the code generator,
//! the evaluator and the orchestrator. They carry no I/O.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Chat role of a message sent to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of an oracle conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Why an oracle call is being made. Used for logging and by scripted oracles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Purpose {
    WhatDidWeDo,
    WhatToDo,
    GenerateCode,
    PackageNames,
    EvaluateCode,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::WhatDidWeDo => "whatDidWeDo",
            Purpose::WhatToDo => "whatToDo",
            Purpose::GenerateCode => "generateCode",
            Purpose::PackageNames => "packageNames",
            Purpose::EvaluateCode => "evaluateCode",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planner output for one round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    /// Summary of completed work. `None` on the first round.
    pub what_we_did: Option<String>,
    /// The single next action.
    pub what_to_do: String,
}

/// Sanitized code plus the packages it needs installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCode {
    pub code: String,
    pub packages: BTreeSet<String>,
}
