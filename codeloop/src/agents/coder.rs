//! Code generation and package resolution.

use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::ask;
use crate::cancel::CancelToken;
use crate::core::sanitize::{package_root, scan_imported_packages, strip_fenced_code_blocks};
use crate::core::transaction::TransactionLog;
use crate::core::types::{ChatMessage, GeneratedCode, Plan, Purpose};
use crate::io::oracle::{Oracle, OracleError, OracleRequest};
use crate::io::prompt::{PromptBuilder, PromptMode};

const PACKAGE_NAMES_SCHEMA: &str = include_str!("../../schemas/package_names.schema.json");

/// Writes the program for a planned action.
pub struct CodeGenerator<'a> {
    prompts: &'a PromptBuilder,
    ask_for_packages: bool,
    package_schema: Validator,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(prompts: &'a PromptBuilder, ask_for_packages: bool) -> Result<Self> {
        let schema: Value = serde_json::from_str(PACKAGE_NAMES_SCHEMA)?;
        let package_schema =
            validator_for(&schema).map_err(|err| anyhow!("invalid package schema: {err}"))?;
        Ok(Self {
            prompts,
            ask_for_packages,
            package_schema,
        })
    }

    #[instrument(skip_all, fields(rounds = log.rounds()))]
    pub fn generate<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        log: &TransactionLog,
        mission: &str,
        plan: &Plan,
        cancel: &CancelToken,
    ) -> Result<GeneratedCode> {
        let mode = PromptMode::Coding {
            what_we_did: plan.what_we_did.as_deref(),
            what_to_do: &plan.what_to_do,
        };
        let messages = self.prompts.build_messages(log, mode, mission)?;
        let system = self.prompts.coder_system(mission, &plan.what_to_do)?;
        let raw = ask(oracle, system, messages, Purpose::GenerateCode, cancel)?;

        let code = strip_fenced_code_blocks(&raw);
        if code.is_empty() {
            return Err(OracleError::EmptyResponse {
                purpose: Purpose::GenerateCode,
            }
            .into());
        }

        let mut packages = scan_imported_packages(&code);
        if self.ask_for_packages {
            packages.extend(self.packages_from_oracle(oracle, &code, cancel)?);
        }
        info!(
            lines = code.lines().count(),
            packages = packages.len(),
            "code generated"
        );
        Ok(GeneratedCode { code, packages })
    }

    /// Ask the oracle which packages `code` needs. An answer that is not a
    /// JSON array of names is ignored.
    fn packages_from_oracle<O: Oracle + ?Sized>(
        &self,
        oracle: &O,
        code: &str,
        cancel: &CancelToken,
    ) -> Result<BTreeSet<String>> {
        let request = OracleRequest {
            system: self.prompts.packages_system().to_string(),
            messages: vec![ChatMessage::user(format!("```javascript\n{code}\n```"))],
            purpose: Purpose::PackageNames,
        };
        let raw = oracle.chat_completion(&request, cancel)?;
        match self.parse_package_names(&raw) {
            Ok(names) => {
                debug!(?names, "oracle package list");
                Ok(names)
            }
            Err(err) => {
                warn!(err = %err, "ignoring package list from oracle");
                Ok(BTreeSet::new())
            }
        }
    }

    fn parse_package_names(&self, raw: &str) -> Result<BTreeSet<String>> {
        let body = strip_fenced_code_blocks(raw);
        let value: Value = serde_json::from_str(&body)?;
        if !self.package_schema.is_valid(&value) {
            let messages = self
                .package_schema
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(anyhow!("package list schema validation failed: {}", messages.join("; ")));
        }
        let names: Vec<String> = serde_json::from_value(value)?;
        Ok(names.iter().filter_map(|name| package_root(name)).collect())
    }
}
