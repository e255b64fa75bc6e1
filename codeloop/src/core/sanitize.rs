//! Cleanup of free-text oracle responses.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Node.js core modules; never installed from the registry.
const NODE_BUILTINS: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "diagnostics_channel",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "trace_events",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "wasi",
    "worker_threads",
    "zlib",
];

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n`]*\n(.*?)(?:```|\z)").unwrap());

static IMPORT_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"\brequire\(\s*['"]([^'"]+)['"]\s*\)"#,
        r#"\bfrom\s+['"]([^'"]+)['"]"#,
        r#"\bimport\s+['"]([^'"]+)['"]"#,
        r#"\bimport\(\s*['"]([^'"]+)['"]\s*\)"#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static PACKAGE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(@[a-z0-9~-][a-z0-9._~-]*/)?[a-z0-9~-][a-z0-9._~-]*$").unwrap()
});

/// Return the body of the first fenced code block, or the trimmed text when
/// there is no fence. An unterminated fence runs to the end of the text.
pub fn strip_fenced_code_blocks(text: &str) -> String {
    match FENCE_RE.captures(text).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str().trim_matches('\n').trim_end().to_string(),
        None => text.trim().to_string(),
    }
}

/// Trim every line and drop blank ones.
pub fn tidy_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collect registry packages imported by `code` (`require`, `import ... from`,
/// bare and dynamic `import`).
pub fn scan_imported_packages(code: &str) -> BTreeSet<String> {
    IMPORT_RES
        .iter()
        .flat_map(|re| re.captures_iter(code))
        .filter_map(|caps| caps.get(1))
        .filter_map(|specifier| package_root(specifier.as_str()))
        .collect()
}

/// Reduce an import specifier to an installable package name.
///
/// Returns `None` for relative paths, URLs, `node:` modules, Node built-ins and
/// anything that is not a valid npm package name.
pub fn package_root(specifier: &str) -> Option<String> {
    let specifier = specifier.trim();
    if specifier.is_empty()
        || specifier.starts_with('.')
        || specifier.starts_with('/')
        || specifier.starts_with("node:")
        || specifier.contains("://")
    {
        return None;
    }

    let mut segments = specifier.split('/');
    let first = segments.next()?;
    let root = if first.starts_with('@') {
        let name = segments.next()?;
        format!("{first}/{name}")
    } else {
        first.to_string()
    };

    if NODE_BUILTINS.contains(&root.as_str()) || !PACKAGE_NAME_RE.is_match(&root) {
        return None;
    }
    Some(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fence_with_language_tag() {
        let text = "Here you go:\n```javascript\nconsole.log(1);\n```\nDone.";
        assert_eq!(strip_fenced_code_blocks(text), "console.log(1);");
    }

    #[test]
    fn tolerates_missing_fence() {
        assert_eq!(
            strip_fenced_code_blocks("  console.log(2);\n"),
            "console.log(2);"
        );
    }

    #[test]
    fn unterminated_fence_runs_to_end() {
        let text = "```js\nconst a = 1;\nconsole.log(a);\n";
        assert_eq!(
            strip_fenced_code_blocks(text),
            "const a = 1;\nconsole.log(a);"
        );
    }

    #[test]
    fn tidy_lines_trims_and_drops_blanks() {
        let text = "  first  \n\n\t second\n   \n";
        assert_eq!(tidy_lines(text), "first\nsecond");
    }

    #[test]
    fn scan_finds_registry_packages_only() {
        let code = r#"
const fs = require('fs');
const { spawnSync } = require("node:child_process");
const sharp = require('sharp');
const helper = require('./helper');
import _ from 'lodash/fp';
import { parse } from "@fast-csv/parse/build";
import 'dotenv/config';
const chalk = await import('chalk');
"#;
        let packages: Vec<String> = scan_imported_packages(code).into_iter().collect();
        assert_eq!(
            packages,
            vec!["@fast-csv/parse", "chalk", "dotenv", "lodash", "sharp"]
        );
    }

    #[test]
    fn package_root_rejects_invalid_names() {
        assert_eq!(package_root("Not A Package"), None);
        assert_eq!(package_root("https://cdn.example.com/x.js"), None);
        assert_eq!(package_root("@scope"), None);
        assert_eq!(package_root("path"), None);
        assert_eq!(package_root("xlsx"), Some("xlsx".to_string()));
    }
}
