//! Editing of job-parameter strings.

use std::sync::LazyLock;

use regex::Regex;

use super::params::JobParam;

const ES_ONLY_OPEN: &str = "<PANDA_ES_ONLY>";
const ES_ONLY_CLOSE: &str = "</PANDA_ES_ONLY>";
const ES_PRE_INCLUDE: &str = "AthenaMP/AthenaMP_EventService.py";
const ES_PRE_EXEC: &str = "import os;pilot_tmp=type(str(),(),{})();\
pilot_tmp.__dict__.update(**os.environ);\
from AthenaMP.AthenaMPFlags import jobproperties as jps;\
jps.AthenaMPFlags.EventRangeChannel=pilot_tmp.PILOT_EVENTRANGECHANNEL";

/// Filename reserved for pass-through outputs.
const PASS_THROUGH_SUFFIX: &str = ".panda.um";

static NUMERIC_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\d+$").expect("numeric suffix pattern is valid"));

/// Split on whitespace, keeping quoted sections (quotes included) together.
pub fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => {
                current.push(c);
                quote = Some(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Splice `insert` before the closing character of every token that
/// mentions `param_name`.
pub fn insert_string(param_name: &str, insert: &str, original: &str) -> String {
    tokenize(original)
        .into_iter()
        .map(|token| {
            if !token.contains(param_name) {
                return token;
            }
            match token.char_indices().last() {
                Some((idx, last)) => format!("{}{insert}{last}", &token[..idx]),
                None => token,
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn es_only(body: &str) -> String {
    format!("{ES_ONLY_OPEN}{body}{ES_ONLY_CLOSE}")
}

/// Make sure event-range channel wiring is present in the job parameters.
pub fn add_event_service_params(items: &mut Vec<JobParam>) {
    let mut has_pre_include = false;
    let mut has_pre_exec = false;
    for item in items.iter_mut() {
        if item.value.contains("preInclude") {
            item.value = insert_string(
                "preInclude",
                &es_only(&format!(",{ES_PRE_INCLUDE}")),
                &item.value,
            );
            has_pre_include = true;
        }
        if item.value.contains("preExec") {
            item.value = insert_string("preExec", &es_only(&format!(";{ES_PRE_EXEC}")), &item.value);
            has_pre_exec = true;
        }
    }
    if !has_pre_include {
        items.push(JobParam::constant(es_only(&format!(
            "preInclude=\"{ES_PRE_INCLUDE}\""
        ))));
    }
    if !has_pre_exec {
        items.push(JobParam::constant(es_only(&format!("preExec=\"{ES_PRE_EXEC}\""))));
    }
}

/// Append the `.1` attempt suffix unless the template already ends in a
/// numeric suffix or is a pass-through file.
pub fn versioned_output_template(template: &str) -> String {
    if NUMERIC_SUFFIX.is_match(template) || template.ends_with(PASS_THROUGH_SUFFIX) {
        template.to_string()
    } else {
        format!("{template}.1")
    }
}

/// Job-parameter template string from the item list.
pub fn render_template(items: &[JobParam]) -> String {
    items
        .iter()
        .map(|item| item.value.as_str())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
