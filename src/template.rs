//! `{{var}}` substitution for shell commands and generation prompts

use once_cell::sync::Lazy;
use std::borrow::Cow;
use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

use crate::expr::render;
use crate::Context;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}").unwrap()
});

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Missing context variable: {0}")]
    MissingContextVariable(String),
}

/// Replace every `{{name}}` / `{{name.path}}` with its rendered context value.
///
/// Path segments index into objects by key and into arrays by position.
/// Any unresolved reference fails the whole substitution.
pub fn substitute(template: &str, context: &Context) -> Result<String, TemplateError> {
    substitute_with(template, context, render)
}

/// Like [`substitute`], but each value is quoted as one POSIX shell word.
///
/// The gate then sees exactly what `sh -c` will run: a value such as
/// `x; rm -rf /` stays an argument and can never start a new command.
pub fn substitute_shell(template: &str, context: &Context) -> Result<String, TemplateError> {
    substitute_with(template, context, |value| {
        shell_escape::unix::escape(Cow::Owned(render(value))).into_owned()
    })
}

fn substitute_with<F>(template: &str, context: &Context, render_value: F) -> Result<String, TemplateError>
where
    F: Fn(&Value) -> String,
{
    let mut missing = None;

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let path = &caps[1];
        match resolve(path, context) {
            Some(value) => render_value(value),
            None => {
                missing.get_or_insert_with(|| path.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(path) => Err(TemplateError::MissingContextVariable(path)),
        None => Ok(rendered.into_owned()),
    }
}

/// Names referenced by a template, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn resolve<'a>(path: &str, context: &'a Context) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_substitutes_scalars_and_paths() {
        let context = ctx(json!({
            "branch": "main",
            "count": 3,
            "commit": { "sha": "abc123", "files": ["a.rs", "b.rs"] }
        }));

        assert_eq!(
            substitute("git push origin {{branch}} # {{ count }}", &context).unwrap(),
            "git push origin main # 3"
        );
        assert_eq!(
            substitute("show {{commit.sha}} {{commit.files.1}}", &context).unwrap(),
            "show abc123 b.rs"
        );
        assert_eq!(
            substitute("{{commit.files}}", &context).unwrap(),
            r#"["a.rs","b.rs"]"#
        );
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let context = ctx(json!({ "message": "hi" }));
        assert_eq!(
            substitute("echo {{message}} {{summary}}", &context),
            Err(TemplateError::MissingContextVariable("summary".to_string()))
        );
        assert!(substitute("{{message.deep}}", &context).is_err());
    }

    #[test]
    fn test_text_without_placeholders_is_unchanged() {
        let context = Context::new();
        assert_eq!(substitute("echo {not a var} }}", &context).unwrap(), "echo {not a var} }}");
    }

    #[test]
    fn test_shell_values_stay_one_word() {
        let context = ctx(json!({
            "branch": "feature/login-v2",
            "msg": "hi; touch /tmp/x",
            "quote": "it's done",
            "empty": ""
        }));

        assert_eq!(
            substitute_shell("git push origin {{branch}}", &context).unwrap(),
            "git push origin feature/login-v2"
        );
        assert_eq!(
            substitute_shell("echo {{msg}}", &context).unwrap(),
            "echo 'hi; touch /tmp/x'"
        );
        assert_eq!(
            substitute_shell("git commit -am {{quote}}", &context).unwrap(),
            r"git commit -am 'it'\''s done'"
        );
        assert_eq!(substitute_shell("test -n {{empty}}", &context).unwrap(), "test -n ''");
        assert!(substitute_shell("echo {{missing}}", &context).is_err());
    }

    #[test]
    fn test_placeholders_listed() {
        assert_eq!(
            placeholders("{{a}} and {{ b.c }} then {{a}}"),
            vec!["a".to_string(), "b.c".to_string(), "a".to_string()]
        );
    }
}
