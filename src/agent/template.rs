//! Prompt templates
//!
//! Templates use `{{ name }}` placeholders. Values come from an explicit
//! [`TemplateContext`] built once per run plus the per-call variables passed
//! to [`TemplateContext::render`]. A placeholder with no value is an error.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("undefined template variable '{0}'")]
    Undefined(String),
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
}

/// Read-only variables shared by every template in a run
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Render `template`; `extra` shadows the shared variables
    pub fn render(&self, template: &str, extra: &[(&str, &str)]) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;
            let name = after[..end].trim();

            let value = extra
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| *v)
                .or_else(|| self.get(name))
                .ok_or_else(|| TemplateError::Undefined(name.to_string()))?;
            out.push_str(value);

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
