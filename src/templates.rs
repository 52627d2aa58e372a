//! Handlebars templates for outgoing mail.
//!
//! `{{placeholder}}` values are HTML-escaped; triple braces insert raw HTML.

use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;

pub const BACKUP_REPORT: &str = "backup_report";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template does not compile: {0}")]
    Compile(Box<handlebars::TemplateError>),

    #[error("template failed to render: {0}")]
    Render(Box<handlebars::RenderError>),
}

impl From<handlebars::TemplateError> for TemplateError {
    fn from(err: handlebars::TemplateError) -> Self {
        TemplateError::Compile(Box::new(err))
    }
}

impl From<handlebars::RenderError> for TemplateError {
    fn from(err: handlebars::RenderError) -> Self {
        TemplateError::Render(Box::new(err))
    }
}

const TEMPLATE: &str = "template";

/// A subject/body pair compiled once and rendered per recipient
pub struct MailTemplate {
    subject: Handlebars<'static>,
    body: Handlebars<'static>,
}

impl MailTemplate {
    /// Compile both parts, failing before anything is sent
    pub fn compile(subject: &str, body: &str) -> Result<Self, TemplateError> {
        // Subjects are plain text
        let mut subject_registry = Handlebars::new();
        subject_registry.register_escape_fn(handlebars::no_escape);
        subject_registry.register_template_string(TEMPLATE, subject)?;

        let mut body_registry = Handlebars::new();
        body_registry.register_template_string(TEMPLATE, body)?;

        Ok(Self {
            subject: subject_registry,
            body: body_registry,
        })
    }

    /// Render `(subject, html)` for one recipient context
    pub fn render<T: Serialize>(&self, context: &T) -> Result<(String, String), TemplateError> {
        let subject = self.subject.render(TEMPLATE, context)?;
        let html = self.body.render(TEMPLATE, context)?;
        Ok((subject.trim().to_string(), html))
    }
}

/// Built-in templates shipped with the server
pub struct Templates {
    registry: Handlebars<'static>,
}

impl Templates {
    pub fn new() -> Result<Self, TemplateError> {
        let mut registry = Handlebars::new();
        registry.register_template_string(BACKUP_REPORT, include_str!("./static/backup_report.hbs"))?;
        Ok(Self { registry })
    }

    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String, TemplateError> {
        Ok(self.registry.render(name, context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholders_are_filled_and_escaped() {
        let template =
            MailTemplate::compile("Welcome {{name}} & co", "<p>Hi {{name}}, team {{team}}</p>")
                .unwrap();
        let (subject, html) = template
            .render(&json!({ "name": "Ada <3", "team": "Rust" }))
            .unwrap();

        assert_eq!(subject, "Welcome Ada <3 & co");
        assert_eq!(html, "<p>Hi Ada &lt;3, team Rust</p>");
    }

    #[test]
    fn missing_placeholders_render_empty() {
        let template = MailTemplate::compile("Hello", "<p>{{wifi_password}}</p>").unwrap();
        let (_, html) = template.render(&json!({ "name": "Ada" })).unwrap();
        assert_eq!(html, "<p></p>");
    }

    #[test]
    fn broken_templates_fail_to_compile() {
        assert!(matches!(
            MailTemplate::compile("Hello {{name", "<p></p>"),
            Err(TemplateError::Compile(_))
        ));
    }

    #[test]
    fn built_in_templates_load() {
        assert!(Templates::new().is_ok());
    }
}
