//! Template validation utilities.

use minijinja::{Environment, UndefinedBehavior};

use crate::error::ConfigError;

/// Parses a template and renders it once against an empty context.
///
/// Parsing catches syntax errors; the render catches runtime errors such as
/// unknown filters. Undefined variables are allowed.
///
/// # Errors
/// Returns the minijinja error message.
pub fn validate_template_render(source: &str) -> Result<(), String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.add_template("_check", source)
        .map_err(|e| e.to_string())?;
    env.get_template("_check")
        .and_then(|tmpl| tmpl.render(serde_json::json!({})))
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Checks each named part of a template, e.g. `("title", "...")`.
pub(crate) fn validate_template_parts(name: &str, parts: &[(&str, &str)]) -> Vec<ConfigError> {
    parts
        .iter()
        .filter_map(|(part, source)| {
            validate_template_render(source)
                .err()
                .map(|message| ConfigError::InvalidTemplate {
                    name: name.to_string(),
                    message: format!("{}: {}", part, message),
                })
        })
        .collect()
}
