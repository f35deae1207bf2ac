//! Prompt templates.
//!
//! Templates are plain strings with `{{placeholder}}` slots. Section content
//! is pre-rendered before substitution, so an absent section becomes an
//! empty string and the surrounding blank lines collapse away — empty
//! conditionals elide without template logic.

use std::collections::HashMap;

use tiller_domain::{Error, Result};

pub const DEFAULT_SYSTEM_TEMPLATE: &str = "\
{{role}}

{{instructions}}

{{output_instructions}}

{{tools}}

{{skills}}

{{documents}}

{{memories}}

{{system_tags}}
";

pub const DEFAULT_USER_TEMPLATE: &str = "\
{{message}}

{{user_tags}}

{{file_refs}}
";

/// Substitute `{{name}}` slots from `vars`. An unknown placeholder is a
/// rendering error; blank runs left by empty sections are collapsed.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(Error::Template("unterminated placeholder".into()));
        };
        let name = after[..end].trim();
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                return Err(Error::Template(format!("unknown placeholder: {name}")));
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(collapse_blank_runs(&out))
}

fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn substitutes_placeholders() {
        let out = render("Hello {{name}}!", &vars(&[("name", "world")])).unwrap();
        assert_eq!(out, "Hello world!");
    }

    #[test]
    fn unknown_placeholder_is_a_template_error() {
        let err = render("{{nope}}", &vars(&[])).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn unterminated_placeholder_is_a_template_error() {
        let err = render("{{open", &vars(&[])).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn empty_sections_elide() {
        let template = "{{a}}\n\n{{b}}\n\n{{c}}";
        let out = render(
            template,
            &vars(&[("a", "first"), ("b", ""), ("c", "last")]),
        )
        .unwrap();
        assert_eq!(out, "first\n\nlast");
    }

    #[test]
    fn default_templates_render_with_full_vars() {
        let out = render(
            DEFAULT_SYSTEM_TEMPLATE,
            &vars(&[
                ("role", "You are a test agent."),
                ("instructions", "Do things."),
                ("output_instructions", ""),
                ("tools", ""),
                ("skills", ""),
                ("documents", ""),
                ("memories", ""),
                ("system_tags", ""),
            ]),
        )
        .unwrap();
        assert_eq!(out, "You are a test agent.\n\nDo things.");
    }
}
