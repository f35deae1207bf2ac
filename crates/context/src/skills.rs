//! Skill summaries for the system prompt.

use serde::{Deserialize, Serialize};

/// A named capability advertised to the model in the system message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
}

/// At most this many skills appear in the prompt.
const MAX_SKILLS: usize = 50;
/// Each description is truncated to this many characters.
const MAX_DESCRIPTION_CHARS: usize = 200;

/// Render the summarized skills index, empty when there are no skills.
pub fn render_index(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut out = String::from("Skills:\n");
    for skill in skills.iter().take(MAX_SKILLS) {
        out.push_str("- ");
        out.push_str(&skill.name);
        out.push_str(": ");
        out.push_str(&truncate(&skill.description, MAX_DESCRIPTION_CHARS));
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}
