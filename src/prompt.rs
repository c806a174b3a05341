use std::collections::HashMap;

use once_cell::sync::Lazy;

const CONTEXT_PLACEHOLDER: &str = "CONTEXT_PLACEHOLDER";

#[derive(Debug)]
pub struct Style {
    pub id: &'static str,
    pub name: &'static str,
    pub prompt: &'static str,
    /// Style reference JSON with a bare `CONTEXT_PLACEHOLDER` value.
    template: &'static str,
}

const CINEMATIC: &str = "turn this into a cinematic anime style animation";

static STYLES: &[Style] = &[
    Style {
        id: "anime-default-001",
        name: "Anime Default",
        prompt: CINEMATIC,
        template: include_str!("../styles/anime-default-001.json.tmpl"),
    },
    Style {
        id: "ghibli-inspired-002",
        name: "Studio Ghibli",
        prompt: "transform this into a Studio Ghibli style character with soft, natural features and watercolor-like qualities",
        template: include_str!("../styles/ghibli-inspired-002.json.tmpl"),
    },
    Style {
        id: "shonen-dynamic-005",
        name: "Shonen Action",
        prompt: "transform this into a dynamic shonen anime style character with heroic features and powerful battle poses",
        template: include_str!("../styles/shonen-dynamic-005.json.tmpl"),
    },
    Style {
        id: "onepiece-007",
        name: "One Piece Style",
        prompt: CINEMATIC,
        template: include_str!("../styles/onepiece-007.json.tmpl"),
    },
    Style {
        id: "dragonball-008",
        name: "Dragon Ball Z",
        prompt: CINEMATIC,
        template: include_str!("../styles/dragonball-008.json.tmpl"),
    },
    Style {
        id: "naruto-009",
        name: "Naruto Style",
        prompt: CINEMATIC,
        template: include_str!("../styles/naruto-009.json.tmpl"),
    },
];

static STYLE_INDEX: Lazy<HashMap<&'static str, &'static Style>> =
    Lazy::new(|| STYLES.iter().map(|s| (s.id, s)).collect());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("Style ID {0} not found")]
    UnknownStyle(String),
}

pub fn styles() -> &'static [Style] {
    STYLES
}

pub fn find_style(style_id: &str) -> Option<&'static Style> {
    STYLE_INDEX.get(style_id).copied()
}

/// Builds the generation prompt for `style_id`, embedding `context` (the
/// image caption) into the style reference as a JSON string.
pub fn generate_prompt(style_id: &str, context: &str) -> Result<String, PromptError> {
    let style =
        find_style(style_id).ok_or_else(|| PromptError::UnknownStyle(style_id.to_string()))?;

    // A string's JSON encoding cannot fail.
    let context_literal = serde_json::Value::String(context.to_string()).to_string();
    let style_json = style
        .template
        .trim_end()
        .replacen(CONTEXT_PLACEHOLDER, &context_literal, 1);

    Ok(format!(
        "{}\n\n<style.json>\n{}\n</style.json>",
        style.prompt, style_json
    ))
}
