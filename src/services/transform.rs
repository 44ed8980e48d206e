//! Reshapes one stage's output into the next stage's input.
//!
//! Every function here is total: unparseable model output degrades to an
//! empty value and is logged as a data-quality event.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::utils::json::{find_json_block, strip_assignment_prefix, strip_code_blocks};

const KNOWN_PREFIXES: [&str; 2] = ["book_data", "visual_description"];

/// Parses model output that should be JSON but often is not quite.
///
/// Tries the raw text, then with code fences removed, then with a legacy
/// `name = ` assignment removed, and finally the first balanced JSON block.
pub fn parse_json_lenient(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(raw.trim()) {
        return Some(value);
    }

    let unfenced = strip_code_blocks(raw);
    if let Ok(value) = serde_json::from_str(&unfenced) {
        debug!("Parsed JSON after stripping code fences");
        return Some(value);
    }

    for prefix in KNOWN_PREFIXES {
        let stripped = strip_assignment_prefix(&unfenced, prefix);
        if stripped.len() == unfenced.len() {
            continue;
        }
        let stripped = strip_code_blocks(stripped);
        if let Ok(value) = serde_json::from_str(&stripped) {
            warn!("Parsed JSON after stripping legacy '{} =' prefix", prefix);
            return Some(value);
        }
    }

    let block = find_json_block(&unfenced)?;
    match serde_json::from_str(block) {
        Ok(value) => {
            warn!("Fell back to extracting an embedded JSON block from model output");
            Some(value)
        }
        Err(_) => None,
    }
}

fn as_json(raw: &Value) -> Option<Value> {
    match raw {
        Value::String(s) => parse_json_lenient(s),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

/// Story text as stored and returned to the caller: the parsed book object
/// when the model produced one, the trimmed text otherwise.
pub fn normalize_story(raw: &Value) -> Option<Value> {
    match as_json(raw) {
        Some(Value::Object(map)) if !map.is_empty() => return Some(Value::Object(map)),
        _ => {}
    }
    match raw {
        Value::String(s) if !s.trim().is_empty() => {
            debug!("Story is not structured JSON, keeping plain text");
            Some(Value::String(s.trim().to_string()))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Child,
    Companion,
}

impl CharacterRole {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Child => "child_",
            Self::Companion => "companion_",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        match key {
            "child_character" | "child" | "main_character" => Some(Self::Child),
            "companion" | "companion_character" => Some(Self::Companion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub role: CharacterRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub visuals: Map<String, Value>,
}

impl Character {
    fn from_fields(role: CharacterRole, fields: &Map<String, Value>) -> Self {
        let mut visuals = fields.clone();
        let mut take = |field: &str| -> Option<String> {
            let prefixed = format!("{}{}", role.prefix(), field);
            let value = visuals.remove(&prefixed).or_else(|| visuals.remove(field))?;
            match value {
                Value::String(s) if s.trim().is_empty() => None,
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            }
        };

        let name = take("name");
        let gender = take("gender");
        let age = take("age");
        let kind = take("type");
        visuals.remove("role");

        Self {
            role,
            name,
            gender,
            age,
            kind,
            visuals,
        }
    }
}

/// Canonical visual description forwarded to prompt synthesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VisualDescription {
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub illustration_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_image_uri: Option<String>,
}

impl VisualDescription {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.illustration_style.is_none()
    }

    pub fn child(&self) -> Option<&Character> {
        self.characters.iter().find(|c| c.role == CharacterRole::Child)
    }

    pub fn with_hero_image(mut self, uri: Option<String>) -> Self {
        self.child_image_uri = uri;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Normalizes a visual-description response into the nested shape.
///
/// Accepts `{"characters": [{"child_character": {..}}, {"companion": {..}}]}`,
/// the legacy flat `{"child_character": {..}, "companion": {..}}`, and a bare
/// list of character entries.
pub fn describe_visual(raw: &Value) -> VisualDescription {
    let parsed = match as_json(raw) {
        Some(value) => value,
        None => {
            warn!("Visual description is not parseable JSON, continuing with an empty one");
            return VisualDescription::default();
        }
    };

    let mut description = VisualDescription::default();
    match &parsed {
        Value::Object(map) => {
            if let Some(entries) = map.get("characters").and_then(Value::as_array) {
                collect_character_entries(entries, &mut description.characters);
            } else {
                for (key, value) in map {
                    if let (Some(role), Some(fields)) = (CharacterRole::from_key(key), value.as_object()) {
                        description.characters.push(Character::from_fields(role, fields));
                    }
                }
                if !description.characters.is_empty() {
                    debug!("Normalized legacy flat visual description");
                }
            }
            description.illustration_style = map.get("illustration_style").and_then(style_text);
        }
        Value::Array(entries) => {
            debug!("Normalized list-shaped visual description");
            collect_character_entries(entries, &mut description.characters);
            description.illustration_style = entries
                .iter()
                .filter_map(|e| e.get("illustration_style"))
                .find_map(style_text);
        }
        _ => {}
    }

    // Child first, then companion; stable within a role.
    description.characters.sort_by_key(|c| c.role != CharacterRole::Child);

    if description.is_empty() {
        warn!("Visual description had no recognizable characters or style");
    }
    description
}

fn collect_character_entries(entries: &[Value], out: &mut Vec<Character>) {
    for entry in entries {
        let Some(map) = entry.as_object() else {
            continue;
        };
        let mut matched = false;
        for (key, value) in map {
            if let (Some(role), Some(fields)) = (CharacterRole::from_key(key), value.as_object()) {
                out.push(Character::from_fields(role, fields));
                matched = true;
            }
        }
        if matched {
            continue;
        }
        let role = map
            .get("role")
            .and_then(Value::as_str)
            .and_then(|r| match r {
                "child" => Some(CharacterRole::Child),
                "companion" => Some(CharacterRole::Companion),
                _ => None,
            });
        match role {
            Some(role) => out.push(Character::from_fields(role, map)),
            None if map.contains_key("illustration_style") => {}
            None => debug!("Ignoring unrecognized character entry"),
        }
    }
}

fn style_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(map) => map.get("style").and_then(style_text),
        Value::Array(items) => items.iter().find_map(style_text),
        _ => None,
    }
}

/// Collapses the hero-prompt response into a single prompt string.
pub fn hero_prompt_from_response(raw: &Value) -> Option<String> {
    let text = match as_json(raw) {
        Some(Value::Object(map)) => join_texts(map.values()),
        Some(Value::Array(items)) => join_texts(items.iter()),
        Some(Value::String(s)) => s,
        _ => match raw {
            Value::String(s) => s.clone(),
            _ => String::new(),
        },
    };
    let text = text.trim();
    if text.is_empty() {
        warn!("Hero prompt response was empty");
        None
    } else {
        Some(text.to_string())
    }
}

fn join_texts<'a>(values: impl Iterator<Item = &'a Value>) -> String {
    values
        .filter_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Index of a slot key: `prompt_img_NN` or `page_NN` with exactly two digits.
pub fn slot_index(key: &str) -> Option<u32> {
    let digits = key
        .strip_prefix("prompt_img_")
        .or_else(|| key.strip_prefix("page_"))?;
    if digits.len() == 2 && digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

pub fn page_label(position: usize) -> String {
    format!("page_{:02}", position + 1)
}

/// Prompts keyed by slot index; iteration is always in ascending index order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagePromptSet {
    prompts: BTreeMap<u32, String>,
}

impl ImagePromptSet {
    pub fn from_response(raw: &Value) -> Self {
        let mut set = Self::default();
        match as_json(raw) {
            Some(value) => set.collect(&value),
            None => {
                if let Value::String(text) = raw {
                    warn!("Prompt response is not JSON, scanning text for prompt keys");
                    for (key, prompt) in scan_prompt_pairs(text) {
                        set.insert(&key, prompt);
                    }
                }
            }
        }
        if set.is_empty() {
            warn!("No image prompts found in prompt-synthesis response");
        }
        set
    }

    fn collect(&mut self, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    match v {
                        Value::String(prompt) => {
                            if !self.insert(key, prompt.clone()) {
                                debug!("Ignoring non-prompt key '{}'", key);
                            }
                        }
                        Value::Object(_) | Value::Array(_) => self.collect(v),
                        _ => debug!("Ignoring non-prompt key '{}'", key),
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|item| self.collect(item)),
            _ => {}
        }
    }

    /// Adds a prompt under a slot key. Returns false when the key does not
    /// name a slot; a repeated index keeps the first prompt.
    pub fn insert(&mut self, key: &str, prompt: String) -> bool {
        let Some(index) = slot_index(key) else {
            return false;
        };
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            debug!("Skipping empty prompt for '{}'", key);
            return true;
        }
        if self.prompts.contains_key(&index) {
            warn!("Duplicate prompt slot {:02}, keeping the first", index);
        } else {
            self.prompts.insert(index, prompt);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.prompts.iter().map(|(i, p)| (*i, p.as_str()))
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .prompts
            .iter()
            .map(|(i, p)| (format!("prompt_img_{:02}", i), Value::String(p.clone())))
            .collect();
        Value::Object(map)
    }
}

/// Last-resort extraction of `"prompt_img_NN": "..."` pairs from free text.
fn scan_prompt_pairs(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find('"') {
        rest = &rest[start + 1..];
        let Some(end) = rest.find('"') else {
            break;
        };
        let key = &rest[..end];
        rest = &rest[end + 1..];
        if slot_index(key).is_none() {
            continue;
        }

        let Some(after_colon) = rest.trim_start().strip_prefix(':') else {
            continue;
        };
        let value_start = after_colon.trim_start();
        if !value_start.starts_with('"') {
            continue;
        }
        let Some(len) = quoted_len(value_start) else {
            break;
        };
        if let Ok(prompt) = serde_json::from_str::<String>(&value_start[..len]) {
            pairs.push((key.to_string(), prompt));
        }
        rest = &value_start[len..];
    }
    pairs
}

/// Byte length of the JSON string literal at the start of `s`, quotes included.
fn quoted_len(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i + 1),
            _ => {}
        }
    }
    None
}
