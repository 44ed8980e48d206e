//! Flattens a form submission into the `(order, story, visual)` triple.
//!
//! Submissions arrive as one flat JSON object keyed by the question text that
//! was shown to the user. Question texts are matched after folding curly
//! apostrophes, collapsing whitespace and lowercasing, so cosmetic edits to
//! the form do not silently drop answers.

use log::warn;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::core::error::PipelineError;
use crate::core::job::{
    ChildAppearance, CompanionAppearance, Order, StoryConfiguration, StoryRequest,
    VisualConfiguration,
};

pub const CORRELATION_KEY: &str = "tripettoId";

const Q_CHILD_NAME: &str = "So, who is the brave hero of our story? Could you share the name?";
const Q_CHILD_AGE: &str =
    "How many candles will be on ___’s birthday cake? In other words, how old is ___?";
const Q_CHILD_GENDER: &str = "Marvelous! And is ___ a daring little girl or a courageous little boy?";
const Q_COMPANION_NAME: &str = "What a charming choice! \n\nAnd what is this loyal ___'s name?";
const Q_COMPANION_TYPE: &str =
    "Heroes often have companions. \nWho will share ___s adventures in the story?";
const Q_COMPANION_GENDER: &str =
    "Just to make sure I picture ___ correctly, is this companion a 'he' or 'she'?";
const Q_CHILD_ETHNIC: &str = "Now, let’s get a glimpse of our hero. \nWhat is ___'s ethnicity?";
const Q_CHILD_SKIN_TONE: &str =
    "And to add more detail to her portrait, what is the shade of ___’s skin?";
const Q_CHILD_HAIR_COLOR: &str =
    "What is the color of ___'s hair that catches the sunlight in our story?";
const Q_CHILD_HAIR_LENGTH: &str =
    "And for the artist drawing ___'s courageous moments, how long should the hair be?";

fn normalize_key(key: &str) -> String {
    key.replace(['’', '‘'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

struct Answers<'a> {
    by_question: HashMap<String, &'a Value>,
}

impl<'a> Answers<'a> {
    fn new(form: &'a Map<String, Value>) -> Self {
        let by_question = form.iter().map(|(k, v)| (normalize_key(k), v)).collect();
        Self { by_question }
    }

    fn raw(&self, key: &str) -> Option<&'a Value> {
        self.by_question.get(&normalize_key(key)).copied()
    }

    fn text(&self, key: &str) -> String {
        match self.raw(key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    fn number(&self, key: &str) -> u32 {
        let parsed = match self.raw(key) {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.unwrap_or_else(|| {
            if self.raw(key).is_some() {
                warn!("Non-numeric answer for '{}', using 0", key);
            }
            0
        })
    }
}

/// Splits a submission into its correlation id and the normalized request.
pub fn parse_request(payload: &Value) -> Result<(String, StoryRequest), PipelineError> {
    let form = payload
        .as_object()
        .ok_or_else(|| PipelineError::Validation("request body must be a JSON object".into()))?;

    let correlation_id = match form.get(CORRELATION_KEY) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => {
            return Err(PipelineError::Validation(format!("{} is required", CORRELATION_KEY)));
        }
    };

    let answers = Answers::new(form);
    let field = |key: &str| -> String {
        match form.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    };

    let order = Order {
        user_id: field("userid"),
        date: field("tripettoCreateDate"),
        correlation_id: correlation_id.clone(),
    };

    let story_configuration = StoryConfiguration {
        child_name: answers.text(Q_CHILD_NAME),
        child_age: answers.text(Q_CHILD_AGE),
        child_gender: answers.text(Q_CHILD_GENDER),
        companion_name: answers.text(Q_COMPANION_NAME),
        companion_type: answers.text(Q_COMPANION_TYPE),
        companion_gender: answers.text(Q_COMPANION_GENDER),
    };

    let visual_configuration = VisualConfiguration {
        child: ChildAppearance {
            child_name: answers.text(Q_CHILD_NAME),
            child_gender: answers.text(Q_CHILD_GENDER),
            child_age: answers.number(Q_CHILD_AGE),
            child_ethnic: answers.text(Q_CHILD_ETHNIC),
            child_skin_tone: answers.text(Q_CHILD_SKIN_TONE),
            child_hair_color: answers.text(Q_CHILD_HAIR_COLOR),
            child_hair_length: answers.text(Q_CHILD_HAIR_LENGTH),
        },
        companion: CompanionAppearance {
            companion_name: answers.text(Q_COMPANION_NAME),
            companion_gender: answers.text(Q_COMPANION_GENDER),
            companion_type: answers.text(Q_COMPANION_TYPE),
        },
    };

    Ok((
        correlation_id,
        StoryRequest {
            order,
            story_configuration,
            visual_configuration,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission() -> Value {
        json!({
            "tripettoId": "abc-123",
            "userid": "user-7",
            "tripettoCreateDate": "2024-03-01",
            "So, who is the brave hero of our story? Could you share the name?": "Mia",
            "How many candles will be on ___’s birthday cake? In other words, how old is ___?": "6",
            "Marvelous! And is ___ a daring little girl or a courageous little boy?": "Girl",
            "What a charming choice! \n\nAnd what is this loyal ___'s name?": "Biscuit",
            "Heroes often have companions. \nWho will share ___s adventures in the story?": "Dog",
            "Just to make sure I picture ___ correctly, is this companion a 'he' or 'she'?": "He",
            "Now, let’s get a glimpse of our hero. \nWhat is ___'s ethnicity?": "Asian",
            "And to add more detail to her portrait, what is the shade of ___’s skin?": "Light",
            "What is the color of ___'s hair that catches the sunlight in our story?": "Black",
            "And for the artist drawing ___'s courageous moments, how long should the hair be?": "Long"
        })
    }

    #[test]
    fn test_parse_full_submission() {
        let (id, req) = parse_request(&submission()).unwrap();
        assert_eq!(id, "abc-123");
        assert_eq!(req.order.user_id, "user-7");
        assert_eq!(req.order.correlation_id, "abc-123");
        assert_eq!(req.story_configuration.child_name, "Mia");
        assert_eq!(req.story_configuration.child_age, "6");
        assert_eq!(req.story_configuration.companion_type, "Dog");
        assert_eq!(req.visual_configuration.child.child_age, 6);
        assert_eq!(req.visual_configuration.child.child_hair_length, "Long");
        assert_eq!(req.visual_configuration.companion.companion_name, "Biscuit");
    }

    #[test]
    fn test_question_matching_tolerates_typography() {
        let payload = json!({
            "tripettoId": "x",
            "How many candles will be on ___'s birthday cake?  In other words, how old is ___?": 7,
            "now, let's get a glimpse of our hero. what is ___'s ethnicity?": "Latino"
        });
        let (_, req) = parse_request(&payload).unwrap();
        assert_eq!(req.story_configuration.child_age, "7");
        assert_eq!(req.visual_configuration.child.child_age, 7);
        assert_eq!(req.visual_configuration.child.child_ethnic, "Latino");
    }

    #[test]
    fn test_missing_answers_default_to_empty() {
        let (_, req) = parse_request(&json!({"tripettoId": "only-id"})).unwrap();
        assert_eq!(req.story_configuration, StoryConfiguration::default());
        assert_eq!(req.visual_configuration.child.child_age, 0);
    }

    #[test]
    fn test_missing_or_blank_id_is_rejected() {
        for payload in [json!({}), json!({"tripettoId": "  "}), json!({"tripettoId": 5}), json!([1, 2])] {
            assert!(matches!(
                parse_request(&payload),
                Err(PipelineError::Validation(_))
            ));
        }
    }
}
