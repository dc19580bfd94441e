//! The structured résumé we extract.

use std::collections::BTreeMap;

use schemars::{JsonSchema, schema_for};

use crate::prelude::*;

/// A single field value. Most fields are plain text, but bullet lists
/// (achievements, coursework, technologies) stay lists.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Get the value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::List(_) => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(text: &str) -> Self {
        FieldValue::Text(text.to_owned())
    }
}

/// A flat mapping of field names to values. Keys are `snake_case`.
pub type Section = BTreeMap<String, FieldValue>;

/// Structured data extracted from one résumé.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ParsedResume {
    /// Name, email, phone, location, profile links.
    pub personal_info: Section,

    /// One entry per degree or program.
    #[serde(default)]
    pub education: Vec<Section>,

    /// One entry per position held.
    #[serde(default)]
    pub experience: Vec<Section>,

    /// Skill groups (technical, soft, languages, tools).
    #[serde(default)]
    pub skills: Section,

    /// One entry per project.
    #[serde(default)]
    pub projects: Vec<Section>,

    /// Any other sections the model reported, keyed by section name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other_sections: BTreeMap<String, Section>,
}

/// The names of the top-level sections, in output order.
pub const SECTION_NAMES: &[&str] =
    &["personal_info", "education", "experience", "skills", "projects"];

/// Sections which hold a list of entries rather than a single mapping.
pub const LIST_SECTIONS: &[&str] = &["education", "experience", "projects"];

/// The JSON Schema for [`ParsedResume`].
pub fn parsed_resume_schema() -> Value {
    serde_json::to_value(schema_for!(ParsedResume))
        .expect("schemars output should always serialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_values_accept_text_and_lists() {
        let section: Section = serde_json::from_value(json!({
            "name": "Jane Doe",
            "achievements": ["Shipped v2", "Cut costs 30%"],
        }))
        .unwrap();
        assert_eq!(section["name"], FieldValue::from("Jane Doe"));
        assert_eq!(
            section["achievements"],
            FieldValue::List(vec!["Shipped v2".to_owned(), "Cut costs 30%".to_owned()])
        );
    }

    #[test]
    fn only_personal_info_is_required() {
        let schema = parsed_resume_schema();
        assert_eq!(schema["title"], "ParsedResume");
        assert_eq!(schema["required"], json!(["personal_info"]));

        let resume: ParsedResume =
            serde_json::from_value(json!({ "personal_info": {} })).unwrap();
        assert!(resume.education.is_empty());
        assert!(resume.skills.is_empty());
    }

    #[test]
    fn empty_other_sections_are_not_serialized() {
        let json = serde_json::to_value(ParsedResume::default()).unwrap();
        let keys = json.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
        let mut expected = SECTION_NAMES.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(keys, expected);
    }
}
