//! Checking extracted fields before we publish them.

use jsonschema::Validator as SchemaValidator;

use crate::{
    prelude::*,
    resume::{FieldValue, ParsedResume, parsed_resume_schema},
};

/// Validates normalized LLM output against the [`ParsedResume`] schema, then
/// checks the fields we can't do without.
pub struct Validator {
    schema_validator: SchemaValidator,
}

impl Validator {
    /// Create a validator for [`ParsedResume`].
    pub fn new() -> Result<Self> {
        let schema = parsed_resume_schema();
        let schema_validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("invalid resume schema: {}", err))?;
        Ok(Self { schema_validator })
    }

    /// Validate `value`, returning either the typed résumé or every problem we
    /// found.
    pub fn validate(&self, value: &Value) -> Result<ParsedResume, Vec<String>> {
        let mut problems = self
            .schema_validator
            .iter_errors(value)
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{}: {}", path, err)
                }
            })
            .collect::<Vec<_>>();
        if !problems.is_empty() {
            return Err(problems);
        }

        let resume = serde_json::from_value::<ParsedResume>(value.clone())
            .map_err(|err| vec![format!("cannot read resume: {}", err)])?;

        let personal_info = &resume.personal_info;
        let name = personal_info
            .get("name")
            .or_else(|| personal_info.get("full_name"));
        match name.map(FieldValue::as_text) {
            None => problems.push("personal_info.name is missing".to_owned()),
            Some(None) => problems.push("personal_info.name must be text".to_owned()),
            Some(Some(name)) if name.trim().is_empty() => {
                problems.push("personal_info.name is empty".to_owned())
            }
            Some(Some(_)) => {}
        }
        match personal_info.get("email").map(FieldValue::as_text) {
            None => problems.push("personal_info.email is missing".to_owned()),
            Some(None) => problems.push("personal_info.email must be text".to_owned()),
            Some(Some(email)) if email.trim().is_empty() => {
                problems.push("personal_info.email is empty".to_owned())
            }
            Some(Some(email)) if !email.contains('@') => problems.push(format!(
                "personal_info.email is not an email address: {:?}",
                email
            )),
            Some(Some(_)) => {}
        }

        if problems.is_empty() {
            Ok(resume)
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new().unwrap()
    }

    #[test]
    fn accepts_a_complete_resume() {
        let resume = validator()
            .validate(&json!({
                "personal_info": { "name": "Jane Doe", "email": "jane@example.com" },
                "education": [{ "degree": "BSc", "coursework": ["Compilers"] }],
                "skills": { "technical": ["Rust"] },
            }))
            .unwrap();
        assert_eq!(resume.education.len(), 1);
        assert!(resume.experience.is_empty());
    }

    #[test]
    fn full_name_counts_as_a_name() {
        validator()
            .validate(&json!({
                "personal_info": { "full_name": "Jane Doe", "email": "jane@example.com" },
            }))
            .unwrap();
    }

    #[test]
    fn missing_personal_info_is_a_schema_error() {
        let problems = validator()
            .validate(&json!({ "education": [] }))
            .unwrap_err();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("personal_info"), "{problems:?}");
    }

    #[test]
    fn nested_objects_are_rejected_with_a_path() {
        let problems = validator()
            .validate(&json!({
                "personal_info": { "name": { "first": "Jane" }, "email": "j@x.org" },
            }))
            .unwrap_err();
        assert!(
            problems.iter().any(|p| p.starts_with("/personal_info/name")),
            "{problems:?}"
        );
    }

    #[test]
    fn required_fields_are_checked() {
        let problems = validator()
            .validate(&json!({
                "personal_info": { "name": " ", "email": "jane at example" },
            }))
            .unwrap_err();
        assert_eq!(
            problems,
            vec![
                "personal_info.name is empty".to_owned(),
                "personal_info.email is not an email address: \"jane at example\""
                    .to_owned(),
            ]
        );

        let problems = validator()
            .validate(&json!({ "personal_info": {} }))
            .unwrap_err();
        assert_eq!(problems.len(), 2);
    }
}
