//! Field validation for posted guest forms.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$")
        .expect("Invalid regex")
});

pub const BLANK: &str = "This field cannot be blank";
pub const INVALID_EMAIL: &str = "Invalid email address";

/// Field name → messages, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    /// First message for a field, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|m| m.first()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Posted values plus the errors found so far.
#[derive(Debug, Clone, Default)]
pub struct Form {
    values: HashMap<String, String>,
    errors: FieldErrors,
}

impl Form {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self {
            values,
            errors: FieldErrors::default(),
        }
    }

    /// Value of a field, empty if absent.
    pub fn get(&self, field: &str) -> &str {
        self.values.get(field).map(String::as_str).unwrap_or("")
    }

    /// Present and non-empty.
    pub fn has(&self, field: &str) -> bool {
        !self.get(field).is_empty()
    }

    pub fn required(&mut self, fields: &[&str]) {
        for field in fields {
            if self.get(field).trim().is_empty() {
                self.errors.add(field, BLANK);
            }
        }
    }

    pub fn min_length(&mut self, field: &str, length: usize) -> bool {
        if self.get(field).chars().count() < length {
            self.errors.add(
                field,
                format!("This field must be at least {length} characters long"),
            );
            return false;
        }
        true
    }

    pub fn is_email(&mut self, field: &str) {
        if !EMAIL_PATTERN.is_match(self.get(field)) {
            self.errors.add(field, INVALID_EMAIL);
        }
    }

    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn into_errors(self) -> FieldErrors {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> Form {
        Form::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn required_flags_blank_and_missing() {
        let mut f = form(&[("a", "x"), ("b", "   ")]);
        f.required(&["a", "b", "c"]);
        assert!(!f.valid());
        assert_eq!(f.errors().get("a"), None);
        assert_eq!(f.errors().get("b"), Some(BLANK));
        assert_eq!(f.errors().get("c"), Some(BLANK));
    }

    #[test]
    fn min_length_message() {
        let mut f = form(&[("first_name", "Jo")]);
        assert!(!f.min_length("first_name", 3));
        assert_eq!(
            f.errors().get("first_name"),
            Some("This field must be at least 3 characters long")
        );
    }

    #[test]
    fn min_length_counts_characters() {
        let mut f = form(&[("first_name", "Zoë")]);
        assert!(f.min_length("first_name", 3));
        assert!(f.valid());
    }

    #[test]
    fn email_format() {
        for ok in ["me@here.com", "first.last+tag@mail.example.org"] {
            let mut f = form(&[("email", ok)]);
            f.is_email("email");
            assert!(f.valid(), "{ok}");
        }
        for bad in ["not-an-email", "a@b", "@here.com", "me@", ""] {
            let mut f = form(&[("email", bad)]);
            f.is_email("email");
            assert_eq!(f.errors().get("email"), Some(INVALID_EMAIL), "{bad}");
        }
    }

    #[test]
    fn display_lists_every_message() {
        let mut errors = FieldErrors::default();
        errors.add("email", INVALID_EMAIL);
        errors.add("first_name", BLANK);
        assert_eq!(
            errors.to_string(),
            "email: Invalid email address; first_name: This field cannot be blank"
        );
    }

    #[test]
    fn has_requires_non_empty() {
        let f = form(&[("phone", "")]);
        assert!(!f.has("phone"));
        assert!(!f.has("missing"));
    }
}
