use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Country prefix accepted in front of a 10 digit mobile number
const PHONE_COUNTRY_PREFIX: &str = "+91";

/// Digits in a mobile number without the country prefix
const PHONE_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    #[default]
    Farmer,
    Expert,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Hi,
    Mr,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::En => write!(f, "English"),
            Language::Hi => write!(f, "Hindi"),
            Language::Mr => write!(f, "Marathi"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// A farmer's application-level record, keyed by the auth identity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "userid")]
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub district: String,
    #[serde(rename = "userType", default)]
    pub user_type: UserType,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub crops: Option<Vec<String>>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl UserProfile {
    /// Build the record inserted for a freshly registered farmer
    pub fn new_farmer(user_id: &str, email: &str, fields: &ProfileFields) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: fields.name.trim().to_string(),
            email: email.to_string(),
            phone: fields.phone.trim().to_string(),
            district: fields.district.trim().to_string(),
            user_type: UserType::Farmer,
            language: Language::En,
            crops: None,
            location: None,
        }
    }
}

/// Profile details collected by the sign-up form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub name: String,
    pub phone: String,
    pub district: String,
}

impl ProfileFields {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.name.trim().is_empty() {
            return Err(SessionError::Validation("name is required".to_string()));
        }
        if self.district.trim().is_empty() {
            return Err(SessionError::Validation("district is required".to_string()));
        }
        if !is_valid_phone(&self.phone) {
            return Err(SessionError::Validation(format!(
                "phone must be a {} digit mobile number",
                PHONE_DIGITS
            )));
        }
        Ok(())
    }
}

fn is_valid_phone(phone: &str) -> bool {
    let phone = phone.trim();
    let digits = phone.strip_prefix(PHONE_COUNTRY_PREFIX).unwrap_or(phone);
    digits.len() == PHONE_DIGITS && digits.chars().all(|c| c.is_ascii_digit())
}

/// Loose shape check for a login email: `local@domain.tld`, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

#[cfg(test)]
pub(crate) fn test_profile(user_id: &str) -> UserProfile {
    UserProfile::new_farmer(
        user_id,
        &format!("{}@example.com", user_id),
        &test_fields(),
    )
}

#[cfg(test)]
pub(crate) fn test_fields() -> ProfileFields {
    ProfileFields {
        name: "A".to_string(),
        phone: "9000000000".to_string(),
        district: "Pune".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("farmer@example.com"));
        assert!(is_valid_email("a.b+c@mail.example.in"));

        assert!(!is_valid_email(""));
        assert!(!is_valid_email("farmer"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("farmer@example"));
        assert!(!is_valid_email("farmer@.com"));
        assert!(!is_valid_email("farmer@example."));
        assert!(!is_valid_email("far mer@example.com"));
        assert!(!is_valid_email("a@b@example.com"));
    }

    #[test]
    fn test_profile_fields_validate() {
        assert!(test_fields().validate().is_ok());

        let mut fields = test_fields();
        fields.phone = "+919000000000".to_string();
        assert!(fields.validate().is_ok());

        fields.phone = "90000".to_string();
        assert!(matches!(fields.validate(), Err(SessionError::Validation(_))));

        let mut fields = test_fields();
        fields.name = "  ".to_string();
        assert!(matches!(fields.validate(), Err(SessionError::Validation(_))));

        let mut fields = test_fields();
        fields.district.clear();
        assert!(matches!(fields.validate(), Err(SessionError::Validation(_))));
    }

    #[test]
    fn test_new_farmer_defaults() {
        let profile = UserProfile::new_farmer("u1", "farmer@example.com", &test_fields());
        assert_eq!(profile.user_id, "u1");
        assert_eq!(profile.user_type, UserType::Farmer);
        assert_eq!(profile.language, Language::En);
        assert!(profile.crops.is_none());
        assert!(profile.location.is_none());
    }

    #[test]
    fn test_parse_profile_row() {
        let json = r#"{"userid":"8d0c5f9e-1a2b-4c3d-9e8f-001122334455","name":"Sunil Patil","email":"sunil@example.com","phone":"9822012345","district":"Satara","userType":"farmer","language":"mr","crops":["sugarcane","soybean"],"location":{"latitude":17.68,"longitude":74.0}}"#;

        let profile: UserProfile =
            serde_json::from_str(json).expect("Failed to parse profile test JSON");
        assert_eq!(profile.user_id, "8d0c5f9e-1a2b-4c3d-9e8f-001122334455");
        assert_eq!(profile.language, Language::Mr);
        assert_eq!(profile.crops.as_deref().map(|c| c.len()), Some(2));
        assert_eq!(profile.location.map(|l| l.latitude), Some(17.68));
    }

    #[test]
    fn test_parse_profile_row_with_nulls() {
        let json = r#"{"userid":"u1","name":"A","email":"a@example.com","phone":"9000000000","district":"Pune","userType":"farmer","language":"en","crops":null,"location":null}"#;
        let profile: UserProfile =
            serde_json::from_str(json).expect("Failed to parse profile test JSON");
        assert!(profile.crops.is_none());
        assert!(profile.location.is_none());
    }
}
