//! System roles
//!
//! Roles are the static set of actor categories. Each role is granted a set of
//! database instances in configuration; the directory resolves them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Actor category. Serialized by its short code (`"D"`, `"PP"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "D")]
    Director,
    #[serde(rename = "A")]
    Auxiliary,
    #[serde(rename = "PA")]
    AdministrativeStaff,
    #[serde(rename = "PP")]
    PrimaryTeacher,
    #[serde(rename = "PS")]
    SecondaryTeacher,
    #[serde(rename = "T")]
    Tutor,
    #[serde(rename = "R")]
    Guardian,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Director,
        Role::Auxiliary,
        Role::AdministrativeStaff,
        Role::PrimaryTeacher,
        Role::SecondaryTeacher,
        Role::Tutor,
        Role::Guardian,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Role::Director => "D",
            Role::Auxiliary => "A",
            Role::AdministrativeStaff => "PA",
            Role::PrimaryTeacher => "PP",
            Role::SecondaryTeacher => "PS",
            Role::Tutor => "T",
            Role::Guardian => "R",
        }
    }

    /// snake_case name used as a key in config files
    pub fn name(&self) -> &'static str {
        match self {
            Role::Director => "director",
            Role::Auxiliary => "auxiliary",
            Role::AdministrativeStaff => "administrative_staff",
            Role::PrimaryTeacher => "primary_teacher",
            Role::SecondaryTeacher => "secondary_teacher",
            Role::Tutor => "tutor",
            Role::Guardian => "guardian",
        }
    }

    /// Human-readable label for CLI output
    pub fn label(&self) -> &'static str {
        match self {
            Role::Director => "Director",
            Role::Auxiliary => "Auxiliary",
            Role::AdministrativeStaff => "Administrative staff",
            Role::PrimaryTeacher => "Primary teacher",
            Role::SecondaryTeacher => "Secondary teacher",
            Role::Tutor => "Tutor",
            Role::Guardian => "Guardian",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Role {
    type Err = MeshError;

    /// Accepts the short code (case-insensitive) or the snake_case name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Role::ALL
            .iter()
            .copied()
            .find(|role| {
                role.code().eq_ignore_ascii_case(trimmed)
                    || role.name().eq_ignore_ascii_case(&trimmed.replace('-', "_"))
            })
            .ok_or_else(|| MeshError::UnknownRole {
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_code_and_name() {
        assert_eq!("PP".parse::<Role>().unwrap(), Role::PrimaryTeacher);
        assert_eq!("pp".parse::<Role>().unwrap(), Role::PrimaryTeacher);
        assert_eq!("guardian".parse::<Role>().unwrap(), Role::Guardian);
        assert_eq!(
            "administrative-staff".parse::<Role>().unwrap(),
            Role::AdministrativeStaff
        );
        assert!(matches!(
            "janitor".parse::<Role>(),
            Err(MeshError::UnknownRole { .. })
        ));
    }

    #[test]
    fn test_serde_uses_codes() {
        let json = serde_json::to_string(&Role::SecondaryTeacher).unwrap();
        assert_eq!(json, "\"PS\"");
        let role: Role = serde_json::from_str("\"R\"").unwrap();
        assert_eq!(role, Role::Guardian);
    }

    #[test]
    fn test_codes_unique() {
        let mut codes: Vec<_> = Role::ALL.iter().map(|r| r.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), Role::ALL.len());
    }
}
