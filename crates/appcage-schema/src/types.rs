//! Identifier newtypes for names that end up in machine names, file names
//! and `systemd-run --uid`. They stay plain strings in TOML.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

string_newtype!(
    /// Environment (and machine) name. Doubles as the control program file name.
    EnvName
);

string_newtype!(
    /// Account inside the environment that attached commands run as.
    UserName
);

impl EnvName {
    /// Strip characters that systemd-nspawn machine names and file names reject.
    ///
    /// Returns the cleaned name; callers compare it with the input to decide
    /// whether the original was acceptable.
    pub fn sanitized(raw: &str) -> String {
        let kept: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            .collect();
        let mut out = String::with_capacity(kept.len());
        for c in kept.trim_matches('.').chars() {
            if c == '.' && out.ends_with('.') {
                continue;
            }
            out.push(c);
        }
        out
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= 64 && Self::sanitized(&self.0) == self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_name_derefs_to_str() {
        let name = EnvName::new("chrome");
        assert_eq!(name.to_string(), "chrome");
        assert_eq!(name.as_str(), "chrome");
        assert!(name.starts_with("chr"));
    }

    #[test]
    fn env_name_serializes_as_plain_string() {
        let name = EnvName::new("steam");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"steam\"");
        let back: EnvName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn sanitized_drops_unsafe_characters() {
        assert_eq!(EnvName::sanitized("my app!"), "myapp");
        assert_eq!(EnvName::sanitized("..hidden.."), "hidden");
        assert_eq!(EnvName::sanitized("a...b"), "a.b");
        assert_eq!(EnvName::sanitized("firefox-esr_2"), "firefox-esr_2");
    }

    #[test]
    fn validity_follows_sanitizing() {
        assert!(EnvName::new("zoom").is_valid());
        assert!(EnvName::new("web.browser").is_valid());
        assert!(!EnvName::new("").is_valid());
        assert!(!EnvName::new("bad/name").is_valid());
        assert!(!EnvName::new(".dot").is_valid());
    }

    #[test]
    fn user_name_equality() {
        let a = UserName::new("alice");
        assert_eq!(a, "alice");
        assert_ne!(a, UserName::new("bob"));
    }
}
