use std::{fmt, str::FromStr};

use uuid::Uuid;

/// How conversation ids are allocated. Fixed for the lifetime of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdScheme {
    /// Fresh UUID v7 per created conversation.
    #[default]
    Opaque,
    /// `<low>-<high>` from the two member ids; two-party conversations only.
    Pairwise,
}

impl IdScheme {
    pub fn opaque_id() -> String {
        Uuid::now_v7().to_string()
    }

    pub fn pair_id(a: i64, b: i64) -> String {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        format!("{low}-{high}")
    }
}

impl FromStr for IdScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opaque" | "uuid" => Ok(Self::Opaque),
            "pairwise" | "pair" => Ok(Self::Pairwise),
            other => Err(format!("unknown conversation id scheme {other:?}")),
        }
    }
}

impl fmt::Display for IdScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Opaque => f.write_str("opaque"),
            Self::Pairwise => f.write_str("pairwise"),
        }
    }
}
