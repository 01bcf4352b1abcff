use std::fmt;

use crate::constants::POSTAL_LETTERS;

/// A Canadian postal code prefix of 3 to 6 characters.
///
/// Stored without whitespace and uppercased; rendered with a space after the
/// forward sortation area, e.g. `M5H 2A`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostalCode(String);

impl PostalCode {
    /// Parses `letter digit letter [digit [letter [digit]]]`, ignoring spaces and case.
    pub fn parse(raw: &str) -> Option<Self> {
        let clean: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '+')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if !(3..=6).contains(&clean.len()) {
            return None;
        }
        let valid = clean.chars().enumerate().all(|(i, c)| {
            if i % 2 == 0 {
                c.is_ascii_uppercase()
            } else {
                c.is_ascii_digit()
            }
        });
        valid.then_some(Self(clean))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Forward sortation area: the first three characters.
    pub fn fsa(&self) -> &str {
        &self.0[..3]
    }

    pub fn is_full(&self) -> bool {
        self.0.len() == 6
    }

    /// Codes one level more specific than this one; empty at full specificity.
    pub fn children(&self) -> Vec<PostalCode> {
        match self.0.len() {
            3 | 5 => (0..=9)
                .map(|d| PostalCode(format!("{}{d}", self.0)))
                .collect(),
            4 => POSTAL_LETTERS
                .chars()
                .map(|l| PostalCode(format!("{}{l}", self.0)))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Upper bound on the leaf queries reachable from this code.
    pub fn max_descendants(&self) -> usize {
        let digits = 10usize;
        let letters = POSTAL_LETTERS.len();
        match self.0.len() {
            3 => digits * letters * digits,
            4 => letters * digits,
            5 => digits,
            _ => 1,
        }
    }
}

impl fmt::Display for PostalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() > 3 {
            write!(f, "{} {}", &self.0[..3], &self.0[3..])
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Extracts the FSA from a free-form postal code string such as `m5h 2n2`.
pub fn fsa_of(raw: &str) -> Option<String> {
    let code = PostalCode::parse(raw)?;
    Some(code.fsa().to_string())
}
