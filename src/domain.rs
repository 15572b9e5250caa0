use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AccessionError;

/// Semantic label under which a file is referenced inside a task's
/// input/output descriptor tree, e.g. `bam` or `qc_json`. One file may carry
/// several role keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleKey(String);

impl RoleKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RoleKey {
    type Err = AccessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.');
        if !is_valid {
            return Err(AccessionError::InvalidRoleKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for RoleKey {
    type Error = AccessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoleKey> for String {
    fn from(value: RoleKey) -> Self {
        value.0
    }
}

/// Catalog-side output classification of a record, e.g. `alignments` or
/// `optimal idr thresholded peaks`. Two records may legitimately share a
/// content hash and differ only in output type, so this participates in
/// derivation matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputType(String);

impl OutputType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OutputType {
    type Err = AccessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_graphic() || ch == ' ') {
            return Err(AccessionError::InvalidOutputType(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for OutputType {
    type Error = AccessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputType> for String {
    fn from(value: OutputType) -> Self {
        value.0
    }
}

/// Genome assemblies the catalog understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assembly {
    Grch38,
    Mm10,
}

impl Assembly {
    pub const ALL: [Assembly; 2] = [Assembly::Grch38, Assembly::Mm10];

    pub fn as_str(&self) -> &'static str {
        match self {
            Assembly::Grch38 => "GRCh38",
            Assembly::Mm10 => "mm10",
        }
    }

    /// Scans free text (a reference-genome descriptor) for a known assembly
    /// name. Returns the first hit in declaration order.
    pub fn detect_in(text: &str) -> Option<Assembly> {
        Assembly::ALL
            .into_iter()
            .find(|assembly| text.contains(assembly.as_str()))
    }
}

impl fmt::Display for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_role_key_valid() {
        let key: RoleKey = "nodup_bam".parse().unwrap();
        assert_eq!(key.as_str(), "nodup_bam");
    }

    #[test]
    fn parse_role_key_rejects_whitespace() {
        let err = "no dup".parse::<RoleKey>().unwrap_err();
        assert_matches!(err, AccessionError::InvalidRoleKey(_));
    }

    #[test]
    fn parse_role_key_rejects_empty() {
        let err = "  ".parse::<RoleKey>().unwrap_err();
        assert_matches!(err, AccessionError::InvalidRoleKey(_));
    }

    #[test]
    fn parse_output_type_allows_spaces() {
        let ot: OutputType = "optimal idr thresholded peaks".parse().unwrap();
        assert_eq!(ot.as_str(), "optimal idr thresholded peaks");
    }

    #[test]
    fn parse_output_type_rejects_empty() {
        let err = "".parse::<OutputType>().unwrap_err();
        assert_matches!(err, AccessionError::InvalidOutputType(_));
    }

    #[test]
    fn detect_assembly() {
        assert_eq!(
            Assembly::detect_in("gs://refs/GRCh38_no_alt.fa.gz"),
            Some(Assembly::Grch38)
        );
        assert_eq!(
            Assembly::detect_in("gs://refs/mm10/genome.fa"),
            Some(Assembly::Mm10)
        );
        assert_eq!(Assembly::detect_in("gs://refs/dm6/genome.fa"), None);
    }
}
