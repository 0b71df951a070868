use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Reasons a target group cannot be accepted into the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("targets are empty")]
    EmptyTargets,
    #[error("labels are empty")]
    EmptyLabels,
    #[error("target endpoint is an empty string")]
    EmptyEndpoint,
}

/// A set of scrape endpoints sharing one label set.
///
/// Targets are kept as a sorted set and labels as a sorted map, so two groups
/// built from the same endpoints and labels in any order compare equal. That
/// equality is the registry's duplicate-detection rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTargetGroup")]
pub struct TargetGroup {
    targets: BTreeSet<String>,
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawTargetGroup {
    targets: Vec<String>,
    labels: BTreeMap<String, String>,
}

impl TryFrom<RawTargetGroup> for TargetGroup {
    type Error = ValidationError;

    fn try_from(raw: RawTargetGroup) -> Result<Self, Self::Error> {
        Self::new(raw.targets, raw.labels)
    }
}

impl TargetGroup {
    pub fn new<T, L, S>(targets: T, labels: L) -> Result<Self, ValidationError>
    where
        T: IntoIterator<Item = S>,
        L: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let targets = dedup_targets(targets)?;
        let labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<BTreeMap<_, _>>();
        if labels.is_empty() {
            return Err(ValidationError::EmptyLabels);
        }
        Ok(Self { targets, labels })
    }

    pub fn targets(&self) -> &BTreeSet<String> {
        &self.targets
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Overwrites the endpoints, leaving labels untouched.
    pub fn replace_targets(&mut self, targets: BTreeSet<String>) -> Result<(), ValidationError> {
        validate_targets(&targets)?;
        self.targets = targets;
        Ok(())
    }

    /// Two groups are equivalent iff their target sets and label maps are
    /// equal, irrespective of the order the entries were supplied in.
    pub fn is_equivalent(&self, other: &TargetGroup) -> bool {
        self == other
    }

    /// Digest of the canonical form. Equivalent groups have equal
    /// signatures; the converse holds only up to hash collisions.
    pub fn signature(&self) -> Signature {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.targets.len() as u64).to_le_bytes());
        self.targets
            .iter()
            .for_each(|target| update_str(&mut hasher, target));
        hasher.update(&(self.labels.len() as u64).to_le_bytes());
        self.labels.iter().for_each(|(name, value)| {
            update_str(&mut hasher, name);
            update_str(&mut hasher, value);
        });
        Signature(hasher.finalize().into())
    }
}

// Length prefix keeps ("ab", "c") and ("a", "bc") apart.
fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Collapses duplicate endpoints. Fails if the result is empty or any
/// endpoint is an empty string.
pub fn dedup_targets<T, S>(targets: T) -> Result<BTreeSet<String>, ValidationError>
where
    T: IntoIterator<Item = S>,
    S: Into<String>,
{
    let targets = targets.into_iter().map(Into::into).collect::<BTreeSet<_>>();
    validate_targets(&targets)?;
    Ok(targets)
}

fn validate_targets(targets: &BTreeSet<String>) -> Result<(), ValidationError> {
    if targets.is_empty() {
        return Err(ValidationError::EmptyTargets);
    }
    if targets.iter().any(String::is_empty) {
        return Err(ValidationError::EmptyEndpoint);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 32]);

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        hex::encode(sig.0)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
