//! Compatibility checking seam.
//!
//! The store records which [`Compatibility`] rules apply to a group but never
//! compares schemas itself. Callers plug in a [`SchemaValidator`] for their
//! serialization format and check a candidate before adding it.

use crate::error::Result;
use crate::group::Group;
use crate::types::{Compatibility, SchemaInfo, SchemaWithVersion, ValidationRules};

/// Format-specific schema comparison.
pub trait SchemaValidator: Send + Sync {
    /// Whether data written with `writer` can be decoded with `reader`.
    fn can_read(&self, reader: &SchemaInfo, writer: &SchemaInfo) -> bool;
}

/// The prior schemas `compatibility` compares a candidate against.
///
/// `prior` must be in ordinal order.
pub fn prior_schemas<'a>(
    compatibility: &Compatibility,
    prior: &'a [SchemaWithVersion],
) -> &'a [SchemaWithVersion] {
    match compatibility {
        Compatibility::AllowAny | Compatibility::DenyAll => &[],
        Compatibility::Backward | Compatibility::Forward | Compatibility::Full => {
            &prior[prior.len().saturating_sub(1)..]
        }
        Compatibility::BackwardTransitive
        | Compatibility::ForwardTransitive
        | Compatibility::FullTransitive => prior,
        Compatibility::BackwardTill(till) | Compatibility::ForwardTill(till) => {
            let start = prior
                .iter()
                .position(|s| s.version.ordinal >= till.ordinal)
                .unwrap_or(prior.len());
            &prior[start..]
        }
    }
}

/// Whether `candidate` satisfies every rule against `prior`.
pub fn is_compatible(
    validator: &dyn SchemaValidator,
    rules: &ValidationRules,
    candidate: &SchemaInfo,
    prior: &[SchemaWithVersion],
) -> bool {
    rules.rules.iter().all(|rule| {
        let against = prior_schemas(rule, prior);
        match rule {
            Compatibility::AllowAny => true,
            Compatibility::DenyAll => prior.is_empty(),
            Compatibility::Backward
            | Compatibility::BackwardTransitive
            | Compatibility::BackwardTill(_) => against
                .iter()
                .all(|p| validator.can_read(candidate, &p.schema)),
            Compatibility::Forward
            | Compatibility::ForwardTransitive
            | Compatibility::ForwardTill(_) => against
                .iter()
                .all(|p| validator.can_read(&p.schema, candidate)),
            Compatibility::Full | Compatibility::FullTransitive => against.iter().all(|p| {
                validator.can_read(candidate, &p.schema) && validator.can_read(&p.schema, candidate)
            }),
        }
    })
}

impl Group {
    /// Check `candidate` against the group's current rules.
    ///
    /// In a subgrouped group only schemas of the same name are prior schemas.
    pub fn is_compatible(&self, validator: &dyn SchemaValidator, candidate: &SchemaInfo) -> Result<bool> {
        let rules = self.current_validation_rules()?;
        let prior = if self.subgrouped() {
            self.list_schemas_in(&candidate.name)?
        } else {
            self.list_schemas()?
        };
        Ok(is_compatible(validator, &rules, candidate, &prior))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SerializationFormat, VersionInfo};

    /// Schemas are comma separated field lists; a reader handles a writer if
    /// it only needs fields the writer has.
    struct FieldSubset;

    impl SchemaValidator for FieldSubset {
        fn can_read(&self, reader: &SchemaInfo, writer: &SchemaInfo) -> bool {
            let fields = |s: &SchemaInfo| -> Vec<String> {
                String::from_utf8_lossy(&s.schema_data)
                    .split(',')
                    .map(str::to_string)
                    .collect()
            };
            let available = fields(writer);
            fields(reader).iter().all(|f| available.contains(f))
        }
    }

    fn schema(fields: &str) -> SchemaInfo {
        SchemaInfo::new("T", SerializationFormat::Avro, fields.as_bytes().to_vec())
    }

    fn history(list: &[&str]) -> Vec<SchemaWithVersion> {
        list.iter()
            .enumerate()
            .map(|(i, f)| SchemaWithVersion {
                schema: schema(f),
                version: VersionInfo::new("T", i as u32, i as u32),
            })
            .collect()
    }

    #[test]
    fn test_prior_selection() {
        let prior = history(&["a", "a,b", "a,b,c"]);
        assert_eq!(prior_schemas(&Compatibility::Backward, &prior).len(), 1);
        assert_eq!(prior_schemas(&Compatibility::FullTransitive, &prior).len(), 3);
        assert_eq!(
            prior_schemas(&Compatibility::BackwardTill(VersionInfo::new("T", 1, 1)), &prior).len(),
            2
        );
        assert!(prior_schemas(&Compatibility::AllowAny, &prior).is_empty());
        assert!(prior_schemas(&Compatibility::Forward, &[]).is_empty());
    }

    #[test]
    fn test_rules_combine() {
        let prior = history(&["a,b", "a,b,c"]);
        let dropping_c = schema("a,b");

        // Backward: the candidate reads the latest prior.
        assert!(is_compatible(&FieldSubset, &ValidationRules::of(Compatibility::Backward), &dropping_c, &prior));
        // Forward: the latest prior cannot read data lacking c.
        assert!(!is_compatible(&FieldSubset, &ValidationRules::of(Compatibility::Forward), &dropping_c, &prior));
        assert!(!is_compatible(&FieldSubset, &ValidationRules::of(Compatibility::DenyAll), &dropping_c, &prior));
        assert!(is_compatible(&FieldSubset, &ValidationRules::of(Compatibility::DenyAll), &dropping_c, &[]));
        assert!(!is_compatible(
            &FieldSubset,
            &ValidationRules::new(vec![Compatibility::AllowAny, Compatibility::Forward]),
            &dropping_c,
            &prior
        ));
    }
}
