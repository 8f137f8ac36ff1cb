//! Per-entity CRDT register.
//!
//! A register maps field names to `{value, provenance}`. Writes are folded in
//! field by field with last-writer-wins on a total order over
//! `(ordinal, source rank, source, canonical value)`, which makes folding
//! commutative, associative and idempotent: any delivery order of the same
//! set of writes yields the same register.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::constants::REGISTER_SCHEMA_VERSION;
use crate::error::{CoreError, Result};
use crate::types::{validate_field_name, FieldSet, Provenance, SourcePriority};

/// Current value of one field together with the write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    /// Field value.
    pub value: Value,
    /// Provenance of the winning write.
    pub provenance: Provenance,
}

/// Fields changed by a single fold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Fields that did not exist before.
    pub added: Vec<String>,
    /// Existing fields whose value or provenance was upgraded.
    pub updated: Vec<String>,
}

impl MergeOutcome {
    /// Whether the register changed at all.
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty()
    }

    /// Whether the register's field set grew.
    pub fn shape_changed(&self) -> bool {
        !self.added.is_empty()
    }
}

/// Serialized merge state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    /// Layout version of this register.
    pub schema_version: u32,
    /// Field states keyed by field name.
    pub fields: BTreeMap<String, FieldEntry>,
}

impl Default for Register {
    fn default() -> Self {
        Self::new()
    }
}

impl Register {
    /// Empty register at the current schema version.
    pub fn new() -> Self {
        Self {
            schema_version: REGISTER_SCHEMA_VERSION,
            fields: BTreeMap::new(),
        }
    }

    /// Fold a write into the register.
    ///
    /// Fields absent from `fields` are left untouched. A field is replaced only
    /// when the incoming write strictly dominates the stored one, so
    /// re-applying a write is a no-op.
    pub fn apply(
        &mut self,
        fields: &FieldSet,
        provenance: &Provenance,
        priority: &SourcePriority,
    ) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();

        for (name, value) in fields {
            validate_field_name(name)?;

            let incoming = FieldEntry {
                value: value.clone(),
                provenance: provenance.clone(),
            };

            match self.fields.get_mut(name) {
                None => {
                    self.fields.insert(name.clone(), incoming);
                    outcome.added.push(name.clone());
                }
                Some(current) => {
                    if compare_entries(&incoming, current, priority)? == Ordering::Greater {
                        *current = incoming;
                        outcome.updated.push(name.clone());
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Project the register into a plain record of field values.
    pub fn project(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }

    /// Value of a field, if present.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(|entry| &entry.value)
    }

    /// Field names in sorted order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Whether the register holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Drop the named fields. Returns how many were present.
    pub fn remove_fields<S: AsRef<str>>(&mut self, names: &[S]) -> usize {
        names
            .iter()
            .filter(|name| self.fields.remove(name.as_ref()).is_some())
            .count()
    }

    /// Serialize to canonical JSON, refusing to exceed `max_bytes`.
    pub fn encode(&self, max_bytes: usize) -> Result<String> {
        let encoded =
            serde_jcs::to_string(self).map_err(|e| CoreError::Canonicalization(e.to_string()))?;

        if encoded.len() > max_bytes {
            return Err(CoreError::RegisterTooLarge {
                size: encoded.len(),
                max: max_bytes,
            });
        }
        Ok(encoded)
    }

    /// Parse a stored register, checking capacity, schema version and field names.
    pub fn decode(raw: &str, max_bytes: usize) -> Result<Self> {
        if raw.len() > max_bytes {
            return Err(CoreError::RegisterTooLarge {
                size: raw.len(),
                max: max_bytes,
            });
        }

        let register: Register =
            serde_json::from_str(raw).map_err(|e| CoreError::MalformedRegister(e.to_string()))?;

        if register.schema_version > REGISTER_SCHEMA_VERSION {
            return Err(CoreError::UnsupportedSchemaVersion(register.schema_version));
        }
        for name in register.fields.keys() {
            validate_field_name(name)
                .map_err(|_| CoreError::MalformedRegister(format!("bad field name '{name}'")))?;
        }

        Ok(register)
    }
}

/// Total order over field entries.
///
/// Higher ordinal wins; on equal ordinals the higher-priority source wins, then
/// the lexicographically greater source name, then the greater canonical value.
/// Two entries compare equal only when all four components are equal.
pub fn compare_entries(
    a: &FieldEntry,
    b: &FieldEntry,
    priority: &SourcePriority,
) -> Result<Ordering> {
    let by_provenance = a
        .provenance
        .ordinal
        .cmp(&b.provenance.ordinal)
        .then_with(|| {
            priority
                .rank(&b.provenance.source)
                .cmp(&priority.rank(&a.provenance.source))
        })
        .then_with(|| a.provenance.source.cmp(&b.provenance.source));

    if by_provenance != Ordering::Equal {
        return Ok(by_provenance);
    }

    Ok(canonical_value(&a.value)?.cmp(&canonical_value(&b.value)?))
}

fn canonical_value(value: &Value) -> Result<String> {
    serde_jcs::to_string(value).map_err(|e| CoreError::Canonicalization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(pairs: &[(&str, Value)]) -> FieldSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn fold(writes: &[(FieldSet, Provenance)], priority: &SourcePriority) -> Register {
        let mut register = Register::new();
        for (fields, provenance) in writes {
            register.apply(fields, provenance, priority).unwrap();
        }
        register
    }

    fn sample_writes() -> Vec<(FieldSet, Provenance)> {
        vec![
            (
                write(&[("name", json!("A")), ("owner", json!("0x1"))]),
                Provenance::new(100, "transfers"),
            ),
            (write(&[("name", json!("B"))]), Provenance::new(105, "api")),
            (
                write(&[("owner", json!("0x2")), ("title", json!("T"))]),
                Provenance::new(100, "api"),
            ),
            (write(&[("title", json!("U"))]), Provenance::new(100, "api")),
        ]
    }

    #[test]
    fn test_later_block_wins_in_either_order() {
        let priority = SourcePriority::default();
        let w100 = (write(&[("name", json!("A"))]), Provenance::new(100, "source-a"));
        let w105 = (write(&[("name", json!("B"))]), Provenance::new(105, "source-b"));

        let forward = fold(&[w100.clone(), w105.clone()], &priority);
        let backward = fold(&[w105, w100], &priority);

        assert_eq!(forward, backward);
        assert_eq!(forward.value("name"), Some(&json!("B")));
    }

    #[test]
    fn test_fold_is_order_independent() {
        let priority = SourcePriority::new(vec!["transfers".into()]);
        let writes = sample_writes();
        let expected = fold(&writes, &priority);

        // Every permutation of the four writes.
        let n = writes.len();
        let mut indices: Vec<usize> = (0..n).collect();
        let mut c = vec![0usize; n];
        let mut i = 0;
        let mut permutations = 1;
        while i < n {
            if c[i] < i {
                if i % 2 == 0 {
                    indices.swap(0, i);
                } else {
                    indices.swap(c[i], i);
                }
                let ordered: Vec<_> = indices.iter().map(|&j| writes[j].clone()).collect();
                assert_eq!(fold(&ordered, &priority), expected);
                permutations += 1;
                c[i] += 1;
                i = 0;
            } else {
                c[i] = 0;
                i += 1;
            }
        }
        assert_eq!(permutations, 24);

        assert_eq!(expected.value("name"), Some(&json!("B")));
        // Equal ordinal, "transfers" outranks "api".
        assert_eq!(expected.value("owner"), Some(&json!("0x1")));
        // Same source and ordinal, greater canonical value wins.
        assert_eq!(expected.value("title"), Some(&json!("U")));
    }

    #[test]
    fn test_reapplying_is_noop() {
        let priority = SourcePriority::default();
        let (fields, provenance) = sample_writes().remove(0);

        let mut register = Register::new();
        let first = register.apply(&fields, &provenance, &priority).unwrap();
        assert!(first.changed());
        assert!(first.shape_changed());

        let once = register.clone();
        for _ in 0..5 {
            let again = register.apply(&fields, &provenance, &priority).unwrap();
            assert!(!again.changed());
        }
        assert_eq!(register, once);
    }

    #[test]
    fn test_stale_write_does_not_overwrite() {
        let priority = SourcePriority::default();
        let mut register = Register::new();
        register
            .apply(&write(&[("name", json!("new"))]), &Provenance::new(10, "a"), &priority)
            .unwrap();
        let outcome = register
            .apply(&write(&[("name", json!("old"))]), &Provenance::new(9, "a"), &priority)
            .unwrap();

        assert!(!outcome.changed());
        assert_eq!(register.value("name"), Some(&json!("new")));
    }

    #[test]
    fn test_absent_fields_untouched() {
        let priority = SourcePriority::default();
        let mut register = Register::new();
        register
            .apply(
                &write(&[("name", json!("A")), ("owner", json!("0x1"))]),
                &Provenance::new(1, "a"),
                &priority,
            )
            .unwrap();
        let outcome = register
            .apply(&write(&[("owner", json!("0x2"))]), &Provenance::new(2, "a"), &priority)
            .unwrap();

        assert_eq!(outcome.updated, vec!["owner".to_string()]);
        assert!(!outcome.shape_changed());
        assert_eq!(register.value("name"), Some(&json!("A")));
        assert_eq!(register.value("owner"), Some(&json!("0x2")));
    }

    #[test]
    fn test_canonical_value_ignores_key_order() {
        let a = FieldEntry {
            value: serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap(),
            provenance: Provenance::new(1, "s"),
        };
        let b = FieldEntry {
            value: serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap(),
            provenance: Provenance::new(1, "s"),
        };
        assert_eq!(
            compare_entries(&a, &b, &SourcePriority::default()).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_invalid_field_rejected() {
        let mut register = Register::new();
        let result = register.apply(
            &write(&[("bad-name", json!(1))]),
            &Provenance::new(1, "s"),
            &SourcePriority::default(),
        );
        assert!(matches!(result, Err(CoreError::InvalidFieldName(_))));
        assert!(register.is_empty());
    }

    #[test]
    fn test_encode_decode_and_capacity() {
        let priority = SourcePriority::default();
        let register = fold(&sample_writes(), &priority);

        let encoded = register.encode(20_000).unwrap();
        assert_eq!(Register::decode(&encoded, 20_000).unwrap(), register);

        let mut big = Register::new();
        big.apply(
            &write(&[("metadata", json!("x".repeat(25_000)))]),
            &Provenance::new(1, "s"),
            &priority,
        )
        .unwrap();
        assert!(matches!(
            big.encode(20_000),
            Err(CoreError::RegisterTooLarge { max: 20_000, .. })
        ));
        let encoded = big.encode(64 * 1024).unwrap();
        assert!(matches!(
            Register::decode(&encoded, 20_000),
            Err(CoreError::RegisterTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage_and_future_versions() {
        assert!(matches!(
            Register::decode("{not json", 1024),
            Err(CoreError::MalformedRegister(_))
        ));
        assert!(matches!(
            Register::decode(r#"{"schema_version":99,"fields":{}}"#, 1024),
            Err(CoreError::UnsupportedSchemaVersion(99))
        ));
    }

    #[test]
    fn test_remove_fields() {
        let mut register = fold(&sample_writes(), &SourcePriority::default());
        assert_eq!(register.remove_fields(&["title", "missing"]), 1);
        assert!(register.value("title").is_none());
        assert_eq!(register.field_names().collect::<Vec<_>>(), vec!["name", "owner"]);
    }
}
