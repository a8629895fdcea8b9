//! The jets-partition hash: a stable 64-bit FNV-1a over the hashed column's
//! text form, reduced modulo the number of partitions. Rows with the same
//! hashed value land on the same partition on every node and every step.

use std::collections::HashMap;
use std::hash::Hasher;

use fnv::FnvHasher;

use crate::config::model::HashExpression;
use crate::core::value::{Row, Value};
use crate::error::{PipeError, PipeResult};

/// Joins the parts of a composite hash value; cannot occur in column text.
const COMPOSITE_SEPARATOR: u8 = 0x1f;

#[derive(Debug, Clone)]
pub struct CompiledHash {
    parts: Vec<usize>,
    nbr_partitions: u64,
}

pub fn compile_hash(
    spec: &HashExpression,
    columns: &HashMap<String, usize>,
) -> PipeResult<CompiledHash> {
    let nbr_partitions = match spec.nbr_jets_partitions {
        Some(n) if n > 0 => n,
        _ => {
            return Err(PipeError::config(
                "hash expression has no nbr_jets_partitions (was the config materialised by the controller?)",
            ));
        }
    };
    let mut parts = Vec::new();
    if let Some(pos) = columns.get(&spec.expr) {
        parts.push(*pos);
    } else if let Some(composite) = &spec.alternate_composite_expr {
        for name in composite {
            let pos = columns.get(name).ok_or_else(|| {
                PipeError::config(format!(
                    "hash expression: unknown column '{name}' in alternate_composite_expr"
                ))
            })?;
            parts.push(*pos);
        }
    } else {
        return Err(PipeError::config(format!(
            "hash expression: unknown column '{}' and no alternate_composite_expr",
            spec.expr
        )));
    }
    Ok(CompiledHash {
        parts,
        nbr_partitions,
    })
}

impl CompiledHash {
    pub fn nbr_partitions(&self) -> u64 {
        self.nbr_partitions
    }

    /// The partition id for a row, always in `[0, nbr_partitions)`.
    pub fn eval(&self, row: &Row) -> u64 {
        let mut hasher = FnvHasher::default();
        for (i, pos) in self.parts.iter().enumerate() {
            if i > 0 {
                hasher.write(&[COMPOSITE_SEPARATOR]);
            }
            let v = row.get(*pos).unwrap_or(&Value::Null);
            hasher.write(v.render().as_bytes());
        }
        hasher.finish() % self.nbr_partitions
    }
}

/// Hash a single already-rendered value; used when re-deriving the partition
/// of a stage object from its key.
pub fn hash_row_value(value: &str, nbr_partitions: u64) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(value.as_bytes());
    hasher.finish() % nbr_partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn compiled(n: u64) -> CompiledHash {
        let spec = HashExpression {
            expr: "k".to_string(),
            nbr_jets_partitions: Some(n),
            alternate_composite_expr: None,
        };
        let columns: HashMap<String, usize> = [("k".to_string(), 0)].into();
        compile_hash(&spec, &columns).unwrap()
    }

    #[test]
    fn missing_partition_count_is_a_config_error() {
        let spec = HashExpression {
            expr: "k".to_string(),
            ..Default::default()
        };
        let columns: HashMap<String, usize> = [("k".to_string(), 0)].into();
        assert!(compile_hash(&spec, &columns).is_err());
    }

    #[test]
    fn composite_parts_are_separated() {
        let spec = HashExpression {
            expr: "nope".to_string(),
            nbr_jets_partitions: Some(1 << 32),
            alternate_composite_expr: Some(vec!["a".to_string(), "b".to_string()]),
        };
        let columns: HashMap<String, usize> = [("a".to_string(), 0), ("b".to_string(), 1)].into();
        let h = compile_hash(&spec, &columns).unwrap();
        // "ab" + "" must not collide with "a" + "b"
        let r1 = h.eval(&vec![Value::Text("ab".into()), Value::Text("".into())]);
        let r2 = h.eval(&vec![Value::Text("a".into()), Value::Text("b".into())]);
        assert_ne!(r1, r2);
    }

    proptest! {
        #[test]
        fn partition_in_range_and_stable(s in ".{0,24}", n in 1u64..64) {
            let h = compiled(n);
            let row = vec![Value::Text(s.clone())];
            let p1 = h.eval(&row);
            let p2 = compiled(n).eval(&row);
            prop_assert!(p1 < n);
            prop_assert_eq!(p1, p2);
        }
    }
}
