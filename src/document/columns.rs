//! Column tables: streaming rows in and patching cells.
//!
//! A column table is a map from column name to a sequence (a list or a numeric
//! buffer). Every operation works on a copy and hands it back only when all
//! columns still have the same length, so a failed operation leaves the
//! original table untouched.

use super::{ColumnPatches, DocumentError, PatchIndex};
use crate::buffer::BufferError;
use crate::wire::{Value, ValueMap};

/// Append `data` to `table`, then evict the oldest rows beyond `rollover`.
pub(crate) fn stream(
    table: &ValueMap,
    data: &ValueMap,
    rollover: Option<usize>,
) -> Result<ValueMap, DocumentError> {
    check_lengths(data)?;
    if !table.is_empty() {
        let missing: Vec<String> = table
            .keys()
            .filter(|key| !data.contains_key(key))
            .map(column_name)
            .collect();
        let extra: Vec<String> = data
            .keys()
            .filter(|key| !table.contains_key(key))
            .map(column_name)
            .collect();
        if !missing.is_empty() || !extra.is_empty() {
            return Err(DocumentError::ColumnSetMismatch { missing, extra });
        }
    }

    let mut result = table.clone();
    for (key, new) in data.iter() {
        let merged = match result.get(key) {
            Some(existing) => append(&column_name(key), existing, new)?,
            None => new.clone(),
        };
        result.insert(key.clone(), merged);
    }

    let len = check_lengths(&result)?;
    if let Some(limit) = rollover {
        if len > limit {
            let excess = len - limit;
            for (_, column) in result.iter_mut() {
                drop_front(column, excess);
            }
        }
    }
    Ok(result)
}

/// Apply index and slice patches. An index equal to the current length
/// extends the column by one; anything further out is rejected.
pub(crate) fn patch(table: &ValueMap, patches: &ColumnPatches) -> Result<ValueMap, DocumentError> {
    let mut result = table.clone();
    for (column, ops) in patches {
        let target = result
            .get_mut(&Value::string(column.as_str()))
            .ok_or_else(|| DocumentError::UnknownColumn(column.clone()))?;
        for (index, value) in ops {
            apply_patch(column, target, index, value)?;
        }
    }
    check_lengths(&result)?;
    Ok(result)
}

pub(crate) fn column_len(column: &str, value: &Value) -> Result<usize, DocumentError> {
    match value {
        Value::List(items) => Ok(items.len()),
        Value::NdArray(array) => Ok(array.rows()),
        other => Err(DocumentError::ColumnType {
            column: column.to_string(),
            found: other.type_name(),
        }),
    }
}

/// The shared column length; errors if any two columns differ.
pub(crate) fn check_lengths(table: &ValueMap) -> Result<usize, DocumentError> {
    let mut expected = None;
    for (key, value) in table.iter() {
        let column = column_name(key);
        let len = column_len(&column, value)?;
        match expected {
            None => expected = Some(len),
            Some(expected) if expected != len => {
                return Err(DocumentError::ColumnLengthMismatch {
                    column,
                    expected,
                    actual: len,
                })
            }
            Some(_) => {}
        }
    }
    Ok(expected.unwrap_or(0))
}

fn column_name(key: &Value) -> String {
    match key.as_str() {
        Some(name) => name.to_string(),
        None => format!("{:?}", key),
    }
}

fn append(column: &str, existing: &Value, new: &Value) -> Result<Value, DocumentError> {
    if column_len(column, existing)? == 0 {
        return Ok(new.clone());
    }
    if let (Value::NdArray(current), Value::NdArray(rows)) = (existing, new) {
        let mut merged = current.clone();
        if merged.append_rows(rows).is_ok() {
            return Ok(Value::NdArray(merged));
        }
    }
    let mut items = to_list(column, existing)?;
    items.extend(to_list(column, new)?);
    Ok(Value::List(items))
}

fn to_list(column: &str, value: &Value) -> Result<Vec<Value>, DocumentError> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::NdArray(array) if array.ndim() <= 1 => {
            Ok(array.scalars().into_iter().map(Value::from).collect())
        }
        Value::NdArray(array) => Ok(array.split_rows().into_iter().map(Value::NdArray).collect()),
        other => Err(DocumentError::ColumnType {
            column: column.to_string(),
            found: other.type_name(),
        }),
    }
}

fn drop_front(column: &mut Value, count: usize) {
    match column {
        Value::List(items) => {
            let count = count.min(items.len());
            items.drain(..count);
        }
        Value::NdArray(array) => array.drop_rows(count),
        _ => {}
    }
}

fn apply_patch(
    column: &str,
    target: &mut Value,
    index: &PatchIndex,
    value: &Value,
) -> Result<(), DocumentError> {
    let len = column_len(column, target)?;
    match *index {
        PatchIndex::Index(i) => {
            if i > len {
                return Err(DocumentError::PatchOutOfBounds {
                    column: column.to_string(),
                    index: i,
                    len,
                });
            }
            set_item(column, target, i, value.clone())
        }
        PatchIndex::Slice { start, stop, step } => {
            let stop = stop.unwrap_or(len);
            if step == 0 {
                return Err(invalid(column, "slice step must be positive"));
            }
            if start > stop {
                return Err(invalid(column, "slice start is past its stop"));
            }
            if stop > len {
                return Err(DocumentError::PatchOutOfBounds {
                    column: column.to_string(),
                    index: stop,
                    len,
                });
            }
            let indices: Vec<usize> = (start..stop).step_by(step).collect();
            let values = match value {
                Value::List(items) => items.clone(),
                Value::NdArray(array) if array.ndim() <= 1 => {
                    array.scalars().into_iter().map(Value::from).collect()
                }
                _ => return Err(invalid(column, "slice patches take a list of values")),
            };
            if values.len() != indices.len() {
                return Err(invalid(
                    column,
                    &format!("slice covers {} rows but {} values were given", indices.len(), values.len()),
                ));
            }
            for (i, value) in indices.into_iter().zip(values) {
                set_item(column, target, i, value)?;
            }
            Ok(())
        }
    }
}

/// Store `value` at `index`, appending when `index` is the current length.
/// A numeric buffer that cannot hold the value becomes a plain list.
fn set_item(column: &str, target: &mut Value, index: usize, value: Value) -> Result<(), DocumentError> {
    if let Value::NdArray(array) = target {
        if let (true, Some(scalar)) = (array.ndim() <= 1, value.as_scalar()) {
            let written = if index < array.len() {
                array.set(index, scalar)
            } else {
                array.push(scalar)
            };
            match written {
                Ok(()) => return Ok(()),
                Err(BufferError::OutOfRange { .. }) => {}
                Err(e) => return Err(invalid(column, &e.to_string())),
            }
        }
    }
    if matches!(target, Value::NdArray(_)) {
        let items = to_list(column, target)?;
        *target = Value::List(items);
    }
    match target {
        Value::List(items) => {
            if index < items.len() {
                items[index] = value;
            } else {
                items.push(value);
            }
            Ok(())
        }
        other => Err(DocumentError::ColumnType {
            column: column.to_string(),
            found: other.type_name(),
        }),
    }
}

fn invalid(column: &str, reason: &str) -> DocumentError {
    DocumentError::InvalidPatch {
        column: column.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::NdArray;

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    fn table(columns: &[(&str, Value)]) -> ValueMap {
        columns
            .iter()
            .map(|(name, value)| (Value::string(*name), value.clone()))
            .collect()
    }

    #[test]
    fn test_patch_replaces_cell() {
        let source = table(&[("foo", ints(&[1, 2]))]);
        let patches = vec![("foo".to_string(), vec![(PatchIndex::Index(0), Value::Int(2))])];
        let patched = patch(&source, &patches).unwrap();
        assert_eq!(patched.get_str("foo"), Some(&ints(&[2, 2])));
    }

    #[test]
    fn test_patch_may_extend_contiguously() {
        let source = table(&[("foo", ints(&[1]))]);
        let extend = vec![("foo".to_string(), vec![(PatchIndex::Index(1), Value::Int(9))])];
        assert_eq!(patch(&source, &extend).unwrap().get_str("foo"), Some(&ints(&[1, 9])));

        let sparse = vec![("foo".to_string(), vec![(PatchIndex::Index(3), Value::Int(9))])];
        assert!(matches!(
            patch(&source, &sparse),
            Err(DocumentError::PatchOutOfBounds { index: 3, len: 1, .. })
        ));
    }

    #[test]
    fn test_patch_keeps_columns_equal_length() {
        let source = table(&[("x", ints(&[1, 2])), ("y", ints(&[3, 4]))]);
        let lopsided = vec![("x".to_string(), vec![(PatchIndex::Index(2), Value::Int(5))])];
        assert!(matches!(
            patch(&source, &lopsided),
            Err(DocumentError::ColumnLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_slice_patch() {
        let source = table(&[("foo", ints(&[0, 0, 0, 0]))]);
        let patches = vec![(
            "foo".to_string(),
            vec![(
                PatchIndex::Slice {
                    start: 0,
                    stop: None,
                    step: 2,
                },
                ints(&[7, 8]),
            )],
        )];
        assert_eq!(patch(&source, &patches).unwrap().get_str("foo"), Some(&ints(&[7, 0, 8, 0])));

        let too_far = vec![(
            "foo".to_string(),
            vec![(
                PatchIndex::Slice {
                    start: 0,
                    stop: Some(5),
                    step: 1,
                },
                ints(&[1, 2, 3, 4, 5]),
            )],
        )];
        assert!(patch(&source, &too_far).is_err());
    }

    #[test]
    fn test_patch_buffer_in_place() {
        let source = table(&[("v", Value::NdArray(NdArray::from_slice(&[1.0f64, 2.0])))]);
        let patches = vec![("v".to_string(), vec![(PatchIndex::Index(1), Value::Float(5.0))])];
        let patched = patch(&source, &patches).unwrap();
        match patched.get_str("v") {
            Some(Value::NdArray(array)) => assert_eq!(array.to_vec::<f64>().unwrap(), vec![1.0, 5.0]),
            other => panic!("expected a buffer, got {:?}", other),
        }
    }

    #[test]
    fn test_patch_value_too_wide_for_buffer_becomes_list() {
        let source = table(&[("v", Value::NdArray(NdArray::from_slice(&[1u8, 2])))]);
        let patches = vec![("v".to_string(), vec![(PatchIndex::Index(0), Value::Int(300))])];
        assert_eq!(patch(&source, &patches).unwrap().get_str("v"), Some(&ints(&[300, 2])));

        let negative = vec![("v".to_string(), vec![(PatchIndex::Index(2), Value::Int(-1))])];
        assert_eq!(patch(&source, &negative).unwrap().get_str("v"), Some(&ints(&[1, 2, -1])));

        // the source table is untouched either way
        match source.get_str("v") {
            Some(Value::NdArray(array)) => assert_eq!(array.to_vec::<u8>().unwrap(), vec![1, 2]),
            other => panic!("expected a buffer, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_rollover_bounds_every_column() {
        let mut current = table(&[("x", ints(&[])), ("y", ints(&[]))]);
        for round in 0..10 {
            let rows = table(&[("x", ints(&[round, round])), ("y", ints(&[-round, -round]))]);
            current = stream(&current, &rows, Some(5)).unwrap();
            let len = check_lengths(&current).unwrap();
            assert!(len <= 5);
        }
        assert_eq!(current.get_str("x"), Some(&ints(&[7, 8, 8, 9, 9])));
    }

    #[test]
    fn test_stream_rejects_mismatched_columns() {
        let source = table(&[("x", ints(&[1])), ("y", ints(&[2]))]);
        let partial = table(&[("x", ints(&[3]))]);
        assert!(matches!(
            stream(&source, &partial, None),
            Err(DocumentError::ColumnSetMismatch { .. })
        ));

        let ragged = table(&[("x", ints(&[3])), ("y", ints(&[4, 5]))]);
        assert!(matches!(
            stream(&source, &ragged, None),
            Err(DocumentError::ColumnLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_stream_buffers() {
        let source = table(&[("v", Value::NdArray(NdArray::from_slice(&[1i32, 2])))]);
        let same = table(&[("v", Value::NdArray(NdArray::from_slice(&[3i32])))]);
        match stream(&source, &same, None).unwrap().get_str("v") {
            Some(Value::NdArray(array)) => assert_eq!(array.to_vec::<i32>().unwrap(), vec![1, 2, 3]),
            other => panic!("expected a buffer, got {:?}", other),
        }

        let mixed = table(&[("v", Value::NdArray(NdArray::from_slice(&[0.5f64])))]);
        let merged = stream(&source, &mixed, Some(2)).unwrap();
        assert_eq!(
            merged.get_str("v"),
            Some(&Value::List(vec![Value::Int(2), Value::Float(0.5)]))
        );
    }
}
