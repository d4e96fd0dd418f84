//! Payload shaping shared by both store backends and the worker.
//!
//! - Step input: `{"run": <run input>, "<dependency>": <dependency output>, ...}`; a map
//!   task sees only its own element of the single dependency's array.
//! - Step output: the single task's output, or for a map step the array of task
//!   outputs ordered by `task_index`.
//! - Run output: `{"<leaf>": <leaf step output>, ...}`.

use serde_json::{Map, Value};
use thiserror::Error;

use super::definition::RUN_INPUT_KEY;

/// Why a map step's upstream output cannot be split across its tasks
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapSourceError {
    #[error("map source '{source_step}' produced {found}, expected an array of {expected} elements")]
    NotAnArray {
        source_step: String,
        expected: usize,
        found: &'static str,
    },

    #[error("map source '{source_step}' produced {actual} elements, expected {expected}")]
    LengthMismatch {
        source_step: String,
        expected: usize,
        actual: usize,
    },

    #[error("map step expects exactly one dependency output, got {0}")]
    SourceCount(usize),
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Check that `output` can feed exactly `expected` map tasks
pub fn validate_map_source(
    source_step: &str,
    output: &Value,
    expected: usize,
) -> Result<(), MapSourceError> {
    match output {
        Value::Array(items) if items.len() == expected => Ok(()),
        Value::Array(items) => Err(MapSourceError::LengthMismatch {
            source_step: source_step.to_string(),
            expected,
            actual: items.len(),
        }),
        other => Err(MapSourceError::NotAnArray {
            source_step: source_step.to_string(),
            expected,
            found: json_type_name(other),
        }),
    }
}

/// Merged input for one task.
///
/// `dependency_outputs` holds each dependency's aggregated step output. With
/// `initial_tasks > 1` the single dependency's array is sliced at `task_index`.
pub fn build_task_input(
    run_input: &Value,
    dependency_outputs: &[(String, Value)],
    task_index: usize,
    initial_tasks: usize,
) -> Result<Value, MapSourceError> {
    let mut merged = Map::with_capacity(dependency_outputs.len() + 1);
    merged.insert(RUN_INPUT_KEY.to_string(), run_input.clone());

    if initial_tasks > 1 {
        let [(source_step, output)] = dependency_outputs else {
            return Err(MapSourceError::SourceCount(dependency_outputs.len()));
        };
        validate_map_source(source_step, output, initial_tasks)?;
        let element = output.get(task_index).cloned().unwrap_or(Value::Null);
        merged.insert(source_step.clone(), element);
    } else {
        for (name, output) in dependency_outputs {
            merged.insert(name.clone(), output.clone());
        }
    }

    Ok(Value::Object(merged))
}

/// A step's output as seen by dependents and the run output.
///
/// `task_outputs` may arrive in any order; map outputs are ordered by task index.
pub fn aggregate_step_output(initial_tasks: usize, mut task_outputs: Vec<(i32, Value)>) -> Value {
    if initial_tasks <= 1 {
        return task_outputs
            .pop()
            .map(|(_, output)| output)
            .unwrap_or(Value::Null);
    }
    task_outputs.sort_by_key(|(index, _)| *index);
    Value::Array(task_outputs.into_iter().map(|(_, output)| output).collect())
}

/// `{leaf_name: output}` over every leaf step
pub fn merge_leaf_outputs<I>(leaf_outputs: I) -> Value
where
    I: IntoIterator<Item = (String, Value)>,
{
    Value::Object(leaf_outputs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_input_merges_dependencies() {
        let input = build_task_input(
            &json!({"x": 1}),
            &[("b".to_string(), json!(2)), ("c".to_string(), json!({"k": 3}))],
            0,
            1,
        )
        .unwrap();
        assert_eq!(input, json!({"run": {"x": 1}, "b": 2, "c": {"k": 3}}));
    }

    #[test]
    fn test_map_input_selects_element() {
        let deps = [("p".to_string(), json!(["x", "y", "z"]))];
        let input = build_task_input(&json!(null), &deps, 1, 3).unwrap();
        assert_eq!(input, json!({"run": null, "p": "y"}));
    }

    #[test]
    fn test_map_input_rejects_scalar_and_wrong_length() {
        let scalar = [("p".to_string(), json!(42))];
        assert!(matches!(
            build_task_input(&json!({}), &scalar, 0, 3),
            Err(MapSourceError::NotAnArray { found: "a number", .. })
        ));

        let short = [("p".to_string(), json!([1, 2]))];
        assert!(matches!(
            build_task_input(&json!({}), &short, 0, 3),
            Err(MapSourceError::LengthMismatch { actual: 2, expected: 3, .. })
        ));

        assert_eq!(
            build_task_input(&json!({}), &[], 0, 2),
            Err(MapSourceError::SourceCount(0))
        );
    }

    #[test]
    fn test_aggregation_orders_map_outputs() {
        let outputs = vec![(2, json!("c")), (0, json!("a")), (1, json!("b"))];
        assert_eq!(aggregate_step_output(3, outputs), json!(["a", "b", "c"]));
        assert_eq!(aggregate_step_output(1, vec![(0, json!({"v": 1}))]), json!({"v": 1}));
        assert_eq!(aggregate_step_output(1, vec![]), Value::Null);
    }

    #[test]
    fn test_leaf_merge() {
        let output = merge_leaf_outputs(vec![
            ("x".to_string(), json!(1)),
            ("y".to_string(), json!([2])),
        ]);
        assert_eq!(output, json!({"x": 1, "y": [2]}));
    }
}
