//! Compact string encoding for run data.
//!
//! The encoded form is a JSON array of entries and entry 0 is the root.
//! Inside an array or object entry, every nested string, array or object is
//! replaced by the index of the entry that holds it, written as a decimal
//! string. Numbers, booleans and null stay inline. Identical strings and
//! identical subtrees share a single entry, which is where the size goes
//! down for repetitive run data.

use crate::FlattenError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;

/// Encode any serializable value into its flattened string form.
pub fn flatten<T: Serialize + ?Sized>(value: &T) -> Result<String, FlattenError> {
    let json = serde_json::to_value(value)?;
    let entries = Encoder::default().encode(json);
    Ok(serde_json::to_string(&entries)?)
}

/// Decode a string produced by [`flatten`].
pub fn unflatten<T: DeserializeOwned>(input: &str) -> Result<T, FlattenError> {
    let entries: Vec<Json> = serde_json::from_str(input)?;
    if entries.is_empty() {
        return Err(FlattenError::Empty);
    }
    let json = Decoder::new(&entries).entry(0)?;
    Ok(serde_json::from_value(json)?)
}

#[derive(Default)]
struct Encoder {
    entries: Vec<Json>,
    known: HashMap<String, usize>,
}

impl Encoder {
    fn encode(mut self, root: Json) -> Vec<Json> {
        // Slot 0 is reserved so the root is always first.
        self.entries.push(Json::Null);
        let root = self.shallow(root);
        self.entries[0] = root;
        self.entries
    }

    fn shallow(&mut self, value: Json) -> Json {
        match value {
            Json::Array(items) => {
                Json::Array(items.into_iter().map(|item| self.reference(item)).collect())
            }
            Json::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    let slot = self.reference(item);
                    out.insert(key, slot);
                }
                Json::Object(out)
            }
            other => other,
        }
    }

    fn reference(&mut self, value: Json) -> Json {
        match value {
            Json::Null | Json::Bool(_) | Json::Number(_) => value,
            compound => {
                let entry = self.shallow(compound);
                let key = entry.to_string();
                let index = match self.known.get(&key) {
                    Some(index) => *index,
                    None => {
                        let index = self.entries.len();
                        self.entries.push(entry);
                        self.known.insert(key, index);
                        index
                    }
                };
                Json::String(index.to_string())
            }
        }
    }
}

struct Decoder<'a> {
    entries: &'a [Json],
    resolved: Vec<Option<Json>>,
    visiting: Vec<bool>,
}

impl<'a> Decoder<'a> {
    fn new(entries: &'a [Json]) -> Self {
        Self {
            entries,
            resolved: vec![None; entries.len()],
            visiting: vec![false; entries.len()],
        }
    }

    fn entry(&mut self, index: usize) -> Result<Json, FlattenError> {
        if let Some(done) = &self.resolved[index] {
            return Ok(done.clone());
        }
        if self.visiting[index] {
            return Err(FlattenError::Cycle(index));
        }
        self.visiting[index] = true;

        let entries = self.entries;
        let value = match &entries[index] {
            Json::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.slot(item)?);
                }
                Json::Array(out)
            }
            Json::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.slot(item)?);
                }
                Json::Object(out)
            }
            literal => literal.clone(),
        };

        self.visiting[index] = false;
        self.resolved[index] = Some(value.clone());
        Ok(value)
    }

    fn slot(&mut self, slot: &Json) -> Result<Json, FlattenError> {
        match slot {
            Json::String(reference) => {
                let index: usize = reference
                    .parse()
                    .map_err(|_| FlattenError::InvalidReference(reference.clone()))?;
                if index >= self.entries.len() {
                    return Err(FlattenError::InvalidReference(reference.clone()));
                }
                self.entry(index)
            }
            inline => Ok(inline.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RunError, RunExecutionData, TaskData, Value};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_run_data() -> RunExecutionData {
        let mut data = RunExecutionData::new();
        let row = HashMap::from([
            ("status".to_string(), Value::from("ok")),
            ("count".to_string(), Value::from(3i64)),
            ("raw".to_string(), Value::Json(json!({"a": [1, "1", null, true]}))),
        ]);
        for _ in 0..3 {
            data.record_task(
                "fetch",
                TaskData {
                    start_time: Utc::now(),
                    execution_time_ms: 12,
                    data: row.clone(),
                    error: None,
                },
            );
        }
        data.result_data.error = Some(RunError::at_node("nope", "parse"));
        data.start_data.destination_node = Some("parse".to_string());
        data
    }

    #[test]
    fn run_data_survives_the_round_trip() {
        let data = sample_run_data();
        let flat = flatten(&data).unwrap();
        let back: RunExecutionData = unflatten(&flat).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn non_finite_step_outputs_round_trip() {
        let mut data = RunExecutionData::new();
        data.record_task(
            "divide",
            TaskData {
                start_time: Utc::now(),
                execution_time_ms: 1,
                data: HashMap::from([
                    ("nan".to_string(), Value::Number(f64::NAN)),
                    ("inf".to_string(), Value::Number(f64::INFINITY)),
                    ("neg".to_string(), Value::Number(f64::NEG_INFINITY)),
                ]),
                error: None,
            },
        );

        let back: RunExecutionData = unflatten(&flatten(&data).unwrap()).unwrap();
        let outputs = back.completed_outputs("divide").unwrap();
        assert!(outputs["nan"].as_f64().unwrap().is_nan());
        assert_eq!(outputs["inf"], Value::Number(f64::INFINITY));
        assert_eq!(outputs["neg"], Value::Number(f64::NEG_INFINITY));
    }

    #[test]
    fn repeated_subtrees_are_stored_once() {
        let item = json!({"name": "same", "tags": ["x", "y"]});
        let value = json!([item, item, item, item]);
        let flat = flatten(&value).unwrap();
        let entries: Vec<Json> = serde_json::from_str(&flat).unwrap();

        // root, "same", "x", "y", the tags array, the shared object
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0], json!(["5", "5", "5", "5"]));
        assert!(flat.len() < serde_json::to_string(&value).unwrap().len());
    }

    #[test]
    fn strings_that_look_like_references_are_preserved() {
        let value = json!({"a": "0", "b": ["1", "2"], "c": 0});
        let back: Json = unflatten(&flatten(&value).unwrap()).unwrap();
        assert_eq!(back, value);

        let root: Json = unflatten(&flatten(&json!("7")).unwrap()).unwrap();
        assert_eq!(root, json!("7"));
    }

    #[test]
    fn scalars_and_empty_containers_round_trip() {
        for value in [json!(null), json!(1.5), json!(false), json!([]), json!({})] {
            let back: Json = unflatten(&flatten(&value).unwrap()).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(unflatten::<Json>("[]"), Err(FlattenError::Empty)));
        assert!(matches!(
            unflatten::<Json>(r#"[["9"]]"#),
            Err(FlattenError::InvalidReference(_))
        ));
        assert!(matches!(
            unflatten::<Json>(r#"[["1"], ["1"]]"#),
            Err(FlattenError::Cycle(1))
        ));
        assert!(matches!(unflatten::<Json>("not json"), Err(FlattenError::Json(_))));
    }
}
