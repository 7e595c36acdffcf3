//! Configure parameters, tweaks and the aggregated configure contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, ScanError};
use crate::generator::CompoundGenerator;

pub const GENERATOR: &str = "generator";
pub const AXES_TO_MOVE: &str = "axesToMove";
pub const BREAKPOINTS: &str = "breakpoints";

/// Arguments of validate and configure.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureParams {
    pub generator: CompoundGenerator,
    pub axes_to_move: Vec<String>,
    pub breakpoints: Vec<usize>,
    /// Parameters contributed by parts, by name.
    pub extra: Map<String, Value>,
}

impl ConfigureParams {
    pub fn new(generator: CompoundGenerator, axes_to_move: Vec<String>) -> Self {
        Self {
            generator,
            axes_to_move,
            breakpoints: Vec::new(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_breakpoints(mut self, breakpoints: Vec<usize>) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.extra.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        match name {
            GENERATOR => Some(self.generator.to_value()),
            AXES_TO_MOVE => serde_json::to_value(&self.axes_to_move).ok(),
            BREAKPOINTS => serde_json::to_value(&self.breakpoints).ok(),
            other => self.extra.get(other).cloned(),
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.extra.get(name).and_then(Value::as_f64)
    }

    /// Replace one parameter by name.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let bad = |e: serde_json::Error| ScanError::Validation(format!("bad value for {name}: {e}"));
        match name {
            GENERATOR => self.generator = CompoundGenerator::from_value(&value)?,
            AXES_TO_MOVE => self.axes_to_move = serde_json::from_value(value).map_err(bad)?,
            BREAKPOINTS => self.breakpoints = serde_json::from_value(value).map_err(bad)?,
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut m = self.extra.clone();
        for name in [GENERATOR, AXES_TO_MOVE, BREAKPOINTS] {
            if let Some(v) = self.get(name) {
                m.insert(name.to_string(), v);
            }
        }
        m
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let generator = map
            .get(GENERATOR)
            .ok_or_else(|| ScanError::Validation("missing generator".into()))?;
        let mut out = Self::new(CompoundGenerator::from_value(generator)?, Vec::new());
        for (k, v) in map {
            if k != GENERATOR {
                out.set(k, v.clone())?;
            }
        }
        Ok(out)
    }
}

/// A part's request to change one configure parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTweakInfo {
    pub parameter: String,
    pub value: Value,
}

impl ParameterTweakInfo {
    pub fn new(parameter: &str, value: Value) -> Self {
        Self {
            parameter: parameter.to_string(),
            value,
        }
    }
}

// ── Contract ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Number,
    Text,
    Bool,
    Array,
    Generator,
    /// Rows of objects; `primary_keys` name the columns identifying a row.
    Table { primary_keys: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(flatten)]
    pub kind: ParamKind,
    pub description: String,
}

impl ParamSchema {
    pub fn new(kind: ParamKind, description: &str) -> Self {
        Self {
            kind,
            description: description.to_string(),
        }
    }
}

/// One part's contribution to the configure contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigureParamsInfo {
    pub params: BTreeMap<String, ParamSchema>,
    pub required: Vec<String>,
    pub defaults: Map<String, Value>,
}

impl ConfigureParamsInfo {
    #[must_use]
    pub fn param(mut self, name: &str, schema: ParamSchema, default: Option<Value>) -> Self {
        self.params.insert(name.to_string(), schema);
        match default {
            Some(v) => {
                self.defaults.insert(name.to_string(), v);
            }
            None => self.required.push(name.to_string()),
        }
        self
    }
}

/// The merged configure contract of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureContract {
    pub params: BTreeMap<String, ParamSchema>,
    pub required: Vec<String>,
    pub defaults: Map<String, Value>,
}

impl ConfigureContract {
    /// Merge contributions in registration order on top of the built-in
    /// generator, axes and breakpoints parameters.
    pub fn aggregate<'a>(infos: impl IntoIterator<Item = &'a ConfigureParamsInfo>) -> Self {
        let mut out = Self {
            params: BTreeMap::new(),
            required: vec![GENERATOR.to_string(), AXES_TO_MOVE.to_string(), BREAKPOINTS.to_string()],
            defaults: Map::new(),
        };
        out.params
            .insert(GENERATOR.into(), ParamSchema::new(ParamKind::Generator, "Scan points to visit"));
        out.params
            .insert(AXES_TO_MOVE.into(), ParamSchema::new(ParamKind::Array, "Axes the scan may move"));
        out.params.insert(
            BREAKPOINTS.into(),
            ParamSchema::new(ParamKind::Array, "Steps to run before each pause"),
        );

        for info in infos {
            for (name, schema) in &info.params {
                if let Some(old) = out.params.get(name)
                    && old != schema
                {
                    tracing::debug!(param = %name, "parameter schema replaced by later registration");
                }
                out.params.insert(name.clone(), schema.clone());
            }
            for name in &info.required {
                if !out.required.contains(name) {
                    out.required.push(name.clone());
                }
            }
            for (name, value) in &info.defaults {
                let merged = match (out.defaults.get(name), out.params.get(name)) {
                    (Some(Value::Array(old)), Some(ParamSchema { kind: ParamKind::Table { primary_keys }, .. })) => {
                        merge_table(old, value, primary_keys)
                    }
                    _ => value.clone(),
                };
                out.defaults.insert(name.clone(), merged);
            }
        }
        out
    }

    /// Keep only the parameters this contract accepts.
    pub fn filter(&self, params: &Map<String, Value>) -> Map<String, Value> {
        params
            .iter()
            .filter(|(k, _)| self.params.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Fill defaults for absent parameters and check nothing required is
    /// missing.
    pub fn complete(&self, params: &mut ConfigureParams) -> Result<()> {
        for (name, value) in &self.defaults {
            if params.get(name).is_none() {
                params.set(name, value.clone())?;
            }
        }
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|name| params.get(name).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ScanError::Validation(format!("missing required parameters {missing:?}")).into());
        }
        Ok(())
    }
}

fn row_key<'a>(row: &'a Value, keys: &[String]) -> Vec<Option<&'a Value>> {
    keys.iter().map(|k| row.get(k)).collect()
}

/// Row-wise merge of two table defaults: rows with matching primary keys are
/// combined field by field, other rows are appended.
fn merge_table(old: &[Value], new: &Value, primary_keys: &[String]) -> Value {
    let mut rows: Vec<Value> = old.to_vec();
    let Value::Array(new_rows) = new else {
        return new.clone();
    };
    for row in new_rows {
        let key = row_key(row, primary_keys);
        let existing = rows.iter_mut().find(|r| row_key(r, primary_keys) == key);
        match (existing, row) {
            (Some(Value::Object(dst)), Value::Object(src)) => {
                for (k, v) in src {
                    dst.insert(k.clone(), v.clone());
                }
            }
            _ => rows.push(row.clone()),
        }
    }
    Value::Array(rows)
}
