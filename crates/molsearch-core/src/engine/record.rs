use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ani::Ani;
use super::error::ModelError;
use super::kreg::Kreg;
use super::methods::{EnvironmentLocator, Method, ProgramLocator};
use super::model::Model;
use super::tree::{ModelTree, Operator};
use crate::core::io::traits::{ModelFile, PersistenceError, read_json, write_json};

/// Lightweight description of how to rebuild a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelRecord {
    Method {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        kwargs: BTreeMap<String, serde_json::Value>,
    },
    MlModel {
        ml_model_type: String,
        kwargs: MlModelKwargs,
    },
    ModelTreeNode {
        name: String,
        children: Option<Vec<ModelRecord>>,
        operator: Operator,
        model: Option<Box<ModelRecord>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlModelKwargs {
    pub model_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_program: Option<String>,
}

impl ModelFile for ModelRecord {
    type Error = PersistenceError;

    fn read_from(reader: &mut impl BufRead) -> Result<Self, Self::Error> {
        read_json(reader)
    }

    fn write_to(&self, writer: &mut impl Write) -> Result<(), Self::Error> {
        write_json(self, writer)
    }
}

/// Writes the record of `model` as JSON.
pub fn dump(model: &dyn Model, path: &Path) -> Result<(), ModelError> {
    model
        .to_record()?
        .write_to_path(path)
        .map_err(|e| ModelError::persistence(path, e))
}

/// Rebuilds a model from a JSON record file, resolving methods against the process
/// environment.
pub fn load_model(path: &Path) -> Result<Box<dyn Model>, ModelError> {
    let record = ModelRecord::read_from_path(path).map_err(|e| ModelError::persistence(path, e))?;
    debug!(path = %path.display(), "Loaded model record");
    from_record(record, &EnvironmentLocator)
}

/// Rebuilds a model from a record.
pub fn from_record(
    record: ModelRecord,
    locator: &dyn ProgramLocator,
) -> Result<Box<dyn Model>, ModelError> {
    match record {
        ModelRecord::Method {
            method,
            program,
            kwargs,
        } => Ok(Box::new(Method::resolve(
            &method,
            program.as_deref(),
            kwargs,
            locator,
        )?)),
        ModelRecord::MlModel {
            ml_model_type,
            kwargs,
        } => {
            // Qualified names such as `models.kreg` resolve by their last segment.
            let kind = ml_model_type
                .rsplit('.')
                .next()
                .unwrap_or(&ml_model_type)
                .to_ascii_lowercase();
            match kind.as_str() {
                "kreg" => Ok(Box::new(Kreg::from_file(&kwargs.model_file)?)),
                "ani" => Ok(Box::new(Ani::from_file(&kwargs.model_file)?)),
                _ => Err(ModelError::Configuration(format!(
                    "unknown ml_model_type '{ml_model_type}'"
                ))),
            }
        }
        tree @ ModelRecord::ModelTreeNode { .. } => {
            Ok(Box::new(ModelTree::from_record(tree, locator)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_use_type_tags() {
        let record = ModelRecord::ModelTreeNode {
            name: "root".into(),
            children: Some(vec![ModelRecord::Method {
                method: "D4".into(),
                program: None,
                kwargs: BTreeMap::from([("functional".to_string(), json!("wb97x"))]),
            }]),
            operator: Operator::Sum,
            model: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "model_tree_node");
        assert_eq!(value["operator"], "sum");
        assert_eq!(value["children"][0]["type"], "method");
        assert_eq!(value["children"][0]["kwargs"]["functional"], "wb97x");
        assert!(value["children"][0].get("program").is_none());
        assert!(value["model"].is_null());
    }

    #[test]
    fn ml_model_record_parses_qualified_type() {
        let record: ModelRecord = serde_json::from_value(json!({
            "type": "ml_model",
            "ml_model_type": "models.kreg",
            "kwargs": {"model_file": "/tmp/kreg.json", "ml_program": "native"}
        }))
        .unwrap();
        assert_eq!(
            record,
            ModelRecord::MlModel {
                ml_model_type: "models.kreg".into(),
                kwargs: MlModelKwargs {
                    model_file: PathBuf::from("/tmp/kreg.json"),
                    ml_program: Some("native".into()),
                },
            }
        );
    }

    #[test]
    fn unknown_ml_model_type_is_a_configuration_error() {
        let record = ModelRecord::MlModel {
            ml_model_type: "gap".into(),
            kwargs: MlModelKwargs {
                model_file: PathBuf::from("gap.json"),
                ml_program: None,
            },
        };
        let err = from_record(record, &EnvironmentLocator)
            .err()
            .expect("unknown model type must be rejected");
        assert!(matches!(err, ModelError::Configuration(_)));
    }
}
