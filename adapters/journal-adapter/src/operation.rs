//! Journal record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use domain::{Attrs, Distribution, FrozenTrial, StudyDirection, StudyId, TrialId, TrialState};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One line of the journal: an operation tagged with the worker that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub worker_id: String,
    pub op: JournalOperation,
}

/// A mutation of the storage, replayed in log order by every reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op_code", rename_all = "snake_case")]
pub enum JournalOperation {
    CreateStudy {
        study_name: String,
        directions: Vec<StudyDirection>,
    },
    DeleteStudy {
        study_id: StudyId,
    },
    SetStudyUserAttr {
        study_id: StudyId,
        key: String,
        value: serde_json::Value,
    },
    SetStudySystemAttr {
        study_id: StudyId,
        key: String,
        value: serde_json::Value,
    },
    CreateTrial {
        study_id: StudyId,
        /// Stamped by the writer; ignored when a template is given.
        datetime_start: DateTime<Utc>,
        template: Option<TrialTemplate>,
    },
    SetTrialParam {
        trial_id: TrialId,
        name: String,
        value: JsonFloat,
        distribution: Distribution,
    },
    SetTrialStateValues {
        trial_id: TrialId,
        state: TrialState,
        values: Option<Vec<JsonFloat>>,
        datetime: DateTime<Utc>,
    },
    SetTrialIntermediateValue {
        trial_id: TrialId,
        step: u64,
        value: JsonFloat,
    },
    SetTrialUserAttr {
        trial_id: TrialId,
        key: String,
        value: serde_json::Value,
    },
    SetTrialSystemAttr {
        trial_id: TrialId,
        key: String,
        value: serde_json::Value,
    },
}

/// Everything a trial template carries, in a JSON-safe form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialTemplate {
    pub state: TrialState,
    pub values: Option<Vec<JsonFloat>>,
    pub datetime_start: Option<DateTime<Utc>>,
    pub datetime_complete: Option<DateTime<Utc>>,
    pub params: BTreeMap<String, JsonFloat>,
    pub distributions: BTreeMap<String, Distribution>,
    pub user_attrs: Attrs,
    pub system_attrs: Attrs,
    pub intermediate_values: BTreeMap<u64, JsonFloat>,
}

impl From<&FrozenTrial> for TrialTemplate {
    fn from(t: &FrozenTrial) -> Self {
        Self {
            state: t.state,
            values: t.values.as_ref().map(|v| JsonFloat::wrap_all(v)),
            datetime_start: t.datetime_start,
            datetime_complete: t.datetime_complete,
            params: t
                .params
                .iter()
                .map(|(k, v)| (k.clone(), JsonFloat(*v)))
                .collect(),
            distributions: t.distributions.clone(),
            user_attrs: t.user_attrs.clone(),
            system_attrs: t.system_attrs.clone(),
            intermediate_values: t
                .intermediate_values
                .iter()
                .map(|(k, v)| (*k, JsonFloat(*v)))
                .collect(),
        }
    }
}

impl TrialTemplate {
    pub fn into_trial(self, trial_id: TrialId, number: u64) -> FrozenTrial {
        FrozenTrial {
            trial_id,
            number,
            state: self.state,
            values: self.values.map(|v| JsonFloat::unwrap_all(&v)),
            datetime_start: self.datetime_start,
            datetime_complete: self.datetime_complete,
            params: self.params.into_iter().map(|(k, v)| (k, v.0)).collect(),
            distributions: self.distributions,
            user_attrs: self.user_attrs,
            system_attrs: self.system_attrs,
            intermediate_values: self
                .intermediate_values
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect(),
        }
    }
}

/// `f64` that survives JSON: infinities are written as `"inf"` / `"-inf"`
/// and NaN as `"nan"`, since JSON numbers cannot hold them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JsonFloat(pub f64);

impl JsonFloat {
    pub fn wrap_all(values: &[f64]) -> Vec<JsonFloat> {
        values.iter().copied().map(JsonFloat).collect()
    }

    pub fn unwrap_all(values: &[JsonFloat]) -> Vec<f64> {
        values.iter().map(|v| v.0).collect()
    }
}

impl Serialize for JsonFloat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let v = self.0;
        if v.is_finite() {
            serializer.serialize_f64(v)
        } else if v.is_nan() {
            serializer.serialize_str("nan")
        } else if v > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }
}

impl<'de> Deserialize<'de> for JsonFloat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(JsonFloat(v)),
            Repr::Text(s) => match s.as_str() {
                "inf" => Ok(JsonFloat(f64::INFINITY)),
                "-inf" => Ok(JsonFloat(f64::NEG_INFINITY)),
                "nan" => Ok(JsonFloat(f64::NAN)),
                other => Err(serde::de::Error::custom(format!(
                    "invalid float literal: {other}"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_finite_floats_use_string_literals() {
        let v = serde_json::to_value(JsonFloat::wrap_all(&[1.5, f64::INFINITY, f64::NEG_INFINITY]))
            .unwrap();
        assert_eq!(v, json!([1.5, "inf", "-inf"]));
        let back: Vec<JsonFloat> = serde_json::from_value(v).unwrap();
        assert_eq!(back[1].0, f64::INFINITY);
        assert_eq!(back[2].0, f64::NEG_INFINITY);
    }

    #[test]
    fn records_are_tagged_by_op_code() {
        let record = JournalRecord {
            worker_id: "w".into(),
            op: JournalOperation::DeleteStudy {
                study_id: StudyId(3),
            },
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["op"]["op_code"], json!("delete_study"));
        assert_eq!(v["op"]["study_id"], json!(3));
    }

    #[test]
    fn rejects_unknown_float_literal() {
        let err = serde_json::from_value::<JsonFloat>(json!("big"));
        assert!(err.is_err());
    }
}
