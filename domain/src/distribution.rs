//! Parameter distributions and their internal float representation.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Search space of a single parameter.
///
/// Parameter values are stored as `f64`; integers are stored as whole
/// floats and categorical values as the index into `choices`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "attributes")]
pub enum Distribution {
    Float {
        low: f64,
        high: f64,
        log: bool,
        step: Option<f64>,
    },
    Int {
        low: i64,
        high: i64,
        log: bool,
        step: i64,
    },
    Categorical {
        choices: Vec<serde_json::Value>,
    },
}

impl Distribution {
    pub fn float(low: f64, high: f64) -> Self {
        Distribution::Float {
            low,
            high,
            log: false,
            step: None,
        }
    }

    pub fn int(low: i64, high: i64) -> Self {
        Distribution::Int {
            low,
            high,
            log: false,
            step: 1,
        }
    }

    pub fn categorical(choices: Vec<serde_json::Value>) -> Self {
        Distribution::Categorical { choices }
    }

    fn kind(&self) -> &'static str {
        match self {
            Distribution::Float { .. } => "float",
            Distribution::Int { .. } => "int",
            Distribution::Categorical { .. } => "categorical",
        }
    }

    /// Reject malformed ranges, steps and empty choice lists.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Distribution::Float {
                low,
                high,
                log,
                step,
            } => {
                if !(low <= high) {
                    return Err(CoreError::InvalidArgument(format!(
                        "float distribution requires low <= high, got [{low}, {high}]"
                    )));
                }
                if *log && *low <= 0.0 {
                    return Err(CoreError::InvalidArgument(
                        "log float distribution requires low > 0".into(),
                    ));
                }
                if let Some(step) = step {
                    if *log || !(*step > 0.0) {
                        return Err(CoreError::InvalidArgument(
                            "float step must be positive and cannot be combined with log".into(),
                        ));
                    }
                }
                Ok(())
            }
            Distribution::Int {
                low,
                high,
                log,
                step,
            } => {
                if low > high {
                    return Err(CoreError::InvalidArgument(format!(
                        "int distribution requires low <= high, got [{low}, {high}]"
                    )));
                }
                if *step <= 0 || (*log && (*low < 1 || *step != 1)) {
                    return Err(CoreError::InvalidArgument(
                        "int step must be positive; log requires low >= 1 and step 1".into(),
                    ));
                }
                Ok(())
            }
            Distribution::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(CoreError::InvalidArgument(
                        "categorical distribution requires at least one choice".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Whether `internal` is a representable value of this distribution.
    pub fn contains(&self, internal: f64) -> bool {
        match self {
            Distribution::Float { low, high, .. } => *low <= internal && internal <= *high,
            Distribution::Int { low, high, .. } => {
                internal.fract() == 0.0 && (*low as f64) <= internal && internal <= (*high as f64)
            }
            Distribution::Categorical { choices } => {
                internal.fract() == 0.0 && internal >= 0.0 && (internal as usize) < choices.len()
            }
        }
    }

    /// Convert an internal value to what the user originally suggested.
    pub fn to_external(&self, internal: f64) -> serde_json::Value {
        match self {
            Distribution::Float { .. } => serde_json::Value::from(internal),
            Distribution::Int { .. } => serde_json::Value::from(internal as i64),
            Distribution::Categorical { choices } => choices
                .get(internal as usize)
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        }
    }

    /// Two distributions may share a parameter name only if they are of the
    /// same kind; categorical ones must also offer identical choices.
    pub fn check_compatibility(&self, other: &Distribution) -> Result<(), CoreError> {
        match (self, other) {
            (Distribution::Float { .. }, Distribution::Float { .. })
            | (Distribution::Int { .. }, Distribution::Int { .. }) => Ok(()),
            (Distribution::Categorical { choices: a }, Distribution::Categorical { choices: b }) => {
                if a == b {
                    Ok(())
                } else {
                    Err(CoreError::IncompatibleDistribution(
                        "categorical choices differ".into(),
                    ))
                }
            }
            _ => Err(CoreError::IncompatibleDistribution(format!(
                "cannot mix {} and {} distributions",
                self.kind(),
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_inverted_ranges() {
        assert!(Distribution::float(0.0, 1.0).validate().is_ok());
        assert!(Distribution::float(1.0, 0.0).validate().is_err());
        assert!(Distribution::int(5, 1).validate().is_err());
        assert!(Distribution::categorical(vec![]).validate().is_err());
    }

    #[test]
    fn validate_rejects_log_with_nonpositive_low() {
        let d = Distribution::Float {
            low: 0.0,
            high: 1.0,
            log: true,
            step: None,
        };
        assert!(matches!(d.validate(), Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn contains_checks_kind_specific_rules() {
        assert!(Distribution::float(-1.0, 1.0).contains(0.5));
        assert!(!Distribution::float(-1.0, 1.0).contains(1.5));
        assert!(!Distribution::float(-1.0, 1.0).contains(f64::NAN));
        assert!(Distribution::int(0, 10).contains(3.0));
        assert!(!Distribution::int(0, 10).contains(3.5));
        let c = Distribution::categorical(vec![json!("a"), json!("b")]);
        assert!(c.contains(1.0));
        assert!(!c.contains(2.0));
        assert!(!c.contains(-1.0));
    }

    #[test]
    fn to_external_maps_indices_to_choices() {
        let c = Distribution::categorical(vec![json!(1), json!("two"), json!(null)]);
        assert_eq!(c.to_external(1.0), json!("two"));
        assert_eq!(Distribution::int(0, 3).to_external(2.0), json!(2));
    }

    #[test]
    fn compatibility_rules() {
        let f = Distribution::float(0.0, 1.0);
        let f2 = Distribution::float(-5.0, 5.0);
        let i = Distribution::int(0, 1);
        assert!(f.check_compatibility(&f2).is_ok());
        assert!(matches!(
            f.check_compatibility(&i),
            Err(CoreError::IncompatibleDistribution(_))
        ));
        let a = Distribution::categorical(vec![json!("x")]);
        let b = Distribution::categorical(vec![json!("y")]);
        assert!(a.check_compatibility(&b).is_err());
        assert!(a.check_compatibility(&a.clone()).is_ok());
    }

    #[test]
    fn serializes_with_name_tag() {
        let v = serde_json::to_value(Distribution::int(1, 3)).unwrap();
        assert_eq!(v["name"], json!("Int"));
        assert_eq!(v["attributes"]["high"], json!(3));
    }
}
