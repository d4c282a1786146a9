use serde::{Deserialize, Serialize};
use std::fmt;

/// The data type a hyperparameter value is coerced to on every assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int,
    Float,
    Text,
    List,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::Int => "int",
            DType::Float => "float",
            DType::Text => "text",
            DType::List => "list",
        };
        f.write_str(name)
    }
}

/// A dynamically typed hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<HyperValue>),
}

impl HyperValue {
    pub fn dtype(&self) -> DType {
        match self {
            HyperValue::Bool(_) => DType::Bool,
            HyperValue::Int(_) => DType::Int,
            HyperValue::Float(_) => DType::Float,
            HyperValue::Text(_) => DType::Text,
            HyperValue::List(_) => DType::List,
        }
    }

    /// Converts the value to `dtype`.
    ///
    /// Floats are truncated toward zero when coerced to integers, text is parsed, and
    /// lists can be produced from JSON array text. Returns `None` if no sensible
    /// conversion exists.
    pub fn coerce(&self, dtype: DType) -> Option<HyperValue> {
        if self.dtype() == dtype {
            return Some(self.clone());
        }
        match (dtype, self) {
            (DType::Bool, HyperValue::Int(i)) => Some(HyperValue::Bool(*i != 0)),
            (DType::Bool, HyperValue::Float(x)) => Some(HyperValue::Bool(*x != 0.0)),
            (DType::Bool, HyperValue::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(HyperValue::Bool(true)),
                "false" | "0" | "no" => Some(HyperValue::Bool(false)),
                _ => None,
            },
            (DType::Int, HyperValue::Bool(b)) => Some(HyperValue::Int(i64::from(*b))),
            (DType::Int, HyperValue::Float(x)) if x.is_finite() => {
                Some(HyperValue::Int(x.trunc() as i64))
            }
            (DType::Int, HyperValue::Text(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|x| x.is_finite())
                            .map(|x| x.trunc() as i64)
                    })
                    .map(HyperValue::Int)
            }
            (DType::Float, HyperValue::Bool(b)) => {
                Some(HyperValue::Float(if *b { 1.0 } else { 0.0 }))
            }
            (DType::Float, HyperValue::Int(i)) => Some(HyperValue::Float(*i as f64)),
            (DType::Float, HyperValue::Text(s)) => {
                s.trim().parse::<f64>().ok().map(HyperValue::Float)
            }
            (DType::Text, other) => Some(HyperValue::Text(other.to_string())),
            (DType::List, HyperValue::Text(s)) => match serde_json::from_str(s) {
                Ok(HyperValue::List(items)) => Some(HyperValue::List(items)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HyperValue::Float(x) => Some(*x),
            HyperValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HyperValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HyperValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HyperValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[HyperValue]> {
        match self {
            HyperValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Reads a flat list of numbers.
    pub fn as_f64_list(&self) -> Option<Vec<f64>> {
        self.as_list()?.iter().map(HyperValue::as_f64).collect()
    }

    /// Reads a list of lists of non-negative integers (e.g. per-element layer widths).
    pub fn as_usize_lists(&self) -> Option<Vec<Vec<usize>>> {
        self.as_list()?
            .iter()
            .map(|inner| {
                inner
                    .as_list()?
                    .iter()
                    .map(|v| v.as_i64().and_then(|i| usize::try_from(i).ok()))
                    .collect()
            })
            .collect()
    }
}

impl fmt::Display for HyperValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HyperValue::Bool(b) => write!(f, "{b}"),
            HyperValue::Int(i) => write!(f, "{i}"),
            HyperValue::Float(x) => write!(f, "{x}"),
            HyperValue::Text(s) => f.write_str(s),
            HyperValue::List(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<bool> for HyperValue {
    fn from(v: bool) -> Self {
        HyperValue::Bool(v)
    }
}

impl From<i64> for HyperValue {
    fn from(v: i64) -> Self {
        HyperValue::Int(v)
    }
}

impl From<i32> for HyperValue {
    fn from(v: i32) -> Self {
        HyperValue::Int(i64::from(v))
    }
}

impl From<usize> for HyperValue {
    fn from(v: usize) -> Self {
        HyperValue::Int(v as i64)
    }
}

impl From<f64> for HyperValue {
    fn from(v: f64) -> Self {
        HyperValue::Float(v)
    }
}

impl From<&str> for HyperValue {
    fn from(v: &str) -> Self {
        HyperValue::Text(v.to_string())
    }
}

impl From<String> for HyperValue {
    fn from(v: String) -> Self {
        HyperValue::Text(v)
    }
}

impl<T: Into<HyperValue>> From<Vec<T>> for HyperValue {
    fn from(v: Vec<T>) -> Self {
        HyperValue::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_int_truncates_toward_zero() {
        assert_eq!(
            HyperValue::Float(2.9).coerce(DType::Int),
            Some(HyperValue::Int(2))
        );
        assert_eq!(
            HyperValue::Float(-2.9).coerce(DType::Int),
            Some(HyperValue::Int(-2))
        );
        assert_eq!(HyperValue::Float(f64::NAN).coerce(DType::Int), None);
    }

    #[test]
    fn text_is_parsed_into_numbers_and_lists() {
        assert_eq!(
            HyperValue::from("3.5").coerce(DType::Float),
            Some(HyperValue::Float(3.5))
        );
        assert_eq!(
            HyperValue::from("7.0").coerce(DType::Int),
            Some(HyperValue::Int(7))
        );
        assert_eq!(
            HyperValue::from("[1, 2.5]").coerce(DType::List),
            Some(HyperValue::List(vec![HyperValue::Int(1), HyperValue::Float(2.5)]))
        );
        assert_eq!(HyperValue::from("abc").coerce(DType::Float), None);
    }

    #[test]
    fn scalars_do_not_become_lists() {
        assert_eq!(HyperValue::Int(1).coerce(DType::List), None);
    }

    #[test]
    fn nested_lists_are_read_as_layer_widths() {
        let neurons = HyperValue::from(vec![vec![160i64, 128, 96]]);
        assert_eq!(neurons.as_usize_lists(), Some(vec![vec![160, 128, 96]]));
        assert_eq!(HyperValue::from(vec![-1i64]).as_usize_lists(), None);
    }

    #[test]
    fn untagged_serialization_is_plain_json() {
        let v = HyperValue::from(vec![1.5, 2.0]);
        assert_eq!(serde_json::to_string(&v).unwrap(), "[1.5,2.0]");
        let back: HyperValue = serde_json::from_str("[1.5,2.0]").unwrap();
        assert_eq!(back, v);
    }
}
