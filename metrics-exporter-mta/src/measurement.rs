use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};

/// Largest integer that an `f64` represents exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A measured value, either a single number or a named breakdown of further measurements.
///
/// Breakdowns let a caller record a family of related values under one name, such as the phases of a sub-resource
/// load. When buffered, a breakdown is flattened into dotted paths: `api` with `{deal: 25, dynamic: 10}` becomes
/// `api.deal = 25` and `api.dynamic = 10`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Measurement {
    /// A single value.
    Value(f64),

    /// Named sub-measurements.
    Group(BTreeMap<String, Measurement>),
}

impl Measurement {
    /// Creates a breakdown from `(name, value)` pairs.
    pub fn group<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Measurement>,
    {
        Measurement::Group(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Returns `true` if this is a breakdown with no values anywhere beneath it.
    pub fn is_empty(&self) -> bool {
        match self {
            Measurement::Value(_) => false,
            Measurement::Group(entries) => entries.values().all(Measurement::is_empty),
        }
    }

    /// Visits every leaf value with its fully-qualified dotted name.
    pub fn flatten<F>(&self, name: &str, f: &mut F)
    where
        F: FnMut(String, f64),
    {
        match self {
            Measurement::Value(value) => f(name.to_owned(), *value),
            Measurement::Group(entries) => {
                for (sub, value) in entries {
                    let mut path = String::with_capacity(name.len() + 1 + sub.len());
                    path.push_str(name);
                    path.push('.');
                    path.push_str(sub);
                    value.flatten(&path, f);
                }
            }
        }
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Whole values are written without a fractional part, as the collector expects integer milliseconds.
            Measurement::Value(value) if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER => {
                serializer.serialize_i64(*value as i64)
            }
            Measurement::Value(value) => serializer.serialize_f64(*value),
            Measurement::Group(entries) => entries.serialize(serializer),
        }
    }
}

macro_rules! impl_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Measurement {
                fn from(value: $ty) -> Self {
                    Measurement::Value(value as f64)
                }
            }
        )*
    };
}

impl_from_number!(f64, f32, u64, u32, u16, u8, i64, i32, i16, i8, usize);

impl<K: Into<String>, V: Into<Measurement>> FromIterator<(K, V)> for Measurement {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Measurement::group(iter)
    }
}

impl<K: Into<String>, V: Into<Measurement>> From<BTreeMap<K, V>> for Measurement {
    fn from(entries: BTreeMap<K, V>) -> Self {
        Measurement::group(entries)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Measurement;

    fn flattened(measurement: &Measurement, name: &str) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        measurement.flatten(name, &mut |k, v| out.push((k, v)));
        out
    }

    #[test]
    fn scalar_flattens_to_itself() {
        assert_eq!(flattened(&Measurement::from(25), "api"), vec![("api".to_owned(), 25.0)]);
    }

    #[test]
    fn nested_groups_flatten_to_dotted_paths() {
        let measurement: Measurement = serde_json::from_value(json!({
            "sidebar": {"total": 123, "wait": 100},
            "deal": 25,
        }))
        .unwrap();

        assert_eq!(
            flattened(&measurement, "feature"),
            vec![
                ("feature.deal".to_owned(), 25.0),
                ("feature.sidebar.total".to_owned(), 123.0),
                ("feature.sidebar.wait".to_owned(), 100.0),
            ]
        );
    }

    #[test]
    fn serializes_whole_values_as_integers() {
        let measurement = Measurement::group([("deal", 25.0), ("ratio", 0.5)]);
        assert_eq!(serde_json::to_string(&measurement).unwrap(), r#"{"deal":25,"ratio":0.5}"#);
    }

    #[test]
    fn empty_groups() {
        assert!(Measurement::Group(Default::default()).is_empty());
        assert!(!Measurement::from(0).is_empty());
        assert!(Measurement::group([("a", Measurement::Group(Default::default()))]).is_empty());
    }
}
