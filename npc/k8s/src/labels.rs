use anyhow::{bail, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of labeled objects. The results of `match_labels` and
/// `match_expressions` are ANDed.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

// === impl Selector ===

impl Selector {
    /// Compiles a Kubernetes `LabelSelector` into a matchable form, failing
    /// on malformed match expressions.
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self> {
        let match_expressions = selector
            .match_expressions
            .as_ref()
            .map(|exprs| {
                exprs
                    .iter()
                    .map(|req| {
                        let operator = match req.operator.as_str() {
                            "In" => Operator::In,
                            "NotIn" => Operator::NotIn,
                            "Exists" => Operator::Exists,
                            "DoesNotExist" => Operator::DoesNotExist,
                            op => bail!("unknown selector operator {:?}", op),
                        };
                        let values = req.values.as_ref().map(|vs| vs.iter().cloned().collect());
                        match operator {
                            Operator::In | Operator::NotIn
                                if values.as_ref().map_or(true, BTreeSet::is_empty) =>
                            {
                                bail!("operator {:?} requires values", req.operator)
                            }
                            Operator::Exists | Operator::DoesNotExist if values.is_some() => {
                                bail!("operator {:?} must not carry values", req.operator)
                            }
                            _ => {}
                        }
                        Ok(Expression {
                            key: req.key.clone(),
                            operator,
                            values,
                        })
                    })
                    .collect::<Result<Expressions>>()
            })
            .transpose()?;

        Ok(Self {
            match_labels: selector.match_labels.clone(),
            match_expressions,
        })
    }

    /// Indicates whether this selector matches all objects.
    pub fn selects_all(&self) -> bool {
        match (self.match_labels.as_ref(), self.match_expressions.as_ref()) {
            (None, None) => true,
            (Some(l), None) => l.is_empty(),
            (None, Some(e)) => e.is_empty(),
            (Some(l), Some(e)) => l.is_empty() && e.is_empty(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            match_labels: Some(iter.into_iter().collect()),
            match_expressions: None,
        }
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === impl Labels ===

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === impl Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match (self.operator, &self.key, self.values.as_ref()) {
            (Operator::In, key, Some(values)) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            (Operator::NotIn, key, Some(values)) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            (Operator::Exists, key, None) => labels.contains_key(key),
            (Operator::DoesNotExist, key, None) => !labels.contains_key(key),
            (operator, key, values) => {
                tracing::warn!(?operator, %key, ?values, "illegal match expression");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn requirement(key: &str, operator: &str, values: Option<Vec<&str>>) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: values.map(|vs| vs.into_iter().map(Into::into).collect()),
        }
    }

    #[test]
    fn matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "baz"))),
                false,
                "label mismatch",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn from_label_selector_expressions() {
        let sel = Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("team", "In", Some(vec!["red", "blue"]))]),
        })
        .unwrap();
        assert!(sel.matches(&Labels::from_iter(Some(("team", "red")))));
        assert!(!sel.matches(&Labels::from_iter(Some(("team", "green")))));

        let sel = Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("team", "DoesNotExist", None)]),
        })
        .unwrap();
        assert!(sel.matches(&Labels::default()));
        assert!(!sel.matches(&Labels::from_iter(Some(("team", "red")))));
    }

    #[test]
    fn from_label_selector_rejects_malformed() {
        assert!(Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("team", "Near", Some(vec!["red"]))]),
        })
        .is_err());
        assert!(Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("team", "In", None)]),
        })
        .is_err());
    }

    #[test]
    fn empty_selector_selects_all() {
        let sel = Selector::from_label_selector(&LabelSelector::default()).unwrap();
        assert!(sel.selects_all());
        assert!(sel.matches(&Labels::from_iter(Some(("any", "thing")))));
    }
}
