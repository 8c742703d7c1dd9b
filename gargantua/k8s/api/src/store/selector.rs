use std::collections::BTreeMap;

/// A parsed label selector: a conjunction of `k=v`, `k==v`, `k!=v`, `k` and `!k` requirements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(Vec<Requirement>);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid label selector requirement: {0:?}")]
pub struct SelectorError(String);

impl std::str::FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut reqs = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(key(k, term)?, v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(key(k, term)?, v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::DoesNotExist(key(k, term)?)
            } else {
                Requirement::Exists(key(term, term)?)
            };
            reqs.push(req);
        }
        Ok(Self(reqs))
    }
}

fn key(k: &str, term: &str) -> Result<String, SelectorError> {
    let k = k.trim();
    if k.is_empty() || k.contains(|c: char| c.is_whitespace() || c == '!' || c == '=') {
        return Err(SelectorError(term.to_string()));
    }
    Ok(k.to_string())
}

impl Selector {
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k));
        self.0.iter().all(|req| match req {
            Requirement::Equals(k, v) => get(k) == Some(v),
            Requirement::NotEquals(k, v) => get(k) != Some(v),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn test_matches() {
        let labels = btreemap! {
            "hobbyfarm.io/machine-set".to_string() => "ms1".to_string(),
            "ready".to_string() => "false".to_string(),
        };
        for (selector, expected) in [
            ("", true),
            ("hobbyfarm.io/machine-set=ms1", true),
            ("hobbyfarm.io/machine-set==ms1", true),
            ("hobbyfarm.io/machine-set=ms2", false),
            ("hobbyfarm.io/machine-set!=ms2", true),
            ("ready", true),
            ("!ready", false),
            ("!hobbyfarm.io/otac-set", true),
            ("hobbyfarm.io/machine-set=ms1,ready!=false", false),
            ("hobbyfarm.io/machine-set=ms1, ready=false", true),
        ] {
            let sel = selector.parse::<Selector>().unwrap();
            assert_eq!(sel.matches(Some(&labels)), expected, "{selector}");
        }
        assert!("!missing".parse::<Selector>().unwrap().matches(None));
        assert!(!"present".parse::<Selector>().unwrap().matches(None));
    }

    #[test]
    fn rejects_malformed() {
        assert!("=v".parse::<Selector>().is_err());
        assert!("!".parse::<Selector>().is_err());
        assert!("a b".parse::<Selector>().is_err());
    }
}
