use std::collections::BTreeMap;

pub type Configuration = BTreeMap<String, String>;

/// Merges configuration layers, lowest precedence first. Later layers override keys set by
/// earlier ones; absent layers are skipped.
pub fn merge<'a>(layers: impl IntoIterator<Item = Option<&'a Configuration>>) -> Configuration {
    let mut merged = Configuration::new();
    for layer in layers.into_iter().flatten() {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn later_layers_take_precedence() {
        let template = btreemap! {
            "image".to_string() => "ubuntu-22.04".to_string(),
            "size".to_string() => "small".to_string(),
        };
        let environment = btreemap! {
            "size".to_string() => "medium".to_string(),
            "region".to_string() => "us-east-1".to_string(),
        };
        let template_override = btreemap! {
            "size".to_string() => "large".to_string(),
        };

        let merged = merge([Some(&template), None, Some(&environment), Some(&template_override)]);
        assert_eq!(
            merged,
            btreemap! {
                "image".to_string() => "ubuntu-22.04".to_string(),
                "region".to_string() => "us-east-1".to_string(),
                "size".to_string() => "large".to_string(),
            }
        );
    }
}
