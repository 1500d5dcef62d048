//! Put/delete set computation.

use std::collections::HashMap;

use serde_json::Value;

use crate::apisix::value::values_equivalent;
use crate::apisix::{ApisixConfiguration, ApisixResource, PluginMetadata, Route, Service, Ssl};
use crate::observability::metrics;

/// Minimal changes moving one configuration to another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    /// Resources to write (new or changed).
    pub put: ApisixConfiguration,
    /// Resources to remove.
    pub delete: ApisixConfiguration,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.put.is_empty() && self.delete.is_empty()
    }
}

/// Compute the put and delete sets that turn `old` into `new`.
pub fn diff(old: &ApisixConfiguration, new: &ApisixConfiguration) -> ConfigDiff {
    let mut result = ConfigDiff::default();
    diff_kind::<Route>(old, new, &mut result);
    diff_kind::<Service>(old, new, &mut result);
    diff_kind::<Ssl>(old, new, &mut result);
    diff_kind::<PluginMetadata>(old, new, &mut result);
    result
}

fn diff_kind<R: ApisixResource>(
    old: &ApisixConfiguration,
    new: &ApisixConfiguration,
    result: &mut ConfigDiff,
) {
    let mut unseen: HashMap<&str, &R> = R::select(old)
        .iter()
        .map(|(id, resource)| (id.as_str(), resource))
        .collect();

    for (id, desired) in R::select(new) {
        let changed = match unseen.remove(id.as_str()) {
            Some(current) => !resources_equivalent(current, desired),
            None => true,
        };
        if changed {
            R::select_mut(&mut result.put).insert(id.clone(), desired.clone());
        }
    }

    let deleted = R::select_mut(&mut result.delete);
    for (id, resource) in unseen {
        deleted.insert(id.to_string(), resource.clone());
    }
}

/// Structural equality ignoring the kind's volatile fields.
pub fn resources_equivalent<R: ApisixResource>(current: &R, desired: &R) -> bool {
    let (gateway, stage) = desired.gateway_and_stage();
    metrics::record_comparison(gateway, stage, R::KIND);

    let equal = current.stage_key() == desired.stage_key()
        && match (comparable_form(current), comparable_form(desired)) {
            (Some(a), Some(b)) => values_equivalent(&a, &b),
            _ => false,
        };

    if !equal {
        metrics::record_difference(gateway, stage, R::KIND);
    }
    equal
}

fn comparable_form<R: ApisixResource>(resource: &R) -> Option<Value> {
    let mut value = match serde_json::to_value(resource) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                kind = %R::KIND,
                id = resource.id(),
                error = %e,
                "Resource not serializable, treating as changed"
            );
            return None;
        }
    };
    if let Value::Object(fields) = &mut value {
        for field in R::VOLATILE_FIELDS {
            fields.remove(*field);
        }
    }
    Some(value)
}
