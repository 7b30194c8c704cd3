//! Query planning: validation and filter expansion
//!
//! Planning resolves each event name against the registry, validates the
//! resolution and group labels, drops undeclared filter labels, removes
//! grouped labels from the filter map (grouping subsumes filtering on that
//! label) and expands the remaining filters into the cartesian product of
//! their value lists.

use super::{Query, QueryBuilder};
use crate::error::QueryError;
use crate::registry::Registry;
use std::collections::HashMap;

impl QueryBuilder {
    /// Plan one query per event name
    ///
    /// Planning failures are attached to the affected query; sibling events
    /// still plan and execute.
    pub fn queries(&self, registry: &Registry) -> Vec<Query> {
        self.events
            .iter()
            .map(|name| self.plan_event(name, registry))
            .collect()
    }

    fn plan_event(&self, name: &str, registry: &Registry) -> Query {
        let mut query = Query::unplanned(self);

        let Some(event) = registry.get(name) else {
            return query.with_error(QueryError::UnregisteredEvent);
        };
        let desc = event.desc();
        if let Some(err) = desc.error() {
            let err = err.clone();
            query.event = Some(event);
            return query.with_error(QueryError::InvalidDescriptor(err));
        }

        let Some(resolution) = desc.resolution(&self.resolution) else {
            query.event = Some(event);
            return query.with_error(QueryError::InvalidResolution);
        };
        query.resolution = Some(resolution.clone());

        if self.group.iter().any(|g| !desc.has_label(g)) {
            query.event = Some(event);
            return query.with_error(QueryError::InvalidGroupLabel);
        }

        // Undeclared filter labels are dropped; grouped labels are subsumed
        let filters: HashMap<String, Vec<String>> = self
            .filters
            .iter()
            .filter(|(label, _)| desc.has_label(label) && !self.group.contains(label))
            .map(|(label, values)| (label.clone(), values.clone()))
            .collect();

        query.event = Some(event);
        query.value_filters = permutations(&filters);
        query
    }
}

/// Expand a filter map into the cartesian product of its value lists
///
/// Returns exactly `∏ |filters[k]|` maps: the empty filter map yields the
/// singleton empty map, and a present-but-empty value list yields nothing.
/// The expansion runs as an iterative odometer over the per-label value
/// counts.
pub fn permutations(filters: &HashMap<String, Vec<String>>) -> Vec<HashMap<String, String>> {
    let mut keys: Vec<&String> = filters.keys().collect();
    keys.sort();
    let counts: Vec<usize> = keys.iter().map(|k| filters[*k].len()).collect();
    if counts.iter().any(|&c| c == 0) {
        return Vec::new();
    }

    let total = counts.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut odometer = vec![0usize; keys.len()];
    loop {
        let mut selection = HashMap::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            selection.insert((*key).clone(), filters[*key][odometer[i]].clone());
        }
        out.push(selection);

        // Tick the odometer; carry right-to-left
        let mut pos = odometer.len();
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            odometer[pos] += 1;
            if odometer[pos] < counts[pos] {
                break;
            }
            odometer[pos] = 0;
        }
    }
}
