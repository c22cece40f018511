// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Temp ID rewriting for queued mutations and cached payloads.
//!
//! A temp ID can appear in four places of a mutation: the target id, the
//! parent id, a segment of the endpoint path (or a query value) and any
//! string value inside the JSON body. Only whole-value matches are
//! rewritten; `temp-1` never matches inside `temp-10`.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::model::{is_temp_id, Mutation};

/// Replace every JSON string equal to `from` with `to`. Object keys are
/// left alone. Returns the number of replacements.
pub fn rewrite_value(value: &mut Value, from: &str, to: &str) -> usize {
    match value {
        Value::String(s) if s == from => {
            *s = to.to_string();
            1
        }
        Value::Array(items) => items.iter_mut().map(|v| rewrite_value(v, from, to)).sum(),
        Value::Object(map) => map.values_mut().map(|v| rewrite_value(v, from, to)).sum(),
        _ => 0,
    }
}

/// Rewrite path segments and query values equal to `from`.
/// Returns `None` when nothing matched.
pub fn rewrite_endpoint(endpoint: &str, from: &str, to: &str) -> Option<String> {
    let (path, query) = match endpoint.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (endpoint, None),
    };

    let mut changed = false;
    let path: Vec<&str> = path
        .split('/')
        .map(|seg| {
            if seg == from {
                changed = true;
                to
            } else {
                seg
            }
        })
        .collect();
    let mut out = path.join("/");

    if let Some(query) = query {
        let pairs: Vec<String> = query
            .split('&')
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) if v == from => {
                    changed = true;
                    format!("{}={}", k, to)
                }
                _ => pair.to_string(),
            })
            .collect();
        out.push('?');
        out.push_str(&pairs.join("&"));
    }

    changed.then_some(out)
}

/// Rewrite every reference to `from` inside `mutation`.
///
/// The mutation's own `temp_id` (the placeholder a create introduces) is
/// kept as a record of where the entity came from; `real_id` is filled in
/// when the target itself is rewritten. Returns whether anything changed.
pub fn rewrite_mutation(mutation: &mut Mutation, from: &str, to: &str) -> bool {
    let mut changed = false;

    if mutation.entity_id == from {
        mutation.entity_id = to.to_string();
        mutation.real_id = Some(to.to_string());
        changed = true;
    }
    if mutation.parent_id.as_deref() == Some(from) {
        mutation.parent_id = Some(to.to_string());
        changed = true;
    }
    if let Some(endpoint) = rewrite_endpoint(&mutation.endpoint, from, to) {
        mutation.endpoint = endpoint;
        changed = true;
    }
    if rewrite_value(&mut mutation.body, from, to) > 0 {
        changed = true;
    }

    changed
}

/// Every temp ID the mutation still references, excluding the one it
/// creates itself.
pub fn unresolved_temp_ids(mutation: &Mutation, prefix: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let own = mutation.temp_id.as_deref();

    let mut note = |id: &str| {
        if is_temp_id(id, prefix) && Some(id) != own {
            found.insert(id.to_string());
        }
    };

    note(&mutation.entity_id);
    if let Some(parent) = &mutation.parent_id {
        note(parent);
    }
    let (path, query) = match mutation.endpoint.split_once('?') {
        Some((p, q)) => (p, q),
        None => (mutation.endpoint.as_str(), ""),
    };
    for seg in path.split('/') {
        note(seg);
    }
    for pair in query.split('&') {
        if let Some((_, v)) = pair.split_once('=') {
            note(v);
        }
    }
    collect_strings(&mutation.body, &mut note);

    found
}

fn collect_strings(value: &Value, f: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, f)),
        _ => {}
    }
}
