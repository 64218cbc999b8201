use std::time::Duration;

use kube::Resource;

/// Add `finalizer` to `obj`, returns `true` if it was missing.
pub(crate) fn add_finalizer_if_missing<T>(obj: &mut T, finalizer: &str) -> bool
where
    T: Resource,
{
    let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f.as_str() == finalizer) {
        false
    } else {
        finalizers.push(finalizer.to_string());
        true
    }
}

/// Remove `finalizer` from `obj`, returns `true` if it was present.
pub(crate) fn remove_finalizer<T>(obj: &mut T, finalizer: &str) -> bool
where
    T: Resource,
{
    match obj.meta_mut().finalizers.as_mut() {
        Some(finalizers) => {
            let len = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != len
        }
        None => false,
    }
}

pub(crate) fn has_finalizer<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .iter()
        .flatten()
        .any(|f| f.as_str() == finalizer)
}

pub(crate) fn is_deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("provider_bitbucket_{}", name)
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a number of seconds, e.g. `POLL_INTERVAL_SECONDS=60`.
pub(crate) fn parse_seconds(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_secs)
}
