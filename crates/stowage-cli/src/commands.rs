//! Subcommand implementations, written against any [`StorageContainer`].

use anyhow::{Context, Result, bail};
use futures::TryStreamExt;
use serde_json::Value as Json;
use stowage_store::{
    ColumnPredicate, CompareOp, DecomposedObject, HookDecision, HookRegistry, Operation,
    Predicate, StorageContainer, StorageError, Value,
};
use tracing::info;

/// Fetch one object as JSON.
pub async fn get(container: &dyn StorageContainer, key: &str) -> Result<Json> {
    match container.retrieve(key).await {
        Ok(object) => Ok(object.to_json()?),
        Err(StorageError::NotFound { .. }) => bail!("no object stored under `{key}`"),
        Err(e) => Err(e).with_context(|| format!("failed to retrieve `{key}`")),
    }
}

/// Store a JSON object under `key`.
pub async fn put(container: &dyn StorageContainer, key: &str, json: &str) -> Result<()> {
    let tree: Json = serde_json::from_str(json).context("object is not valid JSON")?;
    let object = DecomposedObject::from_json(tree).context("object must be a JSON object")?;
    container
        .store(key, &object)
        .await
        .with_context(|| format!("failed to store `{key}`"))?;
    info!(key, fields = object.len(), "stored");
    Ok(())
}

pub async fn delete(container: &dyn StorageContainer, key: &str) -> Result<()> {
    container
        .delete(key)
        .await
        .with_context(|| format!("failed to delete `{key}`"))?;
    info!(key, "deleted");
    Ok(())
}

pub async fn keys(container: &dyn StorageContainer) -> Result<Vec<String>> {
    Ok(container.keys().await?)
}

/// Every object matching `predicate`, as a JSON map keyed by storage key.
pub async fn dump(container: &dyn StorageContainer, predicate: &Predicate) -> Result<Json> {
    let mut stream = container.retrieve_all(Some(predicate));
    let mut out = serde_json::Map::new();
    while let Some((key, object)) = stream.try_next().await? {
        let tree = object.to_json()?;
        out.insert(key, tree);
    }
    Ok(Json::Object(out))
}

/// Parse a `--where` clause: `PATH=VALUE`, or `!=`, `<`, `<=`, `>`, `>=`.
///
/// `VALUE` is read as a JSON scalar when it parses as one (`30`, `true`,
/// `"30"`), otherwise as bare text.
pub fn parse_filter(clause: &str) -> Result<ColumnPredicate, String> {
    let at = clause
        .find(['=', '!', '<', '>'])
        .ok_or_else(|| format!("`{clause}` is not PATH=VALUE"))?;
    let (path, rest) = clause.split_at(at);
    let (op, raw) = match rest.as_bytes() {
        [b'!', b'=', ..] => (CompareOp::Ne, &rest[2..]),
        [b'<', b'=', ..] => (CompareOp::Le, &rest[2..]),
        [b'>', b'=', ..] => (CompareOp::Ge, &rest[2..]),
        [b'=', ..] => (CompareOp::Eq, &rest[1..]),
        [b'<', ..] => (CompareOp::Lt, &rest[1..]),
        [b'>', ..] => (CompareOp::Gt, &rest[1..]),
        _ => return Err(format!("`{clause}` has no comparison operator")),
    };
    let path = path.trim();
    if path.is_empty() {
        return Err(format!("`{clause}` has no field path"));
    }
    Ok(ColumnPredicate::new(path, op, parse_scalar(raw.trim())))
}

fn parse_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Json>(raw) {
        Ok(json @ (Json::Bool(_) | Json::Number(_) | Json::String(_))) => {
            Value::from_json(json).unwrap_or_else(|| Value::Str(raw.to_string()))
        }
        _ => Value::Str(raw.to_string()),
    }
}

/// Hooks that veto every write.
pub fn read_only_hooks() -> HookRegistry {
    let mut hooks = HookRegistry::new();
    for op in [Operation::Store, Operation::Delete] {
        hooks.before(op, |_| HookDecision::veto("opened read-only"));
    }
    hooks
}

// ── tests ────────────────────────────────────────────────────────────
