//! Pure transformations applied to cached values before a write resolves.
//!
//! A [`Patch`] takes the current value of a cache entry and returns the next
//! one. It never touches the store itself: the engine computes every next
//! value first and only then writes them, so a failing patch leaves nothing
//! half-applied.
//!
//! Lists are JSON arrays of objects carrying an `id` field; single entities are
//! JSON objects. Values of any other shape pass through unchanged.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

type PatchFn = dyn Fn(&Value) -> Result<Value> + Send + Sync;

/// A pure `old value -> new value` transformation.
#[derive(Clone)]
pub struct Patch {
  name: String,
  apply: Arc<PatchFn>,
}

impl fmt::Debug for Patch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Patch").field("name", &self.name).finish()
  }
}

impl Patch {
  pub fn new<F>(name: impl Into<String>, apply: F) -> Self
  where
    F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      apply: Arc::new(apply),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Compute the next value. Any failure is reported as a programmer error.
  pub fn apply(&self, value: &Value) -> Result<Value> {
    (self.apply)(value).map_err(|e| match e {
      Error::Programmer(_) => e,
      other => Error::programmer(format!("patch `{}` failed: {}", self.name, other)),
    })
  }

  /// Apply `self`, then `next`.
  pub fn then(self, next: Patch) -> Patch {
    let name = format!("{}+{}", self.name, next.name);
    Patch::new(name, move |value| next.apply(&self.apply(value)?))
  }

  /// Drop the list item whose `id` equals `id`.
  pub fn remove_item(id: impl ToString) -> Patch {
    let id = id.to_string();
    Patch::new(format!("remove_item({})", id), move |value| {
      Ok(match value {
        Value::Array(items) => Value::Array(
          items
            .iter()
            .filter(|item| item_id(item).as_deref() != Some(id.as_str()))
            .cloned()
            .collect(),
        ),
        other => other.clone(),
      })
    })
  }

  /// Append an item to a list.
  pub fn insert_item(item: Value) -> Patch {
    Patch::new("insert_item", move |value| {
      Ok(match value {
        Value::Array(items) => {
          let mut next = items.clone();
          next.push(item.clone());
          Value::Array(next)
        }
        other => other.clone(),
      })
    })
  }

  /// Set the field at JSON `pointer` (e.g. `/pricing/is_free`) on the item with
  /// `id`, whether it sits in a list or is the cached entity itself.
  pub fn set_field(id: impl ToString, pointer: impl Into<String>, field: Value) -> Patch {
    let id = id.to_string();
    let pointer = pointer.into();
    Patch::new(format!("set_field({}, {})", id, pointer), move |value| {
      let matches = |item: &Value| item_id(item).as_deref() == Some(id.as_str());
      match value {
        Value::Array(items) => items
          .iter()
          .map(|item| -> Result<Value> {
            let mut item = item.clone();
            if matches(&item) {
              set_pointer(&mut item, &pointer, field.clone())?;
            }
            Ok(item)
          })
          .collect::<Result<Vec<_>>>()
          .map(Value::Array),
        Value::Object(_) if matches(value) => {
          let mut next = value.clone();
          set_pointer(&mut next, &pointer, field.clone())?;
          Ok(next)
        }
        other => Ok(other.clone()),
      }
    })
  }

  /// Reorder a list from an explicit `item id -> new position` map.
  ///
  /// Mapped items sort by their given position, unmapped items by their
  /// current index; ties go to the item that came first. A partial map is
  /// therefore still deterministic.
  pub fn reorder<K: ToString>(positions: impl IntoIterator<Item = (K, i64)>) -> Patch {
    Self::build_reorder(positions, None)
  }

  /// Like [`reorder`](Self::reorder), then rewrite `order_field` on every
  /// object to its new index.
  pub fn reorder_with_field<K: ToString>(
    positions: impl IntoIterator<Item = (K, i64)>,
    order_field: impl Into<String>,
  ) -> Patch {
    Self::build_reorder(positions, Some(order_field.into()))
  }

  fn build_reorder<K: ToString>(
    positions: impl IntoIterator<Item = (K, i64)>,
    order_field: Option<String>,
  ) -> Patch {
    let positions: BTreeMap<String, i64> = positions
      .into_iter()
      .map(|(k, p)| (k.to_string(), p))
      .collect();
    Patch::new("reorder", move |value| {
      let Value::Array(items) = value else {
        return Ok(value.clone());
      };
      let mut next = reorder_items(items, &positions);
      if let Some(field) = &order_field {
        for (index, item) in next.iter_mut().enumerate() {
          if let Value::Object(map) = item {
            map.insert(field.clone(), Value::from(index as i64));
          }
        }
      }
      Ok(Value::Array(next))
    })
  }

  /// Typed transformation: deserialize, transform, serialize.
  pub fn typed<T, F>(name: impl Into<String>, transform: F) -> Patch
  where
    T: Serialize + DeserializeOwned,
    F: Fn(T) -> Result<T> + Send + Sync + 'static,
  {
    Patch::new(name, move |value| {
      let typed: T = serde_json::from_value(value.clone())?;
      Ok(serde_json::to_value(transform(typed)?)?)
    })
  }
}

/// Stable reorder of `items` by `(position, original index)`.
pub fn reorder_items(items: &[Value], positions: &BTreeMap<String, i64>) -> Vec<Value> {
  let mut keyed: Vec<(i64, usize, &Value)> = items
    .iter()
    .enumerate()
    .map(|(index, item)| {
      let position = item_id(item)
        .and_then(|id| positions.get(&id).copied())
        .unwrap_or(index as i64);
      (position, index, item)
    })
    .collect();
  keyed.sort_by_key(|(position, index, _)| (*position, *index));
  keyed.into_iter().map(|(_, _, item)| item.clone()).collect()
}

/// The `id` of a list item, stringified so numeric and string ids compare alike.
pub fn item_id(item: &Value) -> Option<String> {
  match item.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn set_pointer(target: &mut Value, pointer: &str, field: Value) -> Result<()> {
  let tokens: Vec<String> = pointer
    .strip_prefix('/')
    .ok_or_else(|| Error::programmer(format!("invalid JSON pointer `{}`", pointer)))?
    .split('/')
    .map(|t| t.replace("~1", "/").replace("~0", "~"))
    .collect();

  let (last, parents) = tokens
    .split_last()
    .ok_or_else(|| Error::programmer("empty JSON pointer"))?;

  let mut current = target;
  for token in parents {
    let object = current
      .as_object_mut()
      .ok_or_else(|| Error::programmer(format!("`{}` does not point into an object", pointer)))?;
    current = object
      .entry(token.clone())
      .or_insert_with(|| Value::Object(Map::new()));
  }

  current
    .as_object_mut()
    .ok_or_else(|| Error::programmer(format!("`{}` does not point into an object", pointer)))?
    .insert(last.clone(), field);
  Ok(())
}
