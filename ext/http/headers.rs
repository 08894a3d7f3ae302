// Copyright 2026 the Cinder authors. MIT license.

/// A case-insensitive multi-value header map. Entries keep the spelling
/// and the order they were inserted with; lookups compare names
/// case-insensitively.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
  entries: Vec<(String, String)>,
}

impl Headers {
  pub fn new() -> Headers {
    Headers {
      entries: Vec::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }

  /// First value stored under `name`.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  /// Every value stored under `name`, in insertion order.
  pub fn get_all(&self, name: &str) -> Vec<&str> {
    self
      .entries
      .iter()
      .filter(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
      .collect()
  }

  /// Appends a value, keeping earlier values for the same name.
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.entries.push((name.into(), value.into()));
  }

  /// Drops every value for `name`, then appends the given one.
  pub fn replace(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
    self.entries.push((name, value.into()));
  }

  /// Removes and returns every value for `name`.
  pub fn pop_all(&mut self, name: &str) -> Vec<String> {
    let mut removed = Vec::new();
    self.entries.retain(|(key, value)| {
      if key.eq_ignore_ascii_case(name) {
        removed.push(value.clone());
        false
      } else {
        true
      }
    });
    removed
  }

  /// Removes and returns the first value for `name`, dropping the rest.
  pub fn pop(&mut self, name: &str) -> Option<String> {
    self.pop_all(name).into_iter().next()
  }

  /// Inserts only when `name` is absent.
  pub fn setdefault(
    &mut self,
    name: impl Into<String>,
    value: impl Into<String>,
  ) {
    let name = name.into();
    if !self.contains(&name) {
      self.entries.push((name, value.into()));
    }
  }

  pub fn extend(
    &mut self,
    other: impl IntoIterator<Item = (String, String)>,
  ) {
    self.entries.extend(other);
  }

  /// Folded-header support: glues a continuation fragment onto the most
  /// recently inserted value with a single joining space.
  pub(crate) fn extend_last_value(&mut self, extra: &str) {
    if let Some((_, value)) = self.entries.last_mut() {
      if !value.is_empty() && !extra.is_empty() {
        value.push(' ');
      }
      value.push_str(extra);
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .entries
      .iter()
      .map(|(name, value)| (name.as_str(), value.as_str()))
  }
}

impl IntoIterator for Headers {
  type Item = (String, String);
  type IntoIter = std::vec::IntoIter<(String, String)>;

  fn into_iter(self) -> Self::IntoIter {
    self.entries.into_iter()
  }
}

impl FromIterator<(String, String)> for Headers {
  fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
    Headers {
      entries: iter.into_iter().collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lookup_is_case_insensitive_and_preserves_spelling() {
    let mut headers = Headers::new();
    headers.append("Content-Type", "text/plain");
    headers.append("X-Custom", "1");
    headers.append("x-custom", "2");

    assert_eq!(headers.get("content-type"), Some("text/plain"));
    assert_eq!(headers.get_all("X-CUSTOM"), vec!["1", "2"]);
    let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["Content-Type", "X-Custom", "x-custom"]);
  }

  #[test]
  fn replace_and_pop() {
    let mut headers = Headers::new();
    headers.append("Accept", "a");
    headers.append("accept", "b");
    headers.replace("Accept", "c");
    assert_eq!(headers.get_all("accept"), vec!["c"]);
    assert_eq!(headers.pop_all("ACCEPT"), vec!["c".to_string()]);
    assert!(headers.is_empty());
  }

  #[test]
  fn setdefault_only_fills_gaps() {
    let mut headers = Headers::new();
    headers.setdefault("Server", "cinder");
    headers.setdefault("server", "other");
    assert_eq!(headers.get_all("Server"), vec!["cinder"]);
  }
}
