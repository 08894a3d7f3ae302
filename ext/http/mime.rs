// Copyright 2026 the Cinder authors. MIT license.

/// Parsed `type/subtype+suffix; parameter=value; …` media type. A bare `*`
/// expands to `*/*`; parameter values lose surrounding quotes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MimeType {
  pub type_: String,
  pub sub_type: String,
  pub suffix: String,
  pub parameters: Vec<(String, String)>,
}

impl MimeType {
  pub fn parse(mime_type: &str) -> MimeType {
    if mime_type.is_empty() {
      return MimeType::default();
    }

    let mut parts = mime_type.split(';');
    let full_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let full_type = if full_type == "*" {
      "*/*".to_string()
    } else {
      full_type
    };

    let mut parameters = Vec::new();
    for item in parts {
      let item = item.trim();
      if item.is_empty() {
        continue;
      }
      match item.split_once('=') {
        Some((key, value)) => parameters.push((
          key.trim().to_ascii_lowercase(),
          value.trim().trim_matches('"').to_string(),
        )),
        None => {
          parameters.push((item.to_ascii_lowercase(), String::new()));
        }
      }
    }

    let (type_, sub_type) = match full_type.split_once('/') {
      Some((type_, sub_type)) => (type_.to_string(), sub_type.to_string()),
      None => (full_type, String::new()),
    };
    let (sub_type, suffix) = match sub_type.split_once('+') {
      Some((sub_type, suffix)) => (sub_type.to_string(), suffix.to_string()),
      None => (sub_type, String::new()),
    };

    MimeType {
      type_,
      sub_type,
      suffix,
      parameters,
    }
  }

  pub fn parameter(&self, name: &str) -> Option<&str> {
    self
      .parameters
      .iter()
      .find(|(key, _)| key == name)
      .map(|(_, value)| value.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_all_components() {
    let mime = MimeType::parse("Application/JSON+Feed; Charset=\"utf-8\"");
    assert_eq!(mime.type_, "application");
    assert_eq!(mime.sub_type, "json");
    assert_eq!(mime.suffix, "feed");
    assert_eq!(mime.parameter("charset"), Some("utf-8"));
  }

  #[test]
  fn star_expands() {
    let mime = MimeType::parse("*");
    assert_eq!(mime.type_, "*");
    assert_eq!(mime.sub_type, "*");
  }

  #[test]
  fn multipart_boundary() {
    let mime =
      MimeType::parse("multipart/form-data; boundary=----abc123; x");
    assert_eq!(mime.type_, "multipart");
    assert_eq!(mime.parameter("boundary"), Some("----abc123"));
    assert_eq!(mime.parameter("x"), Some(""));
  }

  #[test]
  fn empty_input() {
    let mime = MimeType::parse("");
    assert_eq!(mime.type_, "");
    assert!(mime.parameters.is_empty());
  }
}
