// Copyright 2026 the Cinder authors. MIT license.

use bytes::Bytes;
use cinder_url::form_urlencode;

use crate::error::HttpError;
use crate::headers::Headers;
use crate::multipart::MultipartWriter;
use crate::multipart::Payload;

/// Value of one form field. Text-only forms serialize as
/// `application/x-www-form-urlencoded`; any binary or file field forces the
/// whole form into `multipart/form-data`.
#[derive(Clone, Debug)]
pub enum FormValue {
  Text(String),
  Json(serde_json::Value),
  Bytes(Bytes),
  File {
    content: Bytes,
    file_name: String,
    content_type: Option<String>,
  },
}

#[derive(Clone, Debug)]
struct FormField {
  name: String,
  value: FormValue,
  headers: Headers,
}

/// The serialized form of a [`FormData`].
pub enum GeneratedForm {
  UrlEncoded {
    body: Bytes,
    content_type: String,
  },
  Multipart(MultipartWriter),
}

/// Builder for request form bodies.
#[derive(Clone, Debug, Default)]
pub struct FormData {
  fields: Vec<FormField>,
  force_multipart: bool,
  quote_fields: bool,
}

impl FormData {
  pub fn new() -> FormData {
    FormData {
      fields: Vec::new(),
      force_multipart: false,
      quote_fields: true,
    }
  }

  /// Multipart output even when every field is plain text.
  pub fn multipart() -> FormData {
    FormData {
      force_multipart: true,
      ..FormData::new()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  pub fn add_field(&mut self, name: impl Into<String>, value: FormValue) {
    self.add_field_with_headers(name, value, Headers::new());
  }

  pub fn add_field_with_headers(
    &mut self,
    name: impl Into<String>,
    value: FormValue,
    headers: Headers,
  ) {
    self.fields.push(FormField {
      name: name.into(),
      value,
      headers,
    });
  }

  fn is_multipart(&self) -> bool {
    self.force_multipart
      || self.fields.iter().any(|field| {
        matches!(field.value, FormValue::Bytes(_) | FormValue::File { .. })
      })
  }

  /// Serializes the accumulated fields.
  pub fn generate_form(&self) -> Result<GeneratedForm, HttpError> {
    if !self.is_multipart() {
      let pairs: Vec<(String, String)> = self
        .fields
        .iter()
        .map(|field| {
          let value = match &field.value {
            FormValue::Text(text) => text.clone(),
            FormValue::Json(value) => value.to_string(),
            // Unreachable shapes are filtered by `is_multipart`.
            FormValue::Bytes(_) | FormValue::File { .. } => String::new(),
          };
          (field.name.clone(), value)
        })
        .collect();
      return Ok(GeneratedForm::UrlEncoded {
        body: Bytes::from(form_urlencode(&pairs).into_bytes()),
        content_type: "application/x-www-form-urlencoded".to_string(),
      });
    }

    let mut writer = MultipartWriter::new("form-data", None);
    for field in &self.fields {
      let mut payload = match &field.value {
        FormValue::Text(text) => Payload::text(text),
        FormValue::Json(value) => Payload::json(value),
        FormValue::Bytes(bytes) => Payload::bytes(bytes.clone()),
        FormValue::File {
          content,
          content_type,
          ..
        } => {
          let payload = Payload::bytes(content.clone());
          match content_type {
            Some(content_type) => {
              payload.with_content_type(content_type.clone())
            }
            None => payload,
          }
        }
      };
      payload.headers.extend(field.headers.clone());

      let mut parameters =
        vec![("name".to_string(), field.name.clone())];
      if let FormValue::File { file_name, .. } = &field.value {
        parameters.push(("file_name".to_string(), file_name.clone()));
      }
      payload.set_content_disposition(
        "form-data",
        &parameters,
        self.quote_fields,
      )?;
      writer.append(payload)?;
    }
    Ok(GeneratedForm::Multipart(writer))
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn text_fields_urlencode() {
    let mut form = FormData::new();
    form.add_field("key one", FormValue::Text("value one".into()));
    form.add_field("k", FormValue::Text("a&b".into()));
    match form.generate_form().unwrap() {
      GeneratedForm::UrlEncoded { body, content_type } => {
        assert_eq!(content_type, "application/x-www-form-urlencoded");
        assert_eq!(&body[..], b"key%20one=value%20one&k=a%26b");
      }
      GeneratedForm::Multipart(_) => panic!("expected urlencoded form"),
    }
  }

  #[test]
  fn file_fields_force_multipart() {
    let mut form = FormData::new();
    form.add_field("note", FormValue::Text("hello".into()));
    form.add_field(
      "upload",
      FormValue::File {
        content: Bytes::from_static(b"\x00\x01\x02"),
        file_name: "data.bin".into(),
        content_type: Some("application/octet-stream".into()),
      },
    );
    match form.generate_form().unwrap() {
      GeneratedForm::Multipart(writer) => {
        let wire = String::from_utf8_lossy(&writer.serialize()).into_owned();
        assert!(wire.contains("name=\"note\""));
        assert!(wire.contains("filename=\"data.bin\""));
        assert!(wire.contains("application/octet-stream"));
      }
      GeneratedForm::UrlEncoded { .. } => panic!("expected multipart form"),
    }
  }

  #[test]
  fn json_field_serializes_inline() {
    let mut form = FormData::new();
    form.add_field(
      "payload",
      FormValue::Json(serde_json::json!({"a": 1})),
    );
    match form.generate_form().unwrap() {
      GeneratedForm::UrlEncoded { body, .. } => {
        assert_eq!(
          String::from_utf8(body.to_vec()).unwrap(),
          "payload=%7B%22a%22%3A1%7D"
        );
      }
      GeneratedForm::Multipart(_) => panic!("expected urlencoded form"),
    }
  }
}
