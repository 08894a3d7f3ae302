// Copyright 2026 the Cinder authors. MIT license.

use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;

use crate::error::HttpError;

/// attr-char of RFC 5987: everything else is percent-encoded.
const RFC5987_SET: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'!')
  .remove(b'#')
  .remove(b'$')
  .remove(b'&')
  .remove(b'+')
  .remove(b'-')
  .remove(b'.')
  .remove(b'^')
  .remove(b'_')
  .remove(b'`')
  .remove(b'|')
  .remove(b'~');

fn is_token(value: &str) -> bool {
  !value.is_empty()
    && value.bytes().all(|byte| {
      matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-'
        | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
    })
}

fn is_us_ascii_printable(value: &str) -> bool {
  value.bytes().all(|byte| byte == b'\t' || (0x20..0x7f).contains(&byte))
}

fn escape_quoted(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for character in value.chars() {
    if matches!(character, '"' | '\\') {
      out.push('\\');
    }
    out.push(character);
  }
  out
}

/// Builds a `Content-Disposition` header value.
///
/// ASCII parameter values are emitted as quoted-strings with backslash
/// escapes; anything else switches to the RFC 5987 `key*=utf-8''…` form.
/// The conventional `file_name` key is spelled `filename` on the wire.
pub fn build_content_disposition_header(
  disposition_type: &str,
  parameters: &[(String, String)],
  quote_fields: bool,
) -> Result<String, HttpError> {
  if !is_token(disposition_type) {
    return Err(HttpError::payload(format!(
      "bad content disposition type: {disposition_type:?}"
    )));
  }
  if parameters.is_empty() {
    return Ok(disposition_type.to_string());
  }

  let mut out = String::from(disposition_type);
  for (key, value) in parameters {
    let key = if key == "file_name" { "filename" } else { key };
    if !is_token(key) {
      return Err(HttpError::payload(format!(
        "bad content disposition parameter: {key:?} = {value:?}"
      )));
    }
    out.push_str("; ");
    if quote_fields {
      if is_us_ascii_printable(value) {
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_quoted(value));
        out.push('"');
      } else {
        out.push_str(key);
        out.push_str("*=utf-8''");
        out.push_str(&utf8_percent_encode(value, RFC5987_SET).to_string());
      }
    } else {
      out.push_str(key);
      out.push_str("=\"");
      out.push_str(&escape_quoted(value));
      out.push('"');
    }
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_fields_are_quoted() {
    let header = build_content_disposition_header(
      "form-data",
      &[("name".to_string(), "field".to_string())],
      true,
    )
    .unwrap();
    assert_eq!(header, "form-data; name=\"field\"");
  }

  #[test]
  fn file_name_key_is_rewritten() {
    let header = build_content_disposition_header(
      "attachment",
      &[("file_name".to_string(), "report.pdf".to_string())],
      true,
    )
    .unwrap();
    assert_eq!(header, "attachment; filename=\"report.pdf\"");
  }

  #[test]
  fn non_ascii_switches_to_rfc5987() {
    let header = build_content_disposition_header(
      "attachment",
      &[("file_name".to_string(), "naïve.txt".to_string())],
      true,
    )
    .unwrap();
    assert_eq!(header, "attachment; filename*=utf-8''na%C3%AFve.txt");
  }

  #[test]
  fn quotes_are_escaped() {
    let header = build_content_disposition_header(
      "form-data",
      &[("name".to_string(), "say \"hi\"".to_string())],
      false,
    )
    .unwrap();
    assert_eq!(header, "form-data; name=\"say \\\"hi\\\"\"");
  }

  #[test]
  fn bad_type_is_rejected() {
    assert!(build_content_disposition_header("form data", &[], true).is_err());
  }
}
