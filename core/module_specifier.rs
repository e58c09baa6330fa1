// Copyright 2025 the Gantry authors. MIT license.

use url::ParseError;
use url::Url;

/// Error indicating the reason resolving a module specifier failed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ModuleResolutionError {
  #[error("invalid URL: {0}")]
  InvalidUrl(#[source] ParseError),
}

use ModuleResolutionError::*;

/// Resolved module specifier
pub type ModuleSpecifier = Url;

/// Resolves a specifier against a base URL. Absolute specifiers parse on
/// their own; anything else is joined onto the base, so bare specifiers
/// resolve as sibling paths of the referrer.
pub fn resolve_import(
  specifier: &str,
  base: &Url,
) -> Result<ModuleSpecifier, ModuleResolutionError> {
  match Url::parse(specifier) {
    Ok(url) => Ok(url),
    Err(ParseError::RelativeUrlWithoutBase) => {
      base.join(specifier).map_err(InvalidUrl)
    }
    Err(err) => Err(InvalidUrl(err)),
  }
}

const fn is_unreserved(byte: u8) -> bool {
  byte.is_ascii_alphanumeric()
    || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

fn hex_value(byte: u8) -> Option<u8> {
  match byte {
    b'0'..=b'9' => Some(byte - b'0'),
    b'a'..=b'f' => Some(byte - b'a' + 10),
    b'A'..=b'F' => Some(byte - b'A' + 10),
    _ => None,
  }
}

/// Normalizes percent-encoding in the URL path: escapes of unreserved
/// characters are decoded, all remaining escapes have their hex digits
/// uppercased. Idempotent, so normalized URLs compare equal no matter how
/// many times they pass through.
pub fn normalize_path(url: &Url) -> Url {
  let path = url.path();
  if !path.contains('%') {
    return url.clone();
  }

  // The serialized path is ASCII; anything outside is already escaped.
  let bytes = path.as_bytes();
  let mut out = String::with_capacity(path.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' && i + 2 < bytes.len() {
      if let (Some(hi), Some(lo)) =
        (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
      {
        let decoded = (hi << 4) | lo;
        if is_unreserved(decoded) {
          out.push(decoded as char);
        } else {
          out.push('%');
          out.push(bytes[i + 1].to_ascii_uppercase() as char);
          out.push(bytes[i + 2].to_ascii_uppercase() as char);
        }
        i += 3;
        continue;
      }
    }
    out.push(bytes[i] as char);
    i += 1;
  }

  let mut normalized = url.clone();
  normalized.set_path(&out);
  normalized
}

/// Clones the URL with query and fragment removed. The inner registry is
/// always consulted with this form so that URL variants of the same module
/// share a single catalog entry.
pub fn without_search_and_fragment(url: &Url) -> Url {
  let mut stripped = url.clone();
  stripped.set_query(None);
  stripped.set_fragment(None);
  stripped
}
