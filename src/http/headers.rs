use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};

use crate::error::InterceptError;

/// Ordered, multi-valued header collection.
///
/// Names are stored lowercase. HTTP/2 pseudo-headers (`:authority`, `:path`, ...) can not be
/// represented: every write path refuses a colon-prefixed name with `BadHeader`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCollection {
    entries: Vec<(HeaderName, HeaderValue)>,
}

fn header_name(name: &str) -> Result<HeaderName, InterceptError> {
    if name.starts_with(':') {
        return Err(InterceptError::BadHeader(format!(
            "pseudo-header `{name}` can not be forwarded"
        )));
    }

    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| InterceptError::BadHeader(format!("invalid header name `{name}`")))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, InterceptError> {
    HeaderValue::from_str(value)
        .map_err(|_| InterceptError::BadHeader(format!("invalid value for header `{name}`")))
}

impl HeaderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        Self {
            entries: map
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every value of `name` with `value`.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<(), InterceptError> {
        let header = header_name(name)?;
        let value = header_value(name, value)?;
        self.insert_value(header, value);
        Ok(())
    }

    pub fn append(&mut self, name: &str, value: &str) -> Result<(), InterceptError> {
        let header = header_name(name)?;
        let value = header_value(name, value)?;
        self.entries.push((header, value));
        Ok(())
    }

    pub fn insert_value(&mut self, name: HeaderName, value: HeaderValue) {
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || *n != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// First value of `name` that is valid text.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .find_map(|(_, v)| v.to_str().ok())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_all(name).next().is_some()
    }

    /// Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(n, _)| !n.as_str().eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            map.append(name.clone(), value.clone());
        }
        map
    }

    /// JSON view: one key per name, a string for a single value, an array otherwise.
    /// Values that are not valid text are left out.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (name, value) in &self.entries {
            let Ok(text) = value.to_str() else { continue };
            let text = Value::String(text.to_owned());

            match map.get_mut(name.as_str()) {
                None => {
                    map.insert(name.as_str().to_owned(), text);
                }
                Some(Value::Array(values)) => values.push(text),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, text]);
                }
            }
        }
        map
    }

    /// Inverse of [`HeaderCollection::to_json`]. `null` drops the header; numbers and booleans
    /// are written as their textual form.
    pub fn from_json(map: &Map<String, Value>) -> Result<Self, InterceptError> {
        let mut headers = HeaderCollection::new();

        for (name, value) in map {
            let header = header_name(name)?;
            match value {
                Value::Null => {
                    headers.remove(name);
                }
                Value::Array(values) => {
                    headers.remove(name);
                    for value in values {
                        let text = scalar_text(name, value)?;
                        headers
                            .entries
                            .push((header.clone(), header_value(name, &text)?));
                    }
                }
                scalar => {
                    let text = scalar_text(name, scalar)?;
                    headers.insert_value(header, header_value(name, &text)?);
                }
            }
        }

        Ok(headers)
    }
}

fn scalar_text(name: &str, value: &Value) -> Result<String, InterceptError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(InterceptError::BadHeader(format!(
            "header `{name}` must be a string or an array of strings"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pseudo_headers_are_refused() {
        let mut headers = HeaderCollection::new();
        assert!(matches!(
            headers.insert(":authority", "example.com"),
            Err(InterceptError::BadHeader(_))
        ));
        assert!(matches!(
            headers.append(":path", "/"),
            Err(InterceptError::BadHeader(_))
        ));
        assert!(headers.is_empty());

        let passthrough = json!({ ":method": "GET" });
        assert!(matches!(
            HeaderCollection::from_json(passthrough.as_object().unwrap()),
            Err(InterceptError::BadHeader(_))
        ));
    }

    #[test]
    fn test_case_insensitive_access() {
        let mut headers = HeaderCollection::new();
        headers.insert("Etag", "\"abc\"").unwrap();
        headers.append("Set-Cookie", "a=1").unwrap();
        headers.append("set-cookie", "b=2").unwrap();

        assert_eq!(headers.get("ETAG"), Some("\"abc\""));
        assert_eq!(headers.get_all("Set-Cookie").count(), 2);
        assert!(headers.remove("etag"));
        assert!(!headers.contains("Etag"));
        assert!(!headers.remove("etag"));
    }

    #[test]
    fn test_value_outlives_lookup_name() {
        let mut headers = HeaderCollection::new();
        headers.insert("content-type", "text/plain").unwrap();

        let value = {
            let name = String::from("Content-Type");
            headers.get(&name)
        };
        assert_eq!(value, Some("text/plain"));
    }

    #[test]
    fn test_insert_replaces_every_value_in_place() {
        let mut headers = HeaderCollection::new();
        headers.append("accept", "text/html").unwrap();
        headers.append("x-a", "1").unwrap();
        headers.append("accept", "text/plain").unwrap();
        headers.insert("accept", "*/*").unwrap();

        let names: Vec<_> = headers.iter().map(|(n, v)| (n.as_str(), v.to_str().unwrap())).collect();
        assert_eq!(names, vec![("accept", "*/*"), ("x-a", "1")]);
    }

    #[test]
    fn test_json_view() {
        let mut headers = HeaderCollection::new();
        headers.append("host", "example.com").unwrap();
        headers.append("set-cookie", "a=1").unwrap();
        headers.append("set-cookie", "b=2").unwrap();

        let json = headers.to_json();
        assert_eq!(
            Value::Object(json.clone()),
            json!({ "host": "example.com", "set-cookie": ["a=1", "b=2"] })
        );
        assert_eq!(HeaderCollection::from_json(&json).unwrap(), headers);

        let edited = json!({ "host": "example.com", "x-limit": 3, "set-cookie": null });
        let edited = HeaderCollection::from_json(edited.as_object().unwrap()).unwrap();
        assert_eq!(edited.get("x-limit"), Some("3"));
        assert!(!edited.contains("set-cookie"));
    }

    #[test]
    fn test_header_map_conversion() {
        let mut map = HeaderMap::new();
        map.append("vary", HeaderValue::from_static("accept"));
        map.append("vary", HeaderValue::from_static("origin"));

        let headers = HeaderCollection::from_header_map(&map);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.to_header_map(), map);
    }
}
