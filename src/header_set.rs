//! Case-insensitive, multi-valued header map.

use std::fmt;

/// Header map from lowercased name to an ordered list of values.
///
/// Names keep their insertion order. Internally every entry is a list; [`get`]
/// presents a single-element list as a scalar.
///
/// [`get`]: HeaderSet::get
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, Vec<String>)>,
}

/// Presentation of the values under one header name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    /// Exactly one value.
    Single(&'a str),
    /// Zero, two or more values, in order.
    Multi(&'a [String]),
}

impl<'a> Value<'a> {
    /// The scalar, if this is one.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Value::Single(v) => Some(v),
            Value::Multi(_) => None,
        }
    }

    /// All values as an owned list.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Value::Single(v) => vec![v.to_string()],
            Value::Multi(v) => v.to_vec(),
        }
    }
}

/// Something that can be stored as header values.
pub trait IntoValues {
    /// Convert to the list form.
    fn into_values(self) -> Vec<String>;
}

impl IntoValues for &str {
    fn into_values(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoValues for String {
    fn into_values(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoValues for &String {
    fn into_values(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoValues for Vec<String> {
    fn into_values(self) -> Vec<String> {
        self
    }
}

impl IntoValues for Vec<&str> {
    fn into_values(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoValues for &[String] {
    fn into_values(self) -> Vec<String> {
        self.to_vec()
    }
}

impl IntoValues for Value<'_> {
    fn into_values(self) -> Vec<String> {
        self.to_vec()
    }
}

impl HeaderSet {
    pub fn new() -> Self {
        HeaderSet::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Values under `name`, a scalar when there is exactly one.
    pub fn get(&self, name: &str) -> Option<Value<'_>> {
        self.index_of(name).map(|i| {
            let values = &self.entries[i].1;
            if values.len() == 1 {
                Value::Single(&values[0])
            } else {
                Value::Multi(&values[..])
            }
        })
    }

    /// All values under `name`, empty if absent.
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.index_of(name) {
            Some(i) => &self.entries[i].1[..],
            None => &[],
        }
    }

    /// First value under `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(|v| v.as_str())
    }

    /// Replace whatever is under `name`.
    pub fn insert<V: IntoValues>(&mut self, name: &str, value: V) {
        let values = value.into_values();
        match self.index_of(name) {
            Some(i) => self.entries[i].1 = values,
            None => self.entries.push((name.to_ascii_lowercase(), values)),
        }
    }

    /// Merge `value` into what is under `name`.
    ///
    /// Existing values come first, new ones are appended in order. An empty
    /// list adds nothing to an existing entry.
    pub fn merge<V: IntoValues>(&mut self, name: &str, value: V) {
        let mut values = value.into_values();
        match self.index_of(name) {
            Some(i) => self.entries[i].1.append(&mut values),
            None => self.entries.push((name.to_ascii_lowercase(), values)),
        }
    }

    /// Merge every entry of `other` into this set.
    pub fn merge_all(&mut self, other: &HeaderSet) {
        for (name, values) in other.iter() {
            self.merge(name, values);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.index_of(name).map(|i| self.entries.remove(i).1)
    }

    /// Iterate names (lowercased) and their values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), &v[..]))
    }

    /// Collect from an `http` header map. Values that are not visible ASCII
    /// are dropped.
    pub fn from_http(headers: &http::HeaderMap) -> Self {
        let mut set = HeaderSet::new();
        for (name, value) in headers {
            match value.to_str() {
                Ok(v) => set.merge(name.as_str(), v),
                Err(e) => debug!("Dropping header value ({}): {}", name, e),
            }
        }
        set
    }

    /// Convert to an `http` header map, one entry per value.
    pub fn to_http(&self) -> http::HeaderMap {
        let mut map = http::HeaderMap::with_capacity(self.entries.len());
        for (name, values) in self.iter() {
            let name = match http::header::HeaderName::from_bytes(name.as_bytes()) {
                Ok(n) => n,
                Err(e) => {
                    debug!("Dropping bad header name ({}): {}", name, e);
                    continue;
                }
            };
            for value in values {
                match http::header::HeaderValue::from_str(value) {
                    Ok(v) => {
                        map.append(name.clone(), v);
                    }
                    Err(e) => debug!("Dropping bad header value ({}): {}", name, e),
                }
            }
        }
        map
    }
}

impl<'a, V: IntoValues> std::iter::FromIterator<(&'a str, V)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (&'a str, V)>>(iter: I) -> Self {
        let mut set = HeaderSet::new();
        for (k, v) in iter {
            set.merge(k, v);
        }
        set
    }
}

impl fmt::Debug for HeaderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}
