use {
    std::collections::HashMap,
    serde::{Serialize, Deserialize},
    chrono::{DateTime, Utc},
};

/// Normalized inbound request, handed to every function invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Header names are stored lower-cased.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl Event {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    pub fn with_query_string(mut self, raw: &str) -> Self {
        self.query = parse_query(raw);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Repeated header names are joined with ", ".
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.entry(name.to_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// Parses `application/x-www-form-urlencoded` query strings. Last value wins on duplicate keys.
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut query = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }

        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        if key.is_empty() {
            continue;
        }

        query.insert(key, decode_component(value));
    }
    query
}

fn decode_component(component: &str) -> String {
    let component = component.replace('+', " ");
    match urlencoding::decode(&component) {
        Ok(v) => v.into_owned(),
        Err(_) => component,
    }
}

/// Invocation metadata passed next to the [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub function: String,
    pub invocation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Context {
    pub fn new(function: impl Into<String>, invocation_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            function: function.into(),
            invocation_id: invocation_id.into(),
            timestamp,
        }
    }
}
